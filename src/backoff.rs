use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub factor: f64,
    /// Symmetric jitter as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based), without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let scaled = base_ms * self.factor.max(1.0).powi(exponent);
        Duration::from_millis(scaled.min(max_ms).max(0.0) as u64)
    }
}

/// Retries a fallible async operation with exponential backoff and jitter.
///
/// The attempt counter lives inside each `execute` call; the executor only
/// holds configuration and the jitter source.
#[derive(Clone)]
pub struct BackoffExecutor {
    policy: BackoffPolicy,
    rng: Arc<Mutex<StdRng>>,
}

impl BackoffExecutor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    pub fn with_rng(policy: BackoffPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let nominal = self.policy.nominal_delay(attempt).as_millis() as f64;
        let spread = nominal * self.policy.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            self.rng.lock().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis((nominal + offset).max(0.0).round() as u64)
    }

    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute_with(operation, |attempt, err: &E| {
            warn!(attempt, error = %err, "operation failed; backing off");
        })
        .await
    }

    /// Like [`execute`](Self::execute) but reports each retry to `on_retry`
    /// with the one-based number of the attempt that failed.
    pub async fn execute_with<T, E, F, Fut, R>(
        &self,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(u32, &E),
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.policy.max_retries => {
                    let delay = self.calculate_delay(attempt);
                    attempt += 1;
                    on_retry(attempt, &err);
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::errors::AppError;

    fn policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            max_retries,
            factor: 2.0,
            jitter: 0.25,
        }
    }

    #[test]
    fn nominal_delay_grows_until_capped() {
        let policy = policy(10);
        let delays: Vec<u64> = (0..8)
            .map(|attempt| policy.nominal_delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000, 1_000, 1_000]);
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let executor = BackoffExecutor::with_rng(policy(10), StdRng::seed_from_u64(7));
        for attempt in 0..12 {
            let nominal = executor.policy().nominal_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let delay = executor.calculate_delay(attempt).as_millis() as f64;
                assert!(delay >= (nominal * 0.75).floor(), "{delay} below {nominal}");
                assert!(delay <= (nominal * 1.25).ceil(), "{delay} above {nominal}");
            }
        }
    }

    #[test]
    fn zero_base_delay_never_goes_negative() {
        let mut zero = policy(3);
        zero.base_delay = Duration::ZERO;
        let executor = BackoffExecutor::with_rng(zero, StdRng::seed_from_u64(1));
        assert_eq!(executor.calculate_delay(0), Duration::ZERO);
        assert_eq!(executor.calculate_delay(5), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_and_returns_last_error() {
        let executor = BackoffExecutor::with_rng(policy(3), StdRng::seed_from_u64(2));
        let calls = AtomicU32::new(0);
        let mut retries = Vec::new();

        let result: Result<(), AppError> = executor
            .execute_with(
                || {
                    let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(AppError::InvalidInput(format!("boom {call}"))) }
                },
                |attempt, _err| retries.push(attempt),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(retries, vec![1, 2, 3]);
        match result {
            Err(AppError::InvalidInput(message)) => assert_eq!(message, "boom 4"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_after_success() {
        let executor = BackoffExecutor::with_rng(policy(5), StdRng::seed_from_u64(3));
        let calls = AtomicU32::new(0);

        let value = executor
            .execute(|| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(AppError::Config("transient".into()))
                    } else {
                        Ok(call)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_runs_once() {
        let executor = BackoffExecutor::with_rng(policy(0), StdRng::seed_from_u64(4));
        let calls = AtomicU32::new(0);
        let result: Result<(), AppError> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::Config("nope".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
