use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// Extra wait added past the window edge so a retry does not land exactly
/// on the boundary and get pushed back again.
const BOUNDARY_BUFFER: Duration = Duration::from_millis(10);

/// Accepted request timestamps inside the trailing window, oldest first.
#[derive(Debug, Default)]
pub struct RateWindow {
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.stamps.front() {
            if now.duration_since(*oldest) >= window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn oldest(&self) -> Option<Instant> {
        self.stamps.front().copied()
    }

    fn len(&self) -> usize {
        self.stamps.len()
    }
}

/// Sliding-window admission control for outbound API calls.
///
/// Clones share one window, so a client and the futures it spawns for
/// retries account against the same quota. Independent ingestion runs
/// must construct their own limiter.
#[derive(Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    state: Arc<AsyncMutex<RateWindow>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> AppResult<Self> {
        if max_requests == 0 {
            return Err(AppError::Config(
                "rate limit must allow at least one request per window".into(),
            ));
        }
        if window.is_zero() {
            return Err(AppError::Config("rate limit window must be non-zero".into()));
        }
        Ok(Self {
            max_requests: max_requests as usize,
            window,
            state: Arc::new(AsyncMutex::new(RateWindow::default())),
        })
    }

    /// Waits until one more request fits in the window, then consumes a slot.
    pub async fn admit(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            state.evict_expired(now, self.window);
            if state.len() < self.max_requests {
                state.stamps.push_back(now);
                return Ok(());
            }

            let Some(oldest) = state.oldest() else {
                return Err(AppError::Config("rate window is full but empty".into()));
            };
            let wait = self
                .window
                .saturating_sub(now.duration_since(oldest))
                + BOUNDARY_BUFFER;
            debug!(
                in_window = state.len(),
                delay_ms = wait.as_millis() as u64,
                "rate limit reached; waiting for window to slide"
            );
            sleep(wait).await;
        }
    }

    pub async fn current_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.evict_expired(Instant::now(), self.window);
        state.len()
    }

    pub async fn reset(&self) {
        self.state.lock().await.stamps.clear();
    }
}
