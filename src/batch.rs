use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::confirm::{BatchDecision, BatchProposal, ConfirmDecision, WriteConfirmation, WriteProposal};
use crate::errors::{AppError, AppResult};
use crate::store::VenueStore;
use crate::upsert::{Changeset, ProposedAction, UpsertEngine, UpsertOutcome, UpsertStatus};
use crate::venue::{completeness_score, VenueFields};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub success_rate: f64,
}

impl BatchSummary {
    fn tally(&mut self, status: UpsertStatus) {
        self.total += 1;
        match status {
            UpsertStatus::Inserted => self.inserted += 1,
            UpsertStatus::Updated => self.updated += 1,
            UpsertStatus::Skipped => self.skipped += 1,
            UpsertStatus::Error => self.errors += 1,
        }
        self.success_rate = success_rate(self.total - self.errors, self.total);
    }

    /// No item ended in an error.
    pub fn is_clean(&self) -> bool {
        self.errors == 0
    }
}

/// Percentage rounded to two decimals; an empty batch reports 0.
fn success_rate(succeeded: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = succeeded as f64 / total as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<UpsertOutcome>,
    pub changeset: Changeset,
    pub summary: BatchSummary,
}

impl BatchReport {
    fn push(&mut self, outcome: UpsertOutcome) {
        self.changeset.absorb(&outcome.changeset);
        self.summary.tally(outcome.status);
        self.outcomes.push(outcome);
    }
}

/// One unit of batch work. `Unresolved` stands for an identifier the caller
/// already failed to fetch; it is reported as an error without touching the
/// store.
#[derive(Debug, Clone)]
pub enum BatchInput {
    Venue(VenueFields),
    Unresolved { external_id: String, reason: String },
}

impl BatchInput {
    fn external_id(&self) -> &str {
        match self {
            BatchInput::Venue(fields) => &fields.external_id,
            BatchInput::Unresolved { external_id, .. } => external_id,
        }
    }
}

/// Drives inputs through the upsert engine one at a time.
pub struct BatchOrchestrator {
    engine: UpsertEngine,
    item_delay: Duration,
    confirmation: Option<Arc<dyn WriteConfirmation>>,
    audit: Option<AuditLog>,
}

impl BatchOrchestrator {
    pub fn new(engine: UpsertEngine, item_delay: Duration) -> Self {
        Self {
            engine,
            item_delay,
            confirmation: None,
            audit: None,
        }
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn WriteConfirmation>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn engine(&self) -> &UpsertEngine {
        &self.engine
    }

    pub async fn run(&self, venues: &[VenueFields]) -> AppResult<BatchReport> {
        let inputs: Vec<_> = venues.iter().cloned().map(BatchInput::Venue).collect();
        self.run_inputs(inputs).await
    }

    /// Processes every input and returns the report. Individual failures
    /// are folded into the report; only an operator quit or abort ends the
    /// run early, as `AppError::Cancelled`.
    pub async fn run_inputs(&self, inputs: Vec<BatchInput>) -> AppResult<BatchReport> {
        if let Some(confirmation) = &self.confirmation {
            let proposal = self.propose(&inputs);
            if !proposal.is_empty() && confirmation.confirm_batch(&proposal)? == BatchDecision::Abort {
                info!(items = inputs.len(), "batch aborted by operator");
                return Err(AppError::Cancelled);
            }
        }

        let mut report = BatchReport::default();
        for (idx, input) in inputs.iter().enumerate() {
            if idx > 0 && !self.item_delay.is_zero() {
                sleep(self.item_delay).await;
            }

            let outcome = match input {
                BatchInput::Venue(fields) => match self.process(fields) {
                    Ok(outcome) => outcome,
                    Err(AppError::Cancelled) => {
                        info!(processed = idx, "batch stopped by operator");
                        self.audit_run(&report, false);
                        return Err(AppError::Cancelled);
                    }
                    Err(err) => UpsertOutcome::failed(&fields.external_id, err),
                },
                BatchInput::Unresolved {
                    external_id,
                    reason,
                } => UpsertOutcome::failed(external_id, reason),
            };

            if outcome.status == UpsertStatus::Error {
                warn!(
                    external_id = %outcome.external_id,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "item failed"
                );
            }
            report.push(outcome);
        }

        let summary = &report.summary;
        info!(
            total = summary.total,
            inserted = summary.inserted,
            updated = summary.updated,
            skipped = summary.skipped,
            errors = summary.errors,
            success_rate = summary.success_rate,
            "batch complete"
        );
        self.audit_run(&report, true);
        Ok(report)
    }

    fn propose(&self, inputs: &[BatchInput]) -> BatchProposal {
        let mut proposal = BatchProposal::default();
        for input in inputs {
            let BatchInput::Venue(fields) = input else {
                continue;
            };
            match guarded(&fields.external_id, || self.engine.plan(fields)) {
                Ok(action) => proposal.push(input.external_id(), action),
                Err(err) => warn!(?err, external_id = %fields.external_id, "could not plan write"),
            }
        }
        proposal
    }

    /// Runs one upsert, asking the operator first when confirmation is on.
    /// Panics inside the engine or store are contained to this item.
    fn process(&self, fields: &VenueFields) -> AppResult<UpsertOutcome> {
        if let Some(confirmation) = &self.confirmation {
            let action = guarded(&fields.external_id, || self.engine.plan(fields))?;
            if action != ProposedAction::Skip && !self.confirm(confirmation.as_ref(), fields, action)? {
                let existing = self
                    .engine
                    .store()
                    .get_by_external_id(&fields.external_id)
                    .ok()
                    .flatten();
                info!(external_id = %fields.external_id, "write skipped by operator");
                return Ok(UpsertOutcome::skipped(&fields.external_id, existing));
            }
        }
        guarded(&fields.external_id, || self.engine.upsert(fields))
    }

    /// `Ok(true)` to write, `Ok(false)` to skip, `Cancelled` on quit.
    fn confirm(
        &self,
        confirmation: &dyn WriteConfirmation,
        fields: &VenueFields,
        action: ProposedAction,
    ) -> AppResult<bool> {
        let proposal = WriteProposal {
            fields,
            action,
            completeness: completeness_score(fields),
        };
        loop {
            match confirmation.confirm_write(&proposal)? {
                ConfirmDecision::Proceed => return Ok(true),
                ConfirmDecision::Skip => return Ok(false),
                ConfirmDecision::ShowMore => {
                    confirmation.show_details(fields)?;
                    continue;
                }
                ConfirmDecision::Quit => return Err(AppError::Cancelled),
            }
        }
    }

    /// Audit failures are logged; the batch result stands.
    fn audit_run(&self, report: &BatchReport, completed: bool) {
        if let Some(audit) = &self.audit {
            if let Err(err) = audit.record_run(report, self.engine.resolution(), completed) {
                warn!(?err, path = %audit.path().display(), "failed to append audit entry");
            }
        }
    }
}

fn guarded<T>(external_id: &str, call: impl FnOnce() -> AppResult<T>) -> AppResult<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => Err(AppError::InvalidInput(format!(
            "upsert of {external_id} panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
