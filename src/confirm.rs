//! Operator confirmation hooks for the batch orchestrator.
//!
//! The orchestrator asks a [`WriteConfirmation`] before each write and once
//! per batch. [`AutoConfirm`] approves everything; [`TerminalConfirm`] asks a
//! person at the terminal.

use dialoguer::{Confirm, Input};
use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::upsert::ProposedAction;
use crate::venue::VenueFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmDecision {
    Proceed,
    Skip,
    ShowMore,
    Quit,
}

impl ConfirmDecision {
    /// Accepts the full word or its first letter, case-insensitively.
    pub fn parse(answer: &str) -> Option<Self> {
        match answer.trim().to_ascii_lowercase().as_str() {
            "p" | "proceed" | "y" | "yes" => Some(ConfirmDecision::Proceed),
            "s" | "skip" | "n" | "no" => Some(ConfirmDecision::Skip),
            "m" | "more" | "show" | "showmore" | "show more" => Some(ConfirmDecision::ShowMore),
            "q" | "quit" => Some(ConfirmDecision::Quit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    Proceed,
    Abort,
}

/// One candidate write as shown to the operator.
#[derive(Debug, Serialize)]
pub struct WriteProposal<'a> {
    pub fields: &'a VenueFields,
    pub action: ProposedAction,
    pub completeness: u8,
}

/// All candidate writes in a batch plus running totals by action.
#[derive(Debug, Default, Serialize)]
pub struct BatchProposal {
    pub actions: Vec<(String, ProposedAction)>,
    pub inserts: usize,
    pub overwrites: usize,
    pub skips: usize,
}

impl BatchProposal {
    pub fn push(&mut self, external_id: impl Into<String>, action: ProposedAction) {
        match action {
            ProposedAction::Insert => self.inserts += 1,
            ProposedAction::Overwrite(_) => self.overwrites += 1,
            ProposedAction::Skip => self.skips += 1,
        }
        self.actions.push((external_id.into(), action));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

pub trait WriteConfirmation: Send + Sync {
    fn confirm_batch(&self, proposal: &BatchProposal) -> AppResult<BatchDecision>;
    fn confirm_write(&self, proposal: &WriteProposal<'_>) -> AppResult<ConfirmDecision>;
    fn show_details(&self, fields: &VenueFields) -> AppResult<()>;
}

pub struct AutoConfirm;

impl WriteConfirmation for AutoConfirm {
    fn confirm_batch(&self, _proposal: &BatchProposal) -> AppResult<BatchDecision> {
        Ok(BatchDecision::Proceed)
    }

    fn confirm_write(&self, _proposal: &WriteProposal<'_>) -> AppResult<ConfirmDecision> {
        Ok(ConfirmDecision::Proceed)
    }

    fn show_details(&self, _fields: &VenueFields) -> AppResult<()> {
        Ok(())
    }
}

/// Prompts on stderr/stdin.
#[derive(Default)]
pub struct TerminalConfirm;

impl TerminalConfirm {
    pub fn new() -> Self {
        Self
    }
}

impl WriteConfirmation for TerminalConfirm {
    fn confirm_batch(&self, proposal: &BatchProposal) -> AppResult<BatchDecision> {
        eprintln!();
        eprintln!(
            "{} venues: {} insert, {} overwrite, {} skip",
            proposal.len(),
            proposal.inserts,
            proposal.overwrites,
            proposal.skips
        );
        for (external_id, action) in &proposal.actions {
            eprintln!("  {action:<8} {external_id}");
        }

        let proceed = prompt(|| {
            Confirm::new()
                .with_prompt("Apply this batch?")
                .default(true)
                .interact()
        })?;
        Ok(if proceed {
            BatchDecision::Proceed
        } else {
            BatchDecision::Abort
        })
    }

    fn confirm_write(&self, proposal: &WriteProposal<'_>) -> AppResult<ConfirmDecision> {
        eprintln!();
        eprintln!(
            "{} ({}) -> {} [completeness {}%]",
            proposal.fields.name, proposal.fields.external_id, proposal.action, proposal.completeness
        );
        if let Some(address) = &proposal.fields.address {
            eprintln!("  {address}");
        }

        loop {
            let answer: String = prompt(|| {
                Input::new()
                    .with_prompt("[p]roceed / [s]kip / [m]ore / [q]uit")
                    .interact_text()
            })?;
            match ConfirmDecision::parse(&answer) {
                Some(decision) => return Ok(decision),
                None => {
                    eprintln!("unrecognised answer: {answer:?}");
                    continue;
                }
            }
        }
    }

    fn show_details(&self, fields: &VenueFields) -> AppResult<()> {
        eprintln!("{}", serde_json::to_string_pretty(fields)?);
        Ok(())
    }
}

/// Runs a blocking terminal prompt from inside the batch loop. Must be
/// called on the multi-threaded runtime, which `main` starts.
fn prompt<T>(ask: impl FnOnce() -> dialoguer::Result<T>) -> AppResult<T> {
    tokio::task::block_in_place(ask).map_err(prompt_error)
}

fn prompt_error(err: dialoguer::Error) -> AppError {
    AppError::Io(std::io::Error::other(err.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::upsert::ConflictResolution;

    #[test]
    fn parses_short_and_long_answers() {
        assert_eq!(ConfirmDecision::parse("p"), Some(ConfirmDecision::Proceed));
        assert_eq!(ConfirmDecision::parse(" Skip "), Some(ConfirmDecision::Skip));
        assert_eq!(ConfirmDecision::parse("M"), Some(ConfirmDecision::ShowMore));
        assert_eq!(ConfirmDecision::parse("quit"), Some(ConfirmDecision::Quit));
        assert_eq!(ConfirmDecision::parse("maybe"), None);
        assert_eq!(ConfirmDecision::parse(""), None);
    }

    #[test]
    fn batch_proposal_tallies_actions() {
        let mut proposal = BatchProposal::default();
        proposal.push("A", ProposedAction::Insert);
        proposal.push("B", ProposedAction::Overwrite(ConflictResolution::Merge));
        proposal.push("C", ProposedAction::Skip);
        proposal.push("D", ProposedAction::Insert);

        assert_eq!(proposal.len(), 4);
        assert_eq!(proposal.inserts, 2);
        assert_eq!(proposal.overwrites, 1);
        assert_eq!(proposal.skips, 1);
    }

    #[test]
    fn auto_confirm_always_proceeds() {
        let fields = VenueFields::new("A", "Bar X");
        let proposal = WriteProposal {
            fields: &fields,
            action: ProposedAction::Insert,
            completeness: 18,
        };
        assert_eq!(
            AutoConfirm.confirm_write(&proposal).unwrap(),
            ConfirmDecision::Proceed
        );
        assert_eq!(
            AutoConfirm.confirm_batch(&BatchProposal::default()).unwrap(),
            BatchDecision::Proceed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prompts_run_off_the_async_workers() {
        assert_eq!(prompt(|| Ok(7)).unwrap(), 7);

        let failed = prompt::<bool>(|| {
            Err(dialoguer::Error::IO(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stdin closed",
            )))
        });
        assert!(matches!(failed, Err(AppError::Io(_))));
    }
}
