use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::{BatchReport, BatchSummary};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::upsert::{ConflictResolution, UpsertStatus};

pub const AUDIT_FILE_NAME: &str = "ingest-audit.jsonl";

/// One JSON line per ingestion run in the data directory. Older runs roll
/// over into numbered generations (`ingest-audit.1.jsonl` is the newest).
#[derive(Clone)]
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
    max_bytes: u64,
    keep_generations: usize,
    write_guard: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub finished_at: DateTime<Utc>,
    pub resolution: ConflictResolution,
    /// False when the operator stopped the run part way.
    pub completed: bool,
    pub summary: BatchSummary,
    pub items: Vec<ItemEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEntry {
    pub external_id: String,
    pub status: UpsertStatus,
    pub wrote: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunEntry {
    pub fn from_report(
        report: &BatchReport,
        resolution: ConflictResolution,
        completed: bool,
    ) -> Self {
        let items = report
            .outcomes
            .iter()
            .map(|outcome| ItemEntry {
                external_id: outcome.external_id.clone(),
                status: outcome.status,
                wrote: !outcome.changeset.added.is_empty()
                    || !outcome.changeset.updated.is_empty(),
                error: outcome.error.clone(),
            })
            .collect();
        Self {
            finished_at: Utc::now(),
            resolution,
            completed,
            summary: report.summary.clone(),
            items,
        }
    }
}

impl AuditLog {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            enabled: config.audit_enabled,
            path: data_dir.join(AUDIT_FILE_NAME),
            max_bytes: config.audit_max_bytes,
            keep_generations: config.audit_keep_files,
            write_guard: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_run(
        &self,
        report: &BatchReport,
        resolution: ConflictResolution,
        completed: bool,
    ) -> AppResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let entry = RunEntry::from_report(report, resolution, completed);
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.write_guard.lock();
        self.roll_over_if_full(line.len() as u64)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    fn roll_over_if_full(&self, incoming: u64) -> AppResult<()> {
        let current = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if current == 0 || current + incoming <= self.max_bytes {
            return Ok(());
        }

        if self.keep_generations == 0 {
            fs::remove_file(&self.path)?;
            return Ok(());
        }
        let oldest = self.generation(self.keep_generations);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.keep_generations).rev() {
            let from = self.generation(n);
            if from.exists() {
                fs::rename(&from, self.generation(n + 1))?;
            }
        }
        fs::rename(&self.path, self.generation(1))?;
        debug!(bytes = current, path = %self.path.display(), "audit log rolled over");
        Ok(())
    }

    fn generation(&self, n: usize) -> PathBuf {
        self.path.with_extension(format!("{n}.jsonl"))
    }
}
