pub mod audit;
pub mod backoff;
pub mod batch;
pub mod config;
pub mod confirm;
pub mod db;
pub mod errors;
pub mod ingestion;
pub mod places;
pub mod rate_limit;
pub mod store;
pub mod timezone;
pub mod upsert;
pub mod venue;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rusqlite::Connection as SqlConnection;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::audit::AuditLog;
use crate::batch::BatchOrchestrator;
use crate::config::{AppConfig, PublicAppConfig};
use crate::confirm::WriteConfirmation;
use crate::db::{bootstrap, DatabaseContext};
use crate::errors::AppResult;
use crate::ingestion::IngestionPipeline;
use crate::places::PlacesDirectoryClient;
use crate::store::{SqliteVenueStore, VenueStore};
use crate::upsert::{ConflictResolution, UpsertEngine};

pub use crate::batch::{BatchReport, BatchSummary};
pub use crate::errors::AppError;
pub use crate::upsert::UpsertOutcome;

/// Everything one ingestion run needs, opened from a data directory.
pub struct IngestContext {
    db: Arc<Mutex<SqlConnection>>,
    db_path: PathBuf,
    config: AppConfig,
    audit: AuditLog,
}

#[derive(Debug, Serialize)]
pub struct IngestHealth {
    pub db_path: String,
    pub venue_count: usize,
    pub audit_path: String,
    pub config: PublicAppConfig,
}

impl IngestContext {
    pub fn initialize<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        let DatabaseContext { connection, path } =
            bootstrap(data_dir, &config.database_file_name)?;
        let audit = AuditLog::new(data_dir, &config)?;

        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            db_path: path,
            config,
            audit,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn VenueStore> {
        Arc::new(SqliteVenueStore::new(Arc::clone(&self.db)))
    }

    pub fn orchestrator(
        &self,
        resolution: ConflictResolution,
        confirmation: Option<Arc<dyn WriteConfirmation>>,
    ) -> BatchOrchestrator {
        let engine = UpsertEngine::new(self.store(), resolution);
        let orchestrator = BatchOrchestrator::new(engine, self.config.item_delay())
            .with_audit(self.audit.clone());
        match confirmation {
            Some(confirmation) => orchestrator.with_confirmation(confirmation),
            None => orchestrator,
        }
    }

    /// Fails with `AppError::Config` when no places API key is configured.
    pub fn pipeline(
        &self,
        resolution: ConflictResolution,
        confirmation: Option<Arc<dyn WriteConfirmation>>,
    ) -> AppResult<IngestionPipeline> {
        let client = PlacesDirectoryClient::from_config(&self.config)?;
        Ok(IngestionPipeline::new(
            client,
            self.orchestrator(resolution, confirmation),
            self.config.max_hydrated_places,
        ))
    }

    pub fn health(&self) -> AppResult<IngestHealth> {
        Ok(IngestHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            venue_count: self.store().count()?,
            audit_path: self.audit.path().to_string_lossy().to_string(),
            config: self.config.public_profile(),
        })
    }
}

/// Installs the stderr subscriber once; later calls are no-ops.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,venue_ingest=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::test_config;
    use crate::venue::VenueFields;

    #[tokio::test]
    async fn context_wires_store_audit_and_orchestrator() {
        let dir = tempdir().unwrap();
        let ctx = IngestContext::initialize(dir.path(), test_config()).unwrap();

        let report = ctx
            .orchestrator(ConflictResolution::Merge, None)
            .run(&[VenueFields::new("A", "Bar X")])
            .await
            .unwrap();
        assert_eq!(report.summary.inserted, 1);

        let health = ctx.health().unwrap();
        assert_eq!(health.venue_count, 1);
        assert!(health.db_path.ends_with("test.db"));
        assert!(health.audit_path.ends_with(audit::AUDIT_FILE_NAME));
        assert_eq!(std::fs::read_to_string(&health.audit_path).unwrap().lines().count(), 1);
        assert!(!health.config.has_places_api_key);
    }

    #[test]
    fn pipeline_requires_api_key() {
        let dir = tempdir().unwrap();
        let ctx = IngestContext::initialize(dir.path(), test_config()).unwrap();
        assert!(matches!(
            ctx.pipeline(ConflictResolution::Merge, None),
            Err(AppError::Config(_))
        ));
    }
}
