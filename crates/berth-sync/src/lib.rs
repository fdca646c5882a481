//! Orchestration: bulk sync, webhook workers, auditing, maintenance and scheduling.

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_extract::{Normalizer, PriceCorrections};
use berth_remote::{ConnectionManager, FtpConnector, RemoteFs};
use berth_store::{PgStore, Store};
use tracing::info;

pub mod auditor;
pub mod bulk;
pub mod config;
pub mod maintenance;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod webhook;

pub use auditor::{reconstruct, AuditFinding, AuditMode, AuditScope, AuditSummary, AuditVerdict, Auditor, ReconstructError};
pub use bulk::{BulkError, BulkOptions, BulkOrchestrator, BulkRunReport, PeriodReport};
pub use config::{FatalConfigError, SyncConfig};
pub use maintenance::{Maintenance, MaintenanceOptions, MaintenanceReport};
pub use notify::{notifier_from_config, LogNotifier, Notifier, PipelineEvent, SlackNotifier};
pub use pipeline::{BatchOptions, FileFailure, FilePipeline, FileResult, FileSuccess, RunTally};
pub use scheduler::build_scheduler;
pub use webhook::{IntakeError, JobOutcome, LockContention, WebhookIntake, WorkerOptions, WorkerPool};

pub const CRATE_NAME: &str = "berth-sync";

const AUDIT_PAGE_SIZE: usize = 500;

/// The wired-up pipeline components for one process.
pub struct SyncServices {
    config: SyncConfig,
    store: Arc<dyn Store>,
    pipeline: Arc<FilePipeline>,
    notifier: Arc<dyn Notifier>,
}

impl SyncServices {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn Store>,
        remote: Arc<dyn RemoteFs>,
        normalizer: Arc<Normalizer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pipeline = Arc::new(FilePipeline::new(
            remote,
            store.clone(),
            normalizer,
            config.ftp_root.clone(),
        ));
        Self {
            config,
            store,
            pipeline,
            notifier,
        }
    }

    /// Connects PostgreSQL and the FTP pool described by `config`.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        config.validate().context("validating configuration")?;
        let database_url = config.require_database()?.to_string();
        let store = PgStore::connect(&database_url, (config.workers as u32 + 4).max(5))
            .await
            .context("connecting to database")?;
        store.migrate().await?;

        let remote = ConnectionManager::new(FtpConnector::new(config.ftp_config()?), config.pool_config());
        let corrections = PriceCorrections::from_rules_dir(&config.rules_dir)
            .with_context(|| format!("loading price corrections from {}", config.rules_dir.display()))?;
        let notifier = notifier_from_config(config.slack_webhook_url.as_deref());
        info!(
            pool_size = config.pool_size,
            workers = config.workers,
            root = %config.ftp_root,
            "sync services ready"
        );
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(remote),
            Arc::new(Normalizer::new(corrections)),
            notifier,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<FilePipeline> {
        &self.pipeline
    }

    pub fn bulk(&self) -> BulkOrchestrator {
        BulkOrchestrator::new(
            self.pipeline.clone(),
            self.notifier.clone(),
            BulkOptions::from_config(&self.config),
        )
    }

    pub fn intake(&self) -> WebhookIntake {
        WebhookIntake::new(self.store.clone())
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.pipeline.clone(),
            self.notifier.clone(),
            WorkerOptions::from_config(&self.config),
        )
    }

    pub fn auditor(&self) -> Auditor {
        Auditor::new(
            self.store.clone(),
            self.pipeline.normalizer().clone(),
            self.notifier.clone(),
            self.config.audit_tolerance,
            self.config.audit_mode,
        )
    }

    /// A random sample when `BERTH_AUDIT_SAMPLE_SIZE` is set, otherwise every stored sailing.
    pub fn audit_scope(&self) -> AuditScope {
        match self.config.audit_sample_size {
            Some(size) => AuditScope::Sample(size),
            None => AuditScope::All {
                page_size: AUDIT_PAGE_SIZE,
            },
        }
    }

    pub fn maintenance(&self) -> Maintenance {
        Maintenance::new(self.store.clone(), MaintenanceOptions::from_config(&self.config))
    }
}
