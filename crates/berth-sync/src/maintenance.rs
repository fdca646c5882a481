//! Periodic housekeeping: old job purge, stale job recovery and deactivation of past sailings.

use std::sync::Arc;
use std::time::Duration;

use berth_store::{PersistError, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceOptions {
    pub job_retention_days: i64,
    pub lock_ttl: Duration,
    pub deactivate_after_days: i64,
}

impl MaintenanceOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            job_retention_days: config.job_retention_days,
            lock_ttl: config.lock_ttl,
            deactivate_after_days: config.deactivate_after_days,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub purged_jobs: u64,
    pub reset_jobs: u64,
    pub deactivated_sailings: u64,
}

pub struct Maintenance {
    store: Arc<dyn Store>,
    options: MaintenanceOptions,
}

impl Maintenance {
    pub fn new(store: Arc<dyn Store>, options: MaintenanceOptions) -> Self {
        Self { store, options }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, PersistError> {
        let retention = chrono::Duration::days(self.options.job_retention_days.max(0));
        let purged_jobs = self.store.purge_finished_before(now - retention).await?;

        let stale_after = chrono::Duration::from_std(self.options.lock_ttl * 5)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let reset_jobs = self.store.reset_stale_active(now - stale_after).await?;

        let cutoff = (now - chrono::Duration::days(self.options.deactivate_after_days.max(0))).date_naive();
        let deactivated_sailings = self.store.deactivate_before(cutoff).await?;

        let report = MaintenanceReport {
            purged_jobs,
            reset_jobs,
            deactivated_sailings,
        };
        info!(
            purged_jobs,
            reset_jobs,
            deactivated_sailings,
            "maintenance finished"
        );
        Ok(report)
    }
}
