//! Cron wiring for scheduled bulk syncs, audits and maintenance.

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_core::PipelineMode;
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::SyncServices;

/// Builds the cron scheduler, or `None` when `BERTH_SCHEDULER_ENABLED` is off or no cron is set.
pub async fn build_scheduler(services: Arc<SyncServices>, shutdown: CancellationToken) -> Result<Option<JobScheduler>> {
    let config = services.config();
    if !config.scheduler_enabled {
        return Ok(None);
    }
    if config.bulk_cron.is_none() && config.audit_cron.is_none() && config.maintenance_cron.is_none() {
        warn!("scheduler enabled but no cron expressions configured");
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    if let Some(cron) = config.bulk_cron.clone() {
        let services = services.clone();
        let shutdown = shutdown.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let services = services.clone();
            let shutdown = shutdown.clone();
            Box::pin(async move {
                match services.store().mode().await {
                    Ok(record) if record.mode == PipelineMode::Paused => {
                        info!("pipeline paused; skipping scheduled bulk sync");
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "could not read pipeline mode; skipping scheduled bulk sync");
                        return;
                    }
                }
                let bulk = services.bulk();
                if let Err(err) = bulk.run_periods(&bulk.default_periods(), &shutdown).await {
                    warn!(error = %err, "scheduled bulk sync failed");
                }
            })
        })
        .with_context(|| format!("creating bulk sync job for cron {cron}"))?;
        sched.add(job).await.context("adding bulk sync job")?;
    }

    if let Some(cron) = config.audit_cron.clone() {
        let services = services.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let services = services.clone();
            Box::pin(async move {
                if let Err(err) = services.auditor().run(services.audit_scope()).await {
                    warn!(error = %err, "scheduled audit failed");
                }
            })
        })
        .with_context(|| format!("creating audit job for cron {cron}"))?;
        sched.add(job).await.context("adding audit job")?;
    }

    if let Some(cron) = config.maintenance_cron.clone() {
        let services = services.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let services = services.clone();
            Box::pin(async move {
                if let Err(err) = services.maintenance().run_once(Utc::now()).await {
                    warn!(error = %err, "scheduled maintenance failed");
                }
            })
        })
        .with_context(|| format!("creating maintenance job for cron {cron}"))?;
        sched.add(job).await.context("adding maintenance job")?;
    }

    Ok(Some(sched))
}
