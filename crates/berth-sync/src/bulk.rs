//! Bulk Sync Orchestrator: checkpointed, resumable walks over whole periods.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use berth_core::{FileAttempt, Period, PeriodStatus, RunCounters};
use berth_remote::{FeedFile, LineScope, WalkError};
use berth_store::PersistError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::notify::{Notifier, PipelineEvent};
use crate::pipeline::{BatchOptions, FilePipeline, RunTally};
use crate::report::write_bulk_report;

#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub batch: BatchOptions,
    pub lookahead_months: u32,
    /// Where `reports/{run_id}` directories go; `None` disables report files.
    pub reports_dir: Option<PathBuf>,
}

impl BulkOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch: BatchOptions {
                batch_size: config.batch_size,
                fetch_concurrency: config.fetch_concurrency.min(config.pool_size.max(1)),
                inter_file_delay: config.inter_file_delay,
                failure_sample_size: config.failure_sample_size,
            },
            lookahead_months: config.lookahead_months,
            reports_dir: Some(config.reports_dir.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodReport {
    pub period: Period,
    pub status: PeriodStatus,
    pub tally: RunTally,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// A stop request ended the run before every period finished.
    pub cancelled: bool,
    pub periods: Vec<PeriodReport>,
    pub report_dir: Option<String>,
}

impl BulkRunReport {
    pub fn totals(&self) -> RunCounters {
        let mut total = RunTally::default();
        for period in &self.periods {
            total.merge(period.tally.clone(), 0);
        }
        total.counters
    }

    pub fn partially_failed(&self) -> usize {
        self.periods
            .iter()
            .filter(|p| p.status == PeriodStatus::PartiallyFailed)
            .count()
    }
}

#[derive(Debug, Error)]
pub enum BulkError {
    #[error("bulk sync of {period} could not start: {source}")]
    Startup {
        period: Period,
        #[source]
        source: WalkError,
    },
    #[error("checkpoint update failed: {0}")]
    Persist(#[from] PersistError),
}

pub struct BulkOrchestrator {
    pipeline: Arc<FilePipeline>,
    notifier: Arc<dyn Notifier>,
    options: BulkOptions,
}

impl BulkOrchestrator {
    pub fn new(pipeline: Arc<FilePipeline>, notifier: Arc<dyn Notifier>, options: BulkOptions) -> Self {
        Self {
            pipeline,
            notifier,
            options,
        }
    }

    /// The current month and the configured look-ahead months.
    pub fn default_periods(&self) -> Vec<Period> {
        Period::current().through(self.options.lookahead_months)
    }

    pub async fn run_period(&self, period: Period, cancel: &CancellationToken) -> Result<BulkRunReport, BulkError> {
        self.run_periods(&[period], cancel).await
    }

    /// Runs periods in order, then writes the run report and notifies.
    ///
    /// A period that cannot start is marked `failed` and ends the run. The
    /// report and a `BulkRunFailed` notification still go out before the error
    /// is returned.
    pub async fn run_periods(&self, periods: &[Period], cancel: &CancellationToken) -> Result<BulkRunReport, BulkError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(periods.len());
        let mut cancelled = false;
        let mut failure = None;

        for period in periods {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let span = info_span!("bulk_period", run_id = %run_id, period = %period);
            let period_started = Utc::now();
            let clock = Instant::now();
            match self.sync_period(*period, cancel).instrument(span).await {
                Ok((report, stopped)) => {
                    reports.push(report);
                    if stopped {
                        cancelled = true;
                        break;
                    }
                }
                Err(err) => {
                    warn!(run_id = %run_id, period = %period, error = %err, "bulk period failed");
                    if let Err(mark_err) = self.pipeline.store().set_period_status(*period, PeriodStatus::Failed).await {
                        warn!(period = %period, error = %mark_err, "could not mark period failed");
                    }
                    let mut tally = RunTally::default();
                    if let BulkError::Startup { source, .. } = &err {
                        tally.record_walk_error(source, self.options.batch.failure_sample_size);
                    }
                    reports.push(PeriodReport {
                        period: *period,
                        status: PeriodStatus::Failed,
                        tally,
                        started_at: period_started,
                        finished_at: Utc::now(),
                        elapsed_ms: clock.elapsed().as_millis() as u64,
                    });
                    failure = Some((*period, err));
                    break;
                }
            }
        }

        let mut report = BulkRunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            cancelled,
            periods: reports,
            report_dir: None,
        };

        if let Some(root) = &self.options.reports_dir {
            match write_bulk_report(root, &report).await {
                Ok(dir) => report.report_dir = Some(dir.display().to_string()),
                Err(err) => warn!(run_id = %run_id, error = %format!("{err:#}"), "could not write bulk report"),
            }
        }

        if let Some((period, err)) = failure {
            self.notifier
                .notify(&PipelineEvent::BulkRunFailed {
                    run_id,
                    period,
                    error: err.to_string(),
                    report_dir: report.report_dir.clone(),
                })
                .await;
            return Err(err);
        }

        let totals = report.totals();
        info!(
            run_id = %run_id,
            periods = report.periods.len(),
            seen = totals.files_seen,
            skipped = totals.files_skipped,
            succeeded = totals.succeeded,
            failed = totals.failed,
            cancelled,
            "bulk run finished"
        );
        self.notifier
            .notify(&PipelineEvent::BulkRunCompleted {
                run_id,
                periods: report.periods.iter().map(|p| p.period).collect(),
                counters: totals,
                partially_failed: report.partially_failed(),
                report_dir: report.report_dir.clone(),
            })
            .await;
        Ok(report)
    }

    /// Returns the period report and whether a stop request cut it short.
    async fn sync_period(&self, period: Period, cancel: &CancellationToken) -> Result<(PeriodReport, bool), BulkError> {
        let store = self.pipeline.store();
        let batch_options = &self.options.batch;
        let started_at = Utc::now();
        let clock = Instant::now();

        let checkpoint = store.load_checkpoint(period).await?;
        store.set_period_status(period, PeriodStatus::Listing).await?;

        let mut walker = self.pipeline.walker(period, LineScope::All);
        let mut tally = RunTally::default();
        let mut batch: Vec<FeedFile> = Vec::with_capacity(batch_options.batch_size);
        let mut processing = false;
        let mut stopped = false;

        loop {
            let next = match walker.next().await {
                Ok(next) => next,
                Err(err) if err.startup => return Err(BulkError::Startup { period, source: err }),
                Err(err) => {
                    warn!(path = %err.path, kind = %err.source.kind(), "listing failed; continuing");
                    tally.record_walk_error(&err, batch_options.failure_sample_size);
                    continue;
                }
            };
            if !processing {
                store.set_period_status(period, PeriodStatus::Processing).await?;
                processing = true;
            }
            let done = next.is_none();
            if let Some(file) = next {
                tally.counters.files_seen += 1;
                if checkpoint.was_attempted(&file.feed.to_string()) {
                    tally.counters.files_skipped += 1;
                } else {
                    batch.push(file);
                }
            }
            if !batch.is_empty() && (done || batch.len() >= batch_options.batch_size.max(1)) {
                self.run_batch(period, &mut batch, &mut tally).await?;
                if !done && cancel.is_cancelled() {
                    info!("stop requested; leaving period resumable");
                    stopped = true;
                    break;
                }
            }
            if done {
                break;
            }
        }

        let status = if stopped {
            PeriodStatus::Processing
        } else if tally.has_failures() {
            PeriodStatus::PartiallyFailed
        } else {
            PeriodStatus::Completed
        };
        store.set_period_status(period, status).await?;

        let report = PeriodReport {
            period,
            status,
            tally,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: clock.elapsed().as_millis() as u64,
        };
        info!(
            status = status.as_str(),
            seen = report.tally.counters.files_seen,
            skipped = report.tally.counters.files_skipped,
            failed = report.tally.counters.failed,
            "period finished"
        );
        Ok((report, stopped))
    }

    async fn run_batch(&self, period: Period, batch: &mut Vec<FeedFile>, tally: &mut RunTally) -> Result<(), BulkError> {
        let results = self.pipeline.process_batch(batch, &self.options.batch).await;
        let mut attempts = Vec::with_capacity(batch.len());
        for (file, result) in batch.iter().zip(&results) {
            let path = file.feed.to_string();
            tally.record(&path, result, self.options.batch.failure_sample_size);
            attempts.push(FileAttempt {
                path,
                failure: result.as_ref().err().map(|f| f.kind),
            });
        }
        self.pipeline.store().record_attempts(period, &attempts).await?;
        batch.clear();
        Ok(())
    }
}
