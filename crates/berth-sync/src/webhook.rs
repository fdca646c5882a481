//! Webhook intake and the per-line worker pool.

use std::sync::Arc;
use std::time::Duration;

use berth_core::{LineId, Period, PipelineMode, RunCounters, WebhookJob};
use berth_store::{PersistError, Store};
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::notify::{Notifier, PipelineEvent};
use crate::pipeline::{BatchOptions, FilePipeline};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("line id must be a positive integer, got {0}")]
    InvalidLineId(i64),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Persists one pending job per accepted event and returns immediately.
#[derive(Clone)]
pub struct WebhookIntake {
    store: Arc<dyn Store>,
}

impl WebhookIntake {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn receive_event(&self, raw_line_id: i64) -> Result<Uuid, IntakeError> {
        let line_id = LineId::new(raw_line_id).ok_or(IntakeError::InvalidLineId(raw_line_id))?;
        let job = WebhookJob::pending(line_id, Utc::now());
        self.store.enqueue(&job).await?;
        info!(job_id = %job.id, line_id = %line_id, "line sync queued");
        Ok(job.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("line {line_id} is being processed by another worker")]
pub struct LockContention {
    pub line_id: LineId,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_count: usize,
    pub lock_ttl: Duration,
    pub requeue_delay: Duration,
    pub lookahead_months: u32,
    pub poll_interval: Duration,
    pub batch: BatchOptions,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lock_ttl: Duration::from_secs(120),
            requeue_delay: Duration::from_secs(5),
            lookahead_months: 24,
            poll_interval: Duration::from_millis(500),
            batch: BatchOptions::default(),
        }
    }
}

impl WorkerOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            worker_count: config.workers,
            lock_ttl: config.lock_ttl,
            requeue_delay: config.requeue_delay,
            lookahead_months: config.lookahead_months,
            batch: BatchOptions {
                batch_size: config.batch_size,
                fetch_concurrency: config.fetch_concurrency.min(config.pool_size.max(1)),
                inter_file_delay: config.inter_file_delay,
                failure_sample_size: config.failure_sample_size,
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done(RunCounters),
    Requeued { reason: String },
    Failed { error: String },
}

pub struct WorkerPool {
    pipeline: Arc<FilePipeline>,
    notifier: Arc<dyn Notifier>,
    options: WorkerOptions,
    /// Lease owner prefix, unique per pool so two processes never share an owner id.
    instance: String,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<FilePipeline>, notifier: Arc<dyn Notifier>, options: WorkerOptions) -> Self {
        Self {
            pipeline,
            notifier,
            options,
            instance: format!("worker-{}-{}", std::process::id(), Uuid::new_v4().simple()),
        }
    }

    pub fn worker_id(&self, n: usize) -> String {
        format!("{}-{n}", self.instance)
    }

    fn store(&self) -> &Arc<dyn Store> {
        self.pipeline.store()
    }

    async fn paused(&self) -> Result<bool, PersistError> {
        Ok(self.store().mode().await?.mode == PipelineMode::Paused)
    }

    /// Claims and runs one job. `None` when paused or nothing is available.
    pub async fn run_next(&self, worker_id: &str) -> Result<Option<(Uuid, JobOutcome)>, PersistError> {
        if self.paused().await? {
            return Ok(None);
        }
        let Some(job) = self.store().claim_next(worker_id, Utc::now()).await? else {
            return Ok(None);
        };
        let span = info_span!("webhook_job", job_id = %job.id, line_id = %job.line_id, worker = worker_id);
        let outcome = self.run_job(&job, worker_id).instrument(span).await?;
        Ok(Some((job.id, outcome)))
    }

    async fn requeue(&self, job: &WebhookJob, reason: String) -> Result<JobOutcome, PersistError> {
        let delay = chrono::Duration::from_std(self.options.requeue_delay).unwrap_or_else(|_| chrono::Duration::seconds(5));
        self.store().requeue(job.id, Utc::now() + delay, &reason).await?;
        info!(reason = %reason, "job re-queued");
        Ok(JobOutcome::Requeued { reason })
    }

    async fn run_job(&self, job: &WebhookJob, worker_id: &str) -> Result<JobOutcome, PersistError> {
        if self.paused().await? {
            return self.requeue(job, "pipeline paused".to_string()).await;
        }
        let store = self.store();
        let ttl = self.options.lock_ttl;
        if !store.try_acquire(job.line_id, worker_id, ttl).await? {
            let contention = LockContention { line_id: job.line_id };
            return self.requeue(job, contention.to_string()).await;
        }

        let periods = Period::current().through(self.options.lookahead_months);
        let result = {
            let run = self.pipeline.run_scoped(job.line_id, &periods, &self.options.batch);
            tokio::pin!(run);
            let mut renew = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
            renew.tick().await;
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = renew.tick() => match store.renew(job.line_id, worker_id, ttl).await {
                        Ok(true) => debug!("lease renewed"),
                        Ok(false) => warn!("lease lost while running; another worker may take this line"),
                        Err(err) => warn!(error = %err, "lease renewal failed"),
                    },
                }
            }
        };

        if let Err(err) = store.release(job.line_id, worker_id).await {
            warn!(error = %err, "lease release failed; it will expire");
        }

        match result {
            Ok(tally) => {
                store.complete(job.id, &tally.counters).await?;
                info!(
                    seen = tally.counters.files_seen,
                    succeeded = tally.counters.succeeded,
                    failed = tally.counters.failed,
                    "job done"
                );
                Ok(JobOutcome::Done(tally.counters))
            }
            Err(err) => {
                let error = err.to_string();
                store.fail(job.id, &error, None).await?;
                warn!(error = %error, kind = %err.source.kind(), "job failed");
                self.notifier
                    .notify(&PipelineEvent::WebhookJobFailed {
                        job_id: job.id,
                        line_id: job.line_id,
                        error: error.clone(),
                    })
                    .await;
                Ok(JobOutcome::Failed { error })
            }
        }
    }

    /// Runs `worker_count` claim loops until `cancel` fires. Jobs in flight finish first.
    pub async fn run_until_cancelled(self: Arc<Self>, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(self.options.worker_count);
        for n in 0..self.options.worker_count.max(1) {
            let pool = self.clone();
            let cancel = cancel.clone();
            let worker_id = self.worker_id(n);
            handles.push(tokio::spawn(async move { pool.worker_loop(&worker_id, cancel).await }));
        }
        info!(workers = handles.len(), "worker pool started");
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }

    async fn worker_loop(&self, worker_id: &str, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let idle = match self.run_next(worker_id).await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    warn!(worker = worker_id, error = %err, "queue access failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::recording::RecordingNotifier;
    use crate::pipeline::fixtures::*;
    use berth_core::JobStatus;
    use berth_remote::{MemoryRemote, RemoteError};
    use berth_store::{JobQueue, LineLocks, MemoryStore, ModeStore};

    fn remote_with_lines(lines: &[i32]) -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::default().with_fetch_delay(Duration::from_millis(30)));
        for line in lines {
            for file in ["a", "b", "c"] {
                put(
                    &remote,
                    Period::current(),
                    *line,
                    412,
                    file,
                    payload(&format!("S{line}{file}"), "A1", "500"),
                );
            }
        }
        remote
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            worker_count: 2,
            lock_ttl: Duration::from_secs(30),
            requeue_delay: Duration::from_secs(60),
            lookahead_months: 0,
            poll_interval: Duration::from_millis(5),
            batch: fast_options(),
        }
    }

    fn pool(remote: Arc<MemoryRemote>, store: Arc<MemoryStore>, notifier: Arc<RecordingNotifier>) -> WorkerPool {
        WorkerPool::new(Arc::new(pipeline(remote, store)), notifier, options())
    }

    #[tokio::test]
    async fn intake_rejects_non_positive_line_ids() {
        let store = Arc::new(MemoryStore::default());
        let intake = WebhookIntake::new(store.clone());
        assert!(matches!(intake.receive_event(0).await, Err(IntakeError::InvalidLineId(0))));
        assert!(matches!(intake.receive_event(-4).await, Err(IntakeError::InvalidLineId(-4))));
        assert!(store.jobs().is_empty());

        let id = intake.receive_event(16).await.unwrap();
        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.line_id.get(), 16);
    }

    #[tokio::test]
    async fn job_runs_scoped_sync_and_completes() {
        let remote = remote_with_lines(&[16, 21]);
        let store = Arc::new(MemoryStore::default());
        let pool = pool(remote.clone(), store.clone(), Arc::new(RecordingNotifier::default()));
        let id = WebhookIntake::new(store.clone()).receive_event(16).await.unwrap();

        let (ran, outcome) = pool.run_next("w1").await.unwrap().unwrap();
        assert_eq!(ran, id);
        let counters = match outcome {
            JobOutcome::Done(counters) => counters,
            other => panic!("expected done, got {other:?}"),
        };
        assert_eq!(counters.succeeded, 3);
        assert_eq!(store.sailing_count(), 3);
        assert!(remote.fetched_paths().iter().all(|p| p.contains("/16/")));
        assert_eq!(store.job(id).await.unwrap().unwrap().status, JobStatus::Done);
        assert_eq!(store.lock_owner(LineId::new(16).unwrap()), None);
    }

    #[tokio::test]
    async fn same_line_jobs_never_overlap() {
        let remote = remote_with_lines(&[16]);
        let store = Arc::new(MemoryStore::default());
        let pool = Arc::new(pool(remote.clone(), store.clone(), Arc::new(RecordingNotifier::default())));
        let intake = WebhookIntake::new(store.clone());
        intake.receive_event(16).await.unwrap();
        intake.receive_event(16).await.unwrap();

        let (a, b) = tokio::join!(pool.run_next("w1"), pool.run_next("w2"));
        let outcomes = [a.unwrap().unwrap().1, b.unwrap().unwrap().1];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, JobOutcome::Done(_))).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, JobOutcome::Requeued { .. }))
                .count(),
            1
        );
        assert_eq!(remote.max_concurrent_fetches_for_line(16), 1);
        let pending: Vec<_> = store
            .jobs()
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].available_at > Utc::now());
    }

    #[tokio::test]
    async fn different_lines_run_concurrently() {
        let remote = remote_with_lines(&[16, 21]);
        let store = Arc::new(MemoryStore::default());
        let pool = Arc::new(pool(remote.clone(), store.clone(), Arc::new(RecordingNotifier::default())));
        let intake = WebhookIntake::new(store.clone());
        intake.receive_event(16).await.unwrap();
        intake.receive_event(21).await.unwrap();

        let (a, b) = tokio::join!(pool.run_next("w1"), pool.run_next("w2"));
        assert!(matches!(a.unwrap().unwrap().1, JobOutcome::Done(_)));
        assert!(matches!(b.unwrap().unwrap().1, JobOutcome::Done(_)));
        assert_eq!(remote.max_concurrent_fetches(), 2);
        assert_eq!(store.sailing_count(), 6);
    }

    #[tokio::test]
    async fn paused_pipeline_claims_nothing() {
        let remote = remote_with_lines(&[16]);
        let store = Arc::new(MemoryStore::default());
        let pool = pool(remote, store.clone(), Arc::new(RecordingNotifier::default()));
        store.set_mode(PipelineMode::Paused, Some("maintenance")).await.unwrap();
        let id = WebhookIntake::new(store.clone()).receive_event(16).await.unwrap();

        assert!(pool.run_next("w1").await.unwrap().is_none());
        assert_eq!(store.job(id).await.unwrap().unwrap().status, JobStatus::Pending);

        store.set_mode(PipelineMode::Active, None).await.unwrap();
        assert!(pool.run_next("w1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn held_lease_requeues_instead_of_failing() {
        let remote = remote_with_lines(&[16]);
        let store = Arc::new(MemoryStore::default());
        let pool = pool(remote, store.clone(), Arc::new(RecordingNotifier::default()));
        let line = LineId::new(16).unwrap();
        store.try_acquire(line, "other-process", Duration::from_secs(30)).await.unwrap();
        let id = WebhookIntake::new(store.clone()).receive_event(16).await.unwrap();

        let (_, outcome) = pool.run_next("w1").await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Requeued { .. }));
        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(store.lock_owner(line).as_deref(), Some("other-process"));
    }

    #[tokio::test]
    async fn startup_failure_fails_job_and_notifies() {
        let remote = remote_with_lines(&[16]);
        remote.fail_list(
            format!("feed/{}/16", Period::current()),
            RemoteError::Auth("530 login incorrect".into()),
        );
        let store = Arc::new(MemoryStore::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let pool = pool(remote, store.clone(), notifier.clone());
        let id = WebhookIntake::new(store.clone()).receive_event(16).await.unwrap();

        let (_, outcome) = pool.run_next("w1").await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Failed { .. }));
        assert_eq!(store.job(id).await.unwrap().unwrap().status, JobStatus::Failed);
        assert!(matches!(
            notifier.events().as_slice(),
            [PipelineEvent::WebhookJobFailed { .. }]
        ));
        assert_eq!(store.lock_owner(LineId::new(16).unwrap()), None);
    }

    #[tokio::test]
    async fn pools_sharing_a_store_never_overlap_on_a_line() {
        let remote = remote_with_lines(&[16]);
        let store = Arc::new(MemoryStore::default());
        let options = WorkerOptions {
            worker_count: 1,
            requeue_delay: Duration::from_millis(10),
            ..options()
        };
        let first = Arc::new(WorkerPool::new(
            Arc::new(pipeline(remote.clone(), store.clone())),
            Arc::new(RecordingNotifier::default()),
            options.clone(),
        ));
        let second = Arc::new(WorkerPool::new(
            Arc::new(pipeline(remote.clone(), store.clone())),
            Arc::new(RecordingNotifier::default()),
            options,
        ));
        assert_ne!(first.worker_id(0), second.worker_id(0));

        let intake = WebhookIntake::new(store.clone());
        intake.receive_event(16).await.unwrap();
        intake.receive_event(16).await.unwrap();

        let cancel = CancellationToken::new();
        let a = tokio::spawn(first.run_until_cancelled(cancel.clone()));
        let b = tokio::spawn(second.run_until_cancelled(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(10), async {
            while store.jobs().iter().any(|j| j.status != JobStatus::Done) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(remote.max_concurrent_fetches_for_line(16), 1);
        assert_eq!(store.lock_owner(LineId::new(16).unwrap()), None);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_cancel() {
        let remote = remote_with_lines(&[16, 21]);
        let store = Arc::new(MemoryStore::default());
        let pool = Arc::new(pool(remote, store.clone(), Arc::new(RecordingNotifier::default())));
        let intake = WebhookIntake::new(store.clone());
        intake.receive_event(16).await.unwrap();
        intake.receive_event(21).await.unwrap();

        let cancel = CancellationToken::new();
        let running = tokio::spawn(pool.clone().run_until_cancelled(cancel.clone()));
        while store.jobs().iter().any(|j| j.status != JobStatus::Done) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        running.await.unwrap();
        assert_eq!(store.sailing_count(), 6);
    }
}
