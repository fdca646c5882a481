//! Shared fetch -> normalize -> persist path used by bulk runs, webhook jobs and reconstruction.

use std::sync::Arc;
use std::time::Duration;

use berth_core::{FailureKind, FailureSample, LineId, Period, RunCounters};
use berth_extract::{ExtractContext, Normalizer};
use berth_remote::{FeedFile, LineScope, PeriodWalker, RemoteError, RemoteFs, WalkError};
use berth_store::{Store, UpsertOutcome};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct FileFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl FileFailure {
    fn from_error(kind: FailureKind, err: impl std::fmt::Display) -> Self {
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSuccess {
    pub outcome: UpsertOutcome,
    pub anomalies: usize,
}

pub type FileResult = Result<FileSuccess, FileFailure>;

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub fetch_concurrency: usize,
    pub inter_file_delay: Duration,
    pub failure_sample_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            fetch_concurrency: 1,
            inter_file_delay: Duration::from_millis(100),
            failure_sample_size: 20,
        }
    }
}

/// Counters plus a bounded list of failure samples.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    pub counters: RunCounters,
    pub failure_samples: Vec<FailureSample>,
}

impl RunTally {
    pub fn record(&mut self, path: &str, result: &FileResult, sample_limit: usize) {
        match result {
            Ok(success) => {
                self.counters.succeeded += 1;
                self.counters.anomalies += success.anomalies as u64;
                match success.outcome {
                    UpsertOutcome::Inserted => self.counters.inserted += 1,
                    UpsertOutcome::Updated => self.counters.updated += 1,
                }
            }
            Err(failure) => {
                self.counters.record_failure(failure.kind);
                self.sample(path, failure.kind, &failure.message, sample_limit);
            }
        }
    }

    /// A directory that could not be listed mid-walk; its files are never seen,
    /// so only the kind is counted, not a failed file.
    pub fn record_walk_error(&mut self, err: &WalkError, sample_limit: usize) {
        *self.counters.failures_by_kind.entry(err.source.kind()).or_default() += 1;
        self.sample(&err.path, err.source.kind(), &err.source.to_string(), sample_limit);
    }

    pub fn merge(&mut self, other: RunTally, sample_limit: usize) {
        let c = other.counters;
        self.counters.files_seen += c.files_seen;
        self.counters.files_skipped += c.files_skipped;
        self.counters.succeeded += c.succeeded;
        self.counters.failed += c.failed;
        self.counters.inserted += c.inserted;
        self.counters.updated += c.updated;
        self.counters.anomalies += c.anomalies;
        for (kind, n) in c.failures_by_kind {
            *self.counters.failures_by_kind.entry(kind).or_default() += n;
        }
        for sample in other.failure_samples {
            if self.failure_samples.len() >= sample_limit {
                break;
            }
            self.failure_samples.push(sample);
        }
    }

    pub fn has_failures(&self) -> bool {
        self.counters.failed > 0 || !self.counters.failures_by_kind.is_empty()
    }

    fn sample(&mut self, path: &str, kind: FailureKind, message: &str, sample_limit: usize) {
        if self.failure_samples.len() < sample_limit {
            self.failure_samples.push(FailureSample {
                path: path.to_string(),
                kind,
                message: message.to_string(),
            });
        }
    }
}

pub struct FilePipeline {
    remote: Arc<dyn RemoteFs>,
    store: Arc<dyn Store>,
    normalizer: Arc<Normalizer>,
    root: String,
}

impl FilePipeline {
    pub fn new(
        remote: Arc<dyn RemoteFs>,
        store: Arc<dyn Store>,
        normalizer: Arc<Normalizer>,
        root: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            store,
            normalizer,
            root: root.into(),
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteFs> {
        &self.remote
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn normalizer(&self) -> &Arc<Normalizer> {
        &self.normalizer
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn walker(&self, period: Period, scope: LineScope) -> PeriodWalker {
        PeriodWalker::new(self.remote.clone(), self.root.clone(), period, scope)
    }

    async fn fetch(&self, file: &FeedFile) -> Result<Vec<u8>, RemoteError> {
        self.remote
            .fetch(&file.path)
            .instrument(info_span!("remote_fetch", path = %file.path))
            .await
    }

    /// Normalizes and persists one fetched payload.
    pub async fn ingest(&self, file: &FeedFile, bytes: &[u8]) -> FileResult {
        let ctx = ExtractContext::new(file.feed.line_id)
            .with_ship(file.feed.ship_id)
            .with_source_path(file.feed.to_string());
        let record = self
            .normalizer
            .normalize(bytes, &ctx)
            .map_err(|err| FileFailure::from_error(err.kind(), &err))?;
        let outcome = self
            .store
            .upsert_sailing(&record)
            .await
            .map_err(|err| FileFailure::from_error(err.kind(), &err))?;
        if !record.anomalies.is_empty() {
            warn!(
                path = %file.feed,
                instance_id = %record.instance_id,
                anomalies = ?record.anomalies,
                "price anomaly flagged"
            );
        }
        debug!(path = %file.feed, instance_id = %record.instance_id, ?outcome, "sailing persisted");
        Ok(FileSuccess {
            outcome,
            anomalies: record.anomalies.len(),
        })
    }

    /// Fetches up to `fetch_concurrency` files ahead while ingesting strictly in input order.
    pub async fn process_batch(&self, files: &[FeedFile], options: &BatchOptions) -> Vec<FileResult> {
        let mut fetched = stream::iter(files.to_vec())
            .map(|file| async move {
                let bytes = self.fetch(&file).await;
                (file, bytes)
            })
            .buffered(options.fetch_concurrency.max(1));

        let mut results = Vec::with_capacity(files.len());
        while let Some((file, bytes)) = fetched.next().await {
            let result = match bytes {
                Ok(bytes) => self.ingest(&file, &bytes).await,
                Err(err) => Err(FileFailure::from_error(err.kind(), &err)),
            };
            if let Err(failure) = &result {
                warn!(path = %file.feed, kind = %failure.kind, error = %failure.message, "file failed");
            }
            results.push(result);
            if results.len() < files.len() && !options.inter_file_delay.is_zero() {
                tokio::time::sleep(options.inter_file_delay).await;
            }
        }
        results
    }

    /// Processes every file of one line across `periods`, without checkpoints.
    ///
    /// Fails only when the walk cannot start at all: the first period's
    /// initial listing errors, or the remote rejects our credentials.
    pub async fn run_scoped(
        &self,
        line_id: LineId,
        periods: &[Period],
        options: &BatchOptions,
    ) -> Result<RunTally, WalkError> {
        let span = info_span!("scoped_run", line_id = %line_id, periods = periods.len());
        async move {
            let mut tally = RunTally::default();
            for (index, period) in periods.iter().enumerate() {
                let mut walker = self.walker(*period, LineScope::Line(line_id));
                let mut batch = Vec::with_capacity(options.batch_size);
                loop {
                    match walker.next().await {
                        Ok(Some(file)) => {
                            tally.counters.files_seen += 1;
                            batch.push(file);
                            if batch.len() >= options.batch_size.max(1) {
                                self.flush(&mut batch, &mut tally, options).await;
                            }
                        }
                        Ok(None) => break,
                        Err(err) if (err.startup && index == 0) || matches!(err.source, RemoteError::Auth(_)) => {
                            return Err(err);
                        }
                        Err(err) => {
                            warn!(period = %period, path = %err.path, kind = %err.source.kind(), "listing failed; continuing");
                            tally.record_walk_error(&err, options.failure_sample_size);
                        }
                    }
                }
                self.flush(&mut batch, &mut tally, options).await;
            }
            info!(
                seen = tally.counters.files_seen,
                succeeded = tally.counters.succeeded,
                failed = tally.counters.failed,
                "scoped run finished"
            );
            Ok(tally)
        }
        .instrument(span)
        .await
    }

    async fn flush(&self, batch: &mut Vec<FeedFile>, tally: &mut RunTally, options: &BatchOptions) {
        if batch.is_empty() {
            return;
        }
        let results = self.process_batch(batch, options).await;
        for (file, result) in batch.iter().zip(&results) {
            tally.record(&file.feed.to_string(), result, options.failure_sample_size);
        }
        batch.clear();
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use berth_remote::MemoryRemote;
    use berth_store::MemoryStore;

    pub fn payload(instance: &str, family: &str, interior: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "cruiseid": family,
            "codetocruiseid": instance,
            "name": "Fixture Cruise",
            "saildate": "2030-03-01",
            "nights": 7,
            "cheapestinside": interior,
        }))
        .unwrap()
    }

    pub fn put(remote: &MemoryRemote, period: Period, line: i32, ship: i32, file: &str, bytes: Vec<u8>) {
        remote.insert(format!("feed/{period}/{line}/{ship}/{file}.json"), bytes);
    }

    pub fn pipeline(remote: Arc<MemoryRemote>, store: Arc<MemoryStore>) -> FilePipeline {
        FilePipeline::new(remote, store, Arc::new(Normalizer::default()), "feed")
    }

    pub fn fast_options() -> BatchOptions {
        BatchOptions {
            batch_size: 2,
            fetch_concurrency: 1,
            inter_file_delay: Duration::ZERO,
            failure_sample_size: 5,
        }
    }
}
