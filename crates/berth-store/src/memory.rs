//! In-memory backend with the same semantics as the PostgreSQL one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{
    FileAttempt, InstanceId, JobStatus, LineId, Period, PeriodStatus, PipelineMode,
    PipelineModeRecord, PriceSummary, RunCounters, SailingRecord, SyncCheckpoint, WebhookJob,
};
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::{
    check_prices, dimension_refs, is_claimable, price_changes, ttl_to_chrono, CheckpointStore, Dimension,
    JobQueue, LineLocks, ModeStore, PersistError, PriceChange, SailingStore, StoredSailing,
    UpsertOutcome,
};

struct SailingRow {
    record: SailingRecord,
    active: bool,
    updated_at: DateTime<Utc>,
}

struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

struct Inner {
    dimensions: BTreeMap<(Dimension, i32), (String, bool)>,
    sailings: BTreeMap<InstanceId, SailingRow>,
    history: Vec<PriceChange>,
    checkpoints: BTreeMap<Period, SyncCheckpoint>,
    jobs: BTreeMap<Uuid, WebhookJob>,
    locks: HashMap<LineId, Lease>,
    mode: PipelineModeRecord,
    upsert_failures: HashMap<InstanceId, PersistError>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            dimensions: BTreeMap::new(),
            sailings: BTreeMap::new(),
            history: Vec::new(),
            checkpoints: BTreeMap::new(),
            jobs: BTreeMap::new(),
            locks: HashMap::new(),
            mode: PipelineModeRecord {
                mode: PipelineMode::Active,
                reason: None,
                updated_at: Utc::now(),
            },
            upsert_failures: HashMap::new(),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sailing_count(&self) -> usize {
        self.inner().sailings.len()
    }

    pub fn record(&self, instance_id: &InstanceId) -> Option<SailingRecord> {
        self.inner().sailings.get(instance_id).map(|row| row.record.clone())
    }

    /// Stored name and placeholder flag of a dimension row.
    pub fn dimension(&self, dimension: Dimension, id: i32) -> Option<(String, bool)> {
        self.inner().dimensions.get(&(dimension, id)).cloned()
    }

    /// Overwrites stored prices without touching history, as a drifted row would look.
    pub fn set_stored_prices(&self, instance_id: &InstanceId, prices: PriceSummary) -> bool {
        match self.inner().sailings.get_mut(instance_id) {
            Some(row) => {
                row.record.prices = prices;
                true
            }
            None => false,
        }
    }

    pub fn set_stored_raw(&self, instance_id: &InstanceId, raw: serde_json::Value) -> bool {
        match self.inner().sailings.get_mut(instance_id) {
            Some(row) => {
                row.record.raw = raw;
                true
            }
            None => false,
        }
    }

    /// Makes every upsert of `instance_id` fail with `err` until cleared.
    pub fn fail_upserts_for(&self, instance_id: InstanceId, err: PersistError) {
        self.inner().upsert_failures.insert(instance_id, err);
    }

    pub fn jobs(&self) -> Vec<WebhookJob> {
        let mut jobs: Vec<_> = self.inner().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.received_at);
        jobs
    }

    pub fn lock_owner(&self, line_id: LineId) -> Option<String> {
        let now = Utc::now();
        self.inner()
            .locks
            .get(&line_id)
            .filter(|lease| lease.expires_at > now)
            .map(|lease| lease.owner.clone())
    }
}

fn stored(row: &SailingRow) -> StoredSailing {
    let record = &row.record;
    StoredSailing {
        instance_id: record.instance_id.clone(),
        family_id: record.family_id.clone(),
        line_id: record.line_id,
        ship_id: record.ship_id,
        sailing_date: record.sailing_date,
        source_path: record.source_path.clone(),
        raw: (!record.raw.is_null()).then(|| record.raw.clone()),
        prices: record.prices.clone(),
        active: row.active,
        updated_at: row.updated_at,
    }
}

/// Evenly spread indices; the in-memory backend samples deterministically.
fn sample_indices(len: usize, size: usize) -> Vec<usize> {
    if size >= len {
        return (0..len).collect();
    }
    let step = len as f64 / size as f64;
    (0..size).map(|i| (i as f64 * step) as usize).collect()
}

#[async_trait]
impl SailingStore for MemoryStore {
    async fn upsert_sailing(&self, record: &SailingRecord) -> Result<UpsertOutcome, PersistError> {
        let refs = dimension_refs(record)?;
        check_prices(&record.prices)?;
        let mut inner = self.inner();
        if let Some(err) = inner.upsert_failures.get(&record.instance_id) {
            return Err(err.clone());
        }
        for dim in refs {
            let key = (dim.dimension, dim.id);
            let incoming = (dim.resolved_name(), dim.is_placeholder());
            match inner.dimensions.get_mut(&key) {
                Some(existing) if existing.1 && !incoming.1 => *existing = incoming,
                Some(_) => {}
                None => {
                    inner.dimensions.insert(key, incoming);
                }
            }
        }

        let now = Utc::now();
        let previous = inner
            .sailings
            .get(&record.instance_id)
            .map(|row| row.record.prices.clone());
        for (field, old_amount, new_amount) in price_changes(previous.as_ref(), &record.prices) {
            inner.history.push(PriceChange {
                instance_id: record.instance_id.clone(),
                field,
                old_amount,
                new_amount,
                recorded_at: now,
            });
        }
        let outcome = if previous.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        inner.sailings.insert(
            record.instance_id.clone(),
            SailingRow {
                record: record.clone(),
                active: true,
                updated_at: now,
            },
        );
        Ok(outcome)
    }

    async fn sailing(&self, instance_id: &InstanceId) -> Result<Option<StoredSailing>, PersistError> {
        Ok(self.inner().sailings.get(instance_id).map(stored))
    }

    async fn stored_page(
        &self,
        after: Option<&InstanceId>,
        limit: usize,
    ) -> Result<Vec<StoredSailing>, PersistError> {
        let inner = self.inner();
        Ok(inner
            .sailings
            .iter()
            .filter(|(id, _)| after.map_or(true, |a| *id > a))
            .map(|(_, row)| row)
            .filter(|row| !row.record.raw.is_null())
            .take(limit)
            .map(stored)
            .collect())
    }

    async fn stored_sample(&self, size: usize) -> Result<Vec<StoredSailing>, PersistError> {
        let inner = self.inner();
        let rows: Vec<&SailingRow> = inner
            .sailings
            .values()
            .filter(|row| !row.record.raw.is_null())
            .collect();
        Ok(sample_indices(rows.len(), size)
            .into_iter()
            .filter_map(|i| rows.get(i).map(|row| stored(row)))
            .collect())
    }

    async fn deactivate_before(&self, date: NaiveDate) -> Result<u64, PersistError> {
        let mut changed = 0;
        for row in self.inner().sailings.values_mut() {
            if row.active && row.record.sailing_date.is_some_and(|d| d < date) {
                row.active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn price_history(&self, instance_id: &InstanceId) -> Result<Vec<PriceChange>, PersistError> {
        Ok(self
            .inner()
            .history
            .iter()
            .filter(|c| &c.instance_id == instance_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, period: Period) -> Result<SyncCheckpoint, PersistError> {
        Ok(self
            .inner()
            .checkpoints
            .get(&period)
            .cloned()
            .unwrap_or_else(|| SyncCheckpoint::empty(period)))
    }

    async fn set_period_status(&self, period: Period, status: PeriodStatus) -> Result<(), PersistError> {
        let mut inner = self.inner();
        let checkpoint = inner
            .checkpoints
            .entry(period)
            .or_insert_with(|| SyncCheckpoint::empty(period));
        checkpoint.status = status;
        checkpoint.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn record_attempts(&self, period: Period, attempts: &[FileAttempt]) -> Result<(), PersistError> {
        let mut inner = self.inner();
        let checkpoint = inner
            .checkpoints
            .entry(period)
            .or_insert_with(|| SyncCheckpoint::empty(period));
        for attempt in attempts {
            checkpoint.attempted.insert(attempt.path.clone(), attempt.failure);
        }
        if let Some(last) = attempts.last() {
            checkpoint.last_file = Some(last.path.clone());
        }
        checkpoint.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn reset_checkpoint(&self, period: Period) -> Result<(), PersistError> {
        self.inner().checkpoints.remove(&period);
        Ok(())
    }

    async fn forget_failed(&self, period: Period) -> Result<u64, PersistError> {
        let mut inner = self.inner();
        let Some(checkpoint) = inner.checkpoints.get_mut(&period) else {
            return Ok(0);
        };
        let before = checkpoint.attempted.len();
        checkpoint.attempted.retain(|_, failure| failure.is_none());
        let forgotten = (before - checkpoint.attempted.len()) as u64;
        if forgotten > 0 {
            checkpoint.status = PeriodStatus::Pending;
            checkpoint.updated_at = Some(Utc::now());
        }
        Ok(forgotten)
    }
}

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(&self, job: &WebhookJob) -> Result<(), PersistError> {
        let mut inner = self.inner();
        if inner.jobs.contains_key(&job.id) {
            return Err(PersistError::ConstraintViolation(format!("duplicate job id {}", job.id)));
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<WebhookJob>, PersistError> {
        let mut inner = self.inner();
        let next = inner
            .jobs
            .values()
            .filter(|job| is_claimable(job, now))
            .min_by_key(|job| (job.available_at, job.received_at))
            .map(|job| job.id);
        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Active;
        job.started_at = Some(now);
        job.attempts += 1;
        job.worker_id = Some(worker_id.to_string());
        Ok(Some(job.clone()))
    }

    async fn requeue(&self, id: Uuid, available_at: DateTime<Utc>, reason: &str) -> Result<(), PersistError> {
        let mut inner = self.inner();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PersistError::ForeignKeyMissing {
                entity: "job",
                id: id.to_string(),
            })?;
        job.status = JobStatus::Pending;
        job.available_at = available_at;
        job.worker_id = None;
        job.error = Some(reason.to_string());
        Ok(())
    }

    async fn complete(&self, id: Uuid, counters: &RunCounters) -> Result<(), PersistError> {
        let mut inner = self.inner();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PersistError::ForeignKeyMissing {
                entity: "job",
                id: id.to_string(),
            })?;
        job.status = JobStatus::Done;
        job.finished_at = Some(Utc::now());
        job.counters = Some(counters.clone());
        job.error = None;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str, counters: Option<&RunCounters>) -> Result<(), PersistError> {
        let mut inner = self.inner();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| PersistError::ForeignKeyMissing {
                entity: "job",
                id: id.to_string(),
            })?;
        job.status = JobStatus::Failed;
        job.finished_at = Some(Utc::now());
        job.counters = counters.cloned();
        job.error = Some(error.to_string());
        Ok(())
    }

    async fn job(&self, id: Uuid) -> Result<Option<WebhookJob>, PersistError> {
        Ok(self.inner().jobs.get(&id).cloned())
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistError> {
        let mut inner = self.inner();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| {
            !(job.status.is_finished() && job.finished_at.is_some_and(|f| f < cutoff))
        });
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn reset_stale_active(&self, started_before: DateTime<Utc>) -> Result<u64, PersistError> {
        let now = Utc::now();
        let mut reset = 0;
        for job in self.inner().jobs.values_mut() {
            if job.status == JobStatus::Active && job.started_at.is_some_and(|s| s < started_before) {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.available_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[async_trait]
impl LineLocks for MemoryStore {
    async fn try_acquire(&self, line_id: LineId, owner: &str, ttl: Duration) -> Result<bool, PersistError> {
        let now = Utc::now();
        let mut inner = self.inner();
        let free = inner
            .locks
            .get(&line_id)
            .map_or(true, |lease| lease.expires_at <= now);
        if free {
            inner.locks.insert(
                line_id,
                Lease {
                    owner: owner.to_string(),
                    expires_at: now + ttl_to_chrono(ttl),
                },
            );
        }
        Ok(free)
    }

    async fn renew(&self, line_id: LineId, owner: &str, ttl: Duration) -> Result<bool, PersistError> {
        let now = Utc::now();
        let mut inner = self.inner();
        match inner.locks.get_mut(&line_id) {
            Some(lease) if lease.owner == owner => {
                lease.expires_at = now + ttl_to_chrono(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, line_id: LineId, owner: &str) -> Result<(), PersistError> {
        let mut inner = self.inner();
        if inner.locks.get(&line_id).is_some_and(|lease| lease.owner == owner) {
            inner.locks.remove(&line_id);
        }
        Ok(())
    }

    async fn force_clear(&self, line_id: LineId) -> Result<bool, PersistError> {
        Ok(self.inner().locks.remove(&line_id).is_some())
    }
}

#[async_trait]
impl ModeStore for MemoryStore {
    async fn mode(&self) -> Result<PipelineModeRecord, PersistError> {
        Ok(self.inner().mode.clone())
    }

    async fn set_mode(&self, mode: PipelineMode, reason: Option<&str>) -> Result<PipelineModeRecord, PersistError> {
        let mut inner = self.inner();
        inner.mode = PipelineModeRecord {
            mode,
            reason: reason.map(str::to_string),
            updated_at: Utc::now(),
        };
        Ok(inner.mode.clone())
    }
}
