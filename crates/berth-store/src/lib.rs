//! Reconciliation store and the persisted pipeline state around it.
//!
//! Two backends share the traits below: [`PgStore`] for PostgreSQL and
//! [`MemoryStore`] for tests and dry runs.

use std::time::Duration;

use async_trait::async_trait;
use berth_core::{
    FailureKind, FamilyId, FileAttempt, InstanceId, JobStatus, LineId, Period, PeriodStatus,
    PipelineMode, PipelineModeRecord, PriceSummary, RunCounters, SailingRecord, SyncCheckpoint,
    WebhookJob,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "berth-store";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("referenced {entity} {id} does not exist")]
    ForeignKeyMissing { entity: &'static str, id: String },
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl PersistError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PersistError::ForeignKeyMissing { .. } => FailureKind::ForeignKeyMissing,
            PersistError::ConstraintViolation(_) => FailureKind::ConstraintViolation,
            PersistError::Backend(_) => FailureKind::PersistBackend,
        }
    }
}

/// The dimension tables a sailing references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Line,
    Ship,
    Port,
    Region,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Line => "line",
            Dimension::Ship => "ship",
            Dimension::Port => "port",
            Dimension::Region => "region",
        }
    }

    pub fn placeholder_name(self, id: i32) -> String {
        match self {
            Dimension::Line => format!("Line {id}"),
            Dimension::Ship => format!("Ship {id}"),
            Dimension::Port => format!("Port {id}"),
            Dimension::Region => format!("Region {id}"),
        }
    }
}

/// A dimension row to ensure before the sailing is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRef {
    pub dimension: Dimension,
    pub id: i32,
    pub name: Option<String>,
}

impl DimensionRef {
    pub fn resolved_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.dimension.placeholder_name(self.id))
    }

    pub fn is_placeholder(&self) -> bool {
        self.name.is_none()
    }
}

/// Every dimension the record references, after rejecting ids that can never exist.
pub fn dimension_refs(record: &SailingRecord) -> Result<Vec<DimensionRef>, PersistError> {
    let mut refs = vec![DimensionRef {
        dimension: Dimension::Line,
        id: record.line_id.get(),
        name: record.line_name.clone(),
    }];
    if let Some(ship_id) = record.ship_id {
        refs.push(DimensionRef {
            dimension: Dimension::Ship,
            id: ship_id,
            name: record.ship_name.clone(),
        });
    }
    for port_id in record.referenced_port_ids() {
        refs.push(DimensionRef {
            dimension: Dimension::Port,
            id: port_id,
            name: record.port_names.get(&port_id).cloned(),
        });
    }
    let mut regions = record.region_ids.clone();
    regions.sort_unstable();
    regions.dedup();
    for region_id in regions {
        refs.push(DimensionRef {
            dimension: Dimension::Region,
            id: region_id,
            name: record.region_names.get(&region_id).cloned(),
        });
    }
    if let Some(bad) = refs.iter().find(|r| r.id <= 0) {
        return Err(PersistError::ForeignKeyMissing {
            entity: bad.dimension.as_str(),
            id: bad.id.to_string(),
        });
    }
    if record.instance_id.as_str().is_empty() || record.family_id.as_str().is_empty() {
        return Err(PersistError::ConstraintViolation(
            "sailing identity must not be empty".to_string(),
        ));
    }
    Ok(refs)
}

/// Largest amount a `NUMERIC(12, 2)` price column holds.
pub const MAX_PRICE: f64 = 9_999_999_999.99;

/// Rejects amounts the price columns would store as zero or cannot hold at all.
pub fn check_prices(prices: &PriceSummary) -> Result<(), PersistError> {
    let classes = berth_core::CabinClass::ALL
        .into_iter()
        .map(|class| (class.as_str(), prices.amount(class)));
    for (field, amount) in classes.chain(std::iter::once(("cheapest", prices.cheapest))) {
        let Some(amount) = amount else { continue };
        let cents = (amount * 100.0).round() / 100.0;
        if !amount.is_finite() || cents <= 0.0 || cents > MAX_PRICE {
            return Err(PersistError::ConstraintViolation(format!(
                "{field} price {amount} is outside the storable range"
            )));
        }
    }
    Ok(())
}

pub fn raw_checksum(raw: &JsonValue) -> String {
    let bytes = serde_json::to_vec(raw).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

/// One recorded price change.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceChange {
    pub instance_id: InstanceId,
    pub field: String,
    pub old_amount: Option<f64>,
    pub new_amount: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Price fields whose stored value differs from the incoming one (`cheapest` included).
pub fn price_changes(old: Option<&PriceSummary>, new: &PriceSummary) -> Vec<(String, Option<f64>, Option<f64>)> {
    let mut out = Vec::new();
    let mut compare = |field: &str, before: Option<f64>, after: Option<f64>| {
        let changed = match (before, after) {
            (Some(a), Some(b)) => (a - b).abs() >= 0.005,
            (None, None) => false,
            _ => true,
        };
        if changed {
            out.push((field.to_string(), before, after));
        }
    };
    for class in berth_core::CabinClass::ALL {
        compare(class.as_str(), old.and_then(|p| p.amount(class)), new.amount(class));
    }
    compare("cheapest", old.and_then(|p| p.cheapest), new.cheapest);
    out
}

/// A persisted sailing as read back for auditing and reconstruction.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSailing {
    pub instance_id: InstanceId,
    pub family_id: FamilyId,
    pub line_id: LineId,
    pub ship_id: Option<i32>,
    pub sailing_date: Option<NaiveDate>,
    pub source_path: Option<String>,
    pub raw: Option<JsonValue>,
    pub prices: PriceSummary,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SailingStore: Send + Sync {
    /// Ensures dimensions, then writes sailing, quote and price history atomically.
    async fn upsert_sailing(&self, record: &SailingRecord) -> Result<UpsertOutcome, PersistError>;

    async fn sailing(&self, instance_id: &InstanceId) -> Result<Option<StoredSailing>, PersistError>;

    /// Keyset page of sailings that carry a raw payload, ordered by instance id.
    async fn stored_page(
        &self,
        after: Option<&InstanceId>,
        limit: usize,
    ) -> Result<Vec<StoredSailing>, PersistError>;

    async fn stored_sample(&self, size: usize) -> Result<Vec<StoredSailing>, PersistError>;

    /// Marks sailings departing before `date` inactive; returns how many changed.
    async fn deactivate_before(&self, date: NaiveDate) -> Result<u64, PersistError>;

    async fn price_history(&self, instance_id: &InstanceId) -> Result<Vec<PriceChange>, PersistError>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The stored checkpoint, or an empty pending one.
    async fn load_checkpoint(&self, period: Period) -> Result<SyncCheckpoint, PersistError>;

    async fn set_period_status(&self, period: Period, status: PeriodStatus) -> Result<(), PersistError>;

    async fn record_attempts(&self, period: Period, attempts: &[FileAttempt]) -> Result<(), PersistError>;

    async fn reset_checkpoint(&self, period: Period) -> Result<(), PersistError>;

    /// Forgets failed attempts so the next run retries them; returns how many were forgotten.
    async fn forget_failed(&self, period: Period) -> Result<u64, PersistError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &WebhookJob) -> Result<(), PersistError>;

    /// Atomically moves the oldest available pending job to `active` for `worker_id`.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<WebhookJob>, PersistError>;

    async fn requeue(&self, id: Uuid, available_at: DateTime<Utc>, reason: &str) -> Result<(), PersistError>;

    async fn complete(&self, id: Uuid, counters: &RunCounters) -> Result<(), PersistError>;

    async fn fail(&self, id: Uuid, error: &str, counters: Option<&RunCounters>) -> Result<(), PersistError>;

    async fn job(&self, id: Uuid) -> Result<Option<WebhookJob>, PersistError>;

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistError>;

    /// Returns `active` jobs started before `started_before` to `pending`.
    async fn reset_stale_active(&self, started_before: DateTime<Utc>) -> Result<u64, PersistError>;
}

#[async_trait]
pub trait LineLocks: Send + Sync {
    /// Takes the lease when free, expired or already held by `owner`.
    async fn try_acquire(&self, line_id: LineId, owner: &str, ttl: Duration) -> Result<bool, PersistError>;

    async fn renew(&self, line_id: LineId, owner: &str, ttl: Duration) -> Result<bool, PersistError>;

    async fn release(&self, line_id: LineId, owner: &str) -> Result<(), PersistError>;

    /// Drops the lease whoever holds it; returns whether one existed.
    async fn force_clear(&self, line_id: LineId) -> Result<bool, PersistError>;
}

#[async_trait]
pub trait ModeStore: Send + Sync {
    async fn mode(&self) -> Result<PipelineModeRecord, PersistError>;

    async fn set_mode(&self, mode: PipelineMode, reason: Option<&str>) -> Result<PipelineModeRecord, PersistError>;
}

/// Everything the pipeline persists.
pub trait Store: SailingStore + CheckpointStore + JobQueue + LineLocks + ModeStore {}

impl<T> Store for T where T: SailingStore + CheckpointStore + JobQueue + LineLocks + ModeStore {}

pub(crate) fn ttl_to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

pub(crate) fn is_claimable(job: &WebhookJob, now: DateTime<Utc>) -> bool {
    job.status == JobStatus::Pending && job.available_at <= now
}
