//! Core domain model for the Berth cruise feed reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "berth-core";

/// Numeric cruise line id as used by the feed and the remote directory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(i32);

impl LineId {
    /// Accepts only strictly positive ids that fit the storage column.
    pub fn new(raw: i64) -> Option<Self> {
        if raw <= 0 {
            return None;
        }
        i32::try_from(raw).ok().map(Self)
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable per-departure identifier (`codetocruiseid` in the feed). Primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier shared by reschedules of the same conceptual cruise (`cruiseid`). Not unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyId(String);

impl FamilyId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (year, month) slice of the remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && (1970..=9999).contains(&year) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn current() -> Self {
        Self::containing(Utc::now().date_naive())
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// `self` followed by `lookahead` further months.
    pub fn through(self, lookahead: u32) -> Vec<Self> {
        let mut out = Vec::with_capacity(lookahead as usize + 1);
        let mut cursor = self;
        out.push(cursor);
        for _ in 0..lookahead {
            cursor = cursor.next();
            out.push(cursor);
        }
        out
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinClass {
    Interior,
    Oceanview,
    Balcony,
    Suite,
}

impl CabinClass {
    pub const ALL: [CabinClass; 4] = [
        CabinClass::Interior,
        CabinClass::Oceanview,
        CabinClass::Balcony,
        CabinClass::Suite,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CabinClass::Interior => "interior",
            CabinClass::Oceanview => "oceanview",
            CabinClass::Balcony => "balcony",
            CabinClass::Suite => "suite",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPrice {
    pub amount: f64,
    pub price_code: Option<String>,
}

/// Which extraction rule produced a record's prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    TopLevel,
    CheapestCombined,
    CheapestPrices,
}

impl PriceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            PriceSource::TopLevel => "top_level",
            PriceSource::CheapestCombined => "cheapest_combined",
            PriceSource::CheapestPrices => "cheapest_prices",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "top_level" => Some(PriceSource::TopLevel),
            "cheapest_combined" => Some(PriceSource::CheapestCombined),
            "cheapest_prices" => Some(PriceSource::CheapestPrices),
            _ => None,
        }
    }
}

/// Cheapest-price summary for one sailing instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceSummary {
    pub interior: Option<ClassPrice>,
    pub oceanview: Option<ClassPrice>,
    pub balcony: Option<ClassPrice>,
    pub suite: Option<ClassPrice>,
    pub cheapest: Option<f64>,
    pub source: Option<PriceSource>,
}

impl PriceSummary {
    pub fn class(&self, class: CabinClass) -> Option<&ClassPrice> {
        match class {
            CabinClass::Interior => self.interior.as_ref(),
            CabinClass::Oceanview => self.oceanview.as_ref(),
            CabinClass::Balcony => self.balcony.as_ref(),
            CabinClass::Suite => self.suite.as_ref(),
        }
    }

    pub fn class_mut(&mut self, class: CabinClass) -> &mut Option<ClassPrice> {
        match class {
            CabinClass::Interior => &mut self.interior,
            CabinClass::Oceanview => &mut self.oceanview,
            CabinClass::Balcony => &mut self.balcony,
            CabinClass::Suite => &mut self.suite,
        }
    }

    pub fn amount(&self, class: CabinClass) -> Option<f64> {
        self.class(class).map(|p| p.amount)
    }

    pub fn has_any_class_price(&self) -> bool {
        CabinClass::ALL
            .iter()
            .any(|c| self.amount(*c).is_some_and(|a| a > 0.0))
    }

    /// Minimum of the populated, positive class prices. `None` when there are none.
    pub fn computed_cheapest(&self) -> Option<f64> {
        CabinClass::ALL
            .iter()
            .filter_map(|c| self.amount(*c))
            .filter(|a| *a > 0.0)
            .fold(None, |acc: Option<f64>, a| Some(acc.map_or(a, |m| m.min(a))))
    }

    pub fn recompute_cheapest(&mut self) {
        self.cheapest = self.computed_cheapest();
    }

    /// Checks `cheapest == min(populated class prices)` within `tolerance`.
    pub fn cheapest_is_consistent(&self, tolerance: f64) -> bool {
        match (self.cheapest, self.computed_cheapest()) {
            (None, None) => true,
            (Some(stored), Some(expected)) => (stored - expected).abs() <= tolerance,
            _ => false,
        }
    }
}

/// Canonical record produced by extraction and consumed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SailingRecord {
    pub instance_id: InstanceId,
    pub family_id: FamilyId,
    pub line_id: LineId,
    pub ship_id: Option<i32>,
    pub name: Option<String>,
    pub voyage_code: Option<String>,
    pub itinerary_code: Option<String>,
    pub sailing_date: Option<NaiveDate>,
    pub return_date: Option<NaiveDate>,
    pub nights: Option<i32>,
    pub sail_nights: Option<i32>,
    pub sea_days: Option<i32>,
    pub embark_port_id: Option<i32>,
    pub disembark_port_id: Option<i32>,
    pub region_ids: Vec<i32>,
    pub port_ids: Vec<i32>,
    pub no_fly: Option<bool>,
    pub depart_uk: Option<bool>,
    pub visible: Option<bool>,
    pub currency: Option<String>,
    pub line_name: Option<String>,
    pub ship_name: Option<String>,
    pub port_names: BTreeMap<i32, String>,
    pub region_names: BTreeMap<i32, String>,
    pub prices: PriceSummary,
    pub price_divisor: Option<f64>,
    pub anomalies: Vec<String>,
    pub source_path: Option<String>,
    /// The payload exactly as received; persisted for audits and replays.
    pub raw: JsonValue,
    /// The object extraction read from, when `raw` had to be reassembled first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconstructed: Option<JsonValue>,
}

impl SailingRecord {
    /// Every port id referenced by the record, including embark/disembark.
    pub fn referenced_port_ids(&self) -> BTreeSet<i32> {
        self.port_ids
            .iter()
            .copied()
            .chain(self.embark_port_id)
            .chain(self.disembark_port_id)
            .collect()
    }
}

pub fn return_date(sailing_date: Option<NaiveDate>, nights: Option<i32>) -> Option<NaiveDate> {
    let date = sailing_date?;
    let nights = nights?;
    if nights < 0 {
        return None;
    }
    date.checked_add_signed(Duration::days(i64::from(nights)))
}

/// Classification used by run counters and failure samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientIo,
    RemoteNotFound,
    RemoteAuth,
    RemoteProtocol,
    MissingIdentity,
    Corrupt,
    UnrecognizedSchema,
    ForeignKeyMissing,
    ConstraintViolation,
    PersistBackend,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::TransientIo => "transient_io",
            FailureKind::RemoteNotFound => "remote_not_found",
            FailureKind::RemoteAuth => "remote_auth",
            FailureKind::RemoteProtocol => "remote_protocol",
            FailureKind::MissingIdentity => "missing_identity",
            FailureKind::Corrupt => "corrupt",
            FailureKind::UnrecognizedSchema => "unrecognized_schema",
            FailureKind::ForeignKeyMissing => "foreign_key_missing",
            FailureKind::ConstraintViolation => "constraint_violation",
            FailureKind::PersistBackend => "persist_backend",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            FailureKind::TransientIo,
            FailureKind::RemoteNotFound,
            FailureKind::RemoteAuth,
            FailureKind::RemoteProtocol,
            FailureKind::MissingIdentity,
            FailureKind::Corrupt,
            FailureKind::UnrecognizedSchema,
            FailureKind::ForeignKeyMissing,
            FailureKind::ConstraintViolation,
            FailureKind::PersistBackend,
        ]
        .into_iter()
        .find(|k| k.as_str() == value)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded per-file (or per-directory) failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSample {
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Counters shared by bulk periods and webhook jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub files_seen: u64,
    pub files_skipped: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub anomalies: u64,
    pub failures_by_kind: BTreeMap<FailureKind, u64>,
}

impl RunCounters {
    pub fn record_failure(&mut self, kind: FailureKind) {
        self.failed += 1;
        *self.failures_by_kind.entry(kind).or_default() += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "active" => Some(JobStatus::Active),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// Queued unit of incremental work for one cruise line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookJob {
    pub id: Uuid,
    pub line_id: LineId,
    pub status: JobStatus,
    pub received_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub worker_id: Option<String>,
    pub counters: Option<RunCounters>,
    pub error: Option<String>,
}

impl WebhookJob {
    pub fn pending(line_id: LineId, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            line_id,
            status: JobStatus::Pending,
            received_at,
            available_at: received_at,
            started_at: None,
            finished_at: None,
            attempts: 0,
            worker_id: None,
            counters: None,
            error: None,
        }
    }
}

/// Bulk period state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    Pending,
    Listing,
    Processing,
    Completed,
    PartiallyFailed,
    /// The walk could not start; nothing was attempted.
    Failed,
}

impl PeriodStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodStatus::Pending => "pending",
            PeriodStatus::Listing => "listing",
            PeriodStatus::Processing => "processing",
            PeriodStatus::Completed => "completed",
            PeriodStatus::PartiallyFailed => "partially_failed",
            PeriodStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PeriodStatus::Pending),
            "listing" => Some(PeriodStatus::Listing),
            "processing" => Some(PeriodStatus::Processing),
            "completed" => Some(PeriodStatus::Completed),
            "partially_failed" => Some(PeriodStatus::PartiallyFailed),
            "failed" => Some(PeriodStatus::Failed),
            _ => None,
        }
    }
}

/// Outcome of one attempted file, as recorded in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttempt {
    pub path: String,
    pub failure: Option<FailureKind>,
}

/// Persisted bulk progress for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub period: Period,
    pub status: PeriodStatus,
    pub attempted: BTreeMap<String, Option<FailureKind>>,
    pub last_file: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncCheckpoint {
    pub fn empty(period: Period) -> Self {
        Self {
            period,
            status: PeriodStatus::Pending,
            attempted: BTreeMap::new(),
            last_file: None,
            updated_at: None,
        }
    }

    pub fn was_attempted(&self, path: &str) -> bool {
        self.attempted.contains_key(path)
    }

    pub fn failed_paths(&self) -> impl Iterator<Item = &str> {
        self.attempted
            .iter()
            .filter(|(_, f)| f.is_some())
            .map(|(p, _)| p.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Active,
    Paused,
}

impl PipelineMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineMode::Active => "active",
            PipelineMode::Paused => "paused",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PipelineMode::Active),
            "paused" => Some(PipelineMode::Paused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineModeRecord {
    pub mode: PipelineMode,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(amount: f64) -> Option<ClassPrice> {
        Some(ClassPrice {
            amount,
            price_code: None,
        })
    }

    #[test]
    fn line_id_rejects_non_positive_values() {
        assert!(LineId::new(0).is_none());
        assert!(LineId::new(-4).is_none());
        assert!(LineId::new(i64::from(i32::MAX) + 1).is_none());
        assert_eq!(LineId::new(16).map(LineId::get), Some(16));
    }

    #[test]
    fn period_rolls_over_year_boundary() {
        let start = Period::new(2025, 11).unwrap();
        let months = start.through(3);
        assert_eq!(
            months,
            vec![
                Period::new(2025, 11).unwrap(),
                Period::new(2025, 12).unwrap(),
                Period::new(2026, 1).unwrap(),
                Period::new(2026, 2).unwrap(),
            ]
        );
        assert_eq!(start.to_string(), "2025/11");
        assert!(Period::new(2025, 13).is_none());
    }

    #[test]
    fn cheapest_ignores_missing_and_zero_classes() {
        let mut prices = PriceSummary {
            interior: price(0.0),
            oceanview: price(820.0),
            balcony: None,
            suite: price(640.5),
            ..Default::default()
        };
        prices.recompute_cheapest();
        assert_eq!(prices.cheapest, Some(640.5));

        let empty = PriceSummary::default();
        assert_eq!(empty.computed_cheapest(), None);
        assert!(empty.cheapest_is_consistent(0.01));
    }

    #[test]
    fn cheapest_consistency_detects_drift() {
        let prices = PriceSummary {
            interior: price(500.0),
            balcony: price(900.0),
            cheapest: Some(900.0),
            ..Default::default()
        };
        assert!(!prices.cheapest_is_consistent(0.01));

        let zero_cheapest = PriceSummary {
            interior: price(500.0),
            cheapest: None,
            ..Default::default()
        };
        assert!(!zero_cheapest.cheapest_is_consistent(0.01));
    }

    #[test]
    fn return_date_adds_nights() {
        let date = NaiveDate::from_ymd_opt(2025, 12, 28);
        assert_eq!(return_date(date, Some(7)), NaiveDate::from_ymd_opt(2026, 1, 4));
        assert_eq!(return_date(date, None), None);
        assert_eq!(return_date(None, Some(7)), None);
    }

    #[test]
    fn failure_kind_round_trips_through_str() {
        for kind in [FailureKind::Corrupt, FailureKind::ForeignKeyMissing, FailureKind::TransientIo] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FailureKind::parse("nope"), None);
    }
}
