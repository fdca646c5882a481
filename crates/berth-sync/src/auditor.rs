//! Consistency Auditor: re-extracts stored raw payloads and compares prices.

use std::sync::Arc;

use berth_core::{CabinClass, InstanceId, LineId, PriceSummary, SailingRecord};
use berth_extract::{ExtractContext, ExtractionError, Normalizer};
use berth_remote::{paths::join_remote, RemoteError};
use berth_store::{PersistError, Store, StoredSailing, UpsertOutcome};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::notify::{Notifier, PipelineEvent};
use crate::pipeline::FilePipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
    Report,
    Repair,
}

impl AuditMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditMode::Report => "report",
            AuditMode::Repair => "repair",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "report" => Some(AuditMode::Report),
            "repair" => Some(AuditMode::Repair),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditScope {
    All { page_size: usize },
    Sample(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AuditVerdict {
    Match,
    Mismatch { details: Vec<String> },
    Corrupt { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditFinding {
    pub instance_id: InstanceId,
    pub line_id: LineId,
    pub verdict: AuditVerdict,
    pub repaired: bool,
    /// Why a repair upsert was rejected; the audit moves on to the next sailing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSummary {
    pub mode: AuditMode,
    pub checked: usize,
    pub matched: usize,
    pub mismatches: usize,
    pub corrupt: usize,
    pub repaired: usize,
    pub repair_failed: usize,
    /// Only non-matching sailings are listed.
    pub findings: Vec<AuditFinding>,
}

impl AuditSummary {
    fn new(mode: AuditMode) -> Self {
        Self {
            mode,
            checked: 0,
            matched: 0,
            mismatches: 0,
            corrupt: 0,
            repaired: 0,
            repair_failed: 0,
            findings: Vec::new(),
        }
    }
}

fn differs(a: Option<f64>, b: Option<f64>, tolerance: f64) -> bool {
    match (a, b) {
        (None, None) => false,
        (Some(a), Some(b)) => (a - b).abs() > tolerance,
        _ => true,
    }
}

fn show(amount: Option<f64>) -> String {
    amount.map_or_else(|| "none".to_string(), |a| format!("{a:.2}"))
}

fn compare_prices(stored: &PriceSummary, fresh: &PriceSummary, tolerance: f64) -> Vec<String> {
    let mut details = Vec::new();
    for class in CabinClass::ALL {
        let (old, new) = (stored.amount(class), fresh.amount(class));
        if differs(old, new, tolerance) {
            details.push(format!("{}: stored {} vs extracted {}", class.as_str(), show(old), show(new)));
        }
    }
    if differs(stored.cheapest, fresh.cheapest, tolerance) {
        details.push(format!(
            "cheapest: stored {} vs extracted {}",
            show(stored.cheapest),
            show(fresh.cheapest)
        ));
    }
    details
}

pub struct Auditor {
    store: Arc<dyn Store>,
    normalizer: Arc<Normalizer>,
    notifier: Arc<dyn Notifier>,
    tolerance: f64,
    mode: AuditMode,
}

impl Auditor {
    pub fn new(
        store: Arc<dyn Store>,
        normalizer: Arc<Normalizer>,
        notifier: Arc<dyn Notifier>,
        tolerance: f64,
        mode: AuditMode,
    ) -> Self {
        Self {
            store,
            normalizer,
            notifier,
            tolerance,
            mode,
        }
    }

    /// Verdict for one stored sailing, plus the freshly extracted record when extraction worked.
    pub fn check(&self, stored: &StoredSailing) -> (AuditVerdict, Option<SailingRecord>) {
        let Some(raw) = stored.raw.clone() else {
            return (
                AuditVerdict::Corrupt {
                    reason: "no raw payload stored".to_string(),
                },
                None,
            );
        };

        let mut ctx = ExtractContext::new(stored.line_id);
        if let Some(ship_id) = stored.ship_id {
            ctx = ctx.with_ship(ship_id);
        }
        if let Some(path) = &stored.source_path {
            ctx = ctx.with_source_path(path.clone());
        }

        let fresh = match self.normalizer.normalize_value(raw, &ctx) {
            Ok(fresh) => fresh,
            Err(err) => {
                return (
                    AuditVerdict::Corrupt {
                        reason: err.to_string(),
                    },
                    None,
                )
            }
        };

        let mut details = Vec::new();
        if !stored.prices.cheapest_is_consistent(self.tolerance) {
            details.push(format!(
                "stored cheapest {} is not the minimum class price {}",
                show(stored.prices.cheapest),
                show(stored.prices.computed_cheapest())
            ));
        }
        if fresh.instance_id != stored.instance_id {
            details.push(format!(
                "raw payload identifies instance {} instead",
                fresh.instance_id
            ));
        }
        details.extend(compare_prices(&stored.prices, &fresh.prices, self.tolerance));

        if details.is_empty() {
            (AuditVerdict::Match, Some(fresh))
        } else {
            (AuditVerdict::Mismatch { details }, Some(fresh))
        }
    }

    pub async fn run(&self, scope: AuditScope) -> Result<AuditSummary, PersistError> {
        let mut summary = AuditSummary::new(self.mode);
        match scope {
            AuditScope::Sample(size) => {
                let rows = self.store.stored_sample(size).await?;
                for row in &rows {
                    self.audit_one(row, &mut summary).await?;
                }
            }
            AuditScope::All { page_size } => {
                let mut after: Option<InstanceId> = None;
                loop {
                    let rows = self.store.stored_page(after.as_ref(), page_size.max(1)).await?;
                    let Some(last) = rows.last() else {
                        break;
                    };
                    after = Some(last.instance_id.clone());
                    for row in &rows {
                        self.audit_one(row, &mut summary).await?;
                    }
                    if rows.len() < page_size.max(1) {
                        break;
                    }
                }
            }
        }

        info!(
            mode = self.mode.as_str(),
            checked = summary.checked,
            mismatches = summary.mismatches,
            corrupt = summary.corrupt,
            repaired = summary.repaired,
            repair_failed = summary.repair_failed,
            "audit finished"
        );
        if summary.mismatches > 0 || summary.corrupt > 0 {
            self.notifier
                .notify(&PipelineEvent::AuditFindings {
                    mode: self.mode,
                    checked: summary.checked,
                    mismatches: summary.mismatches,
                    corrupt: summary.corrupt,
                    repaired: summary.repaired,
                })
                .await;
        }
        Ok(summary)
    }

    async fn audit_one(&self, stored: &StoredSailing, summary: &mut AuditSummary) -> Result<(), PersistError> {
        summary.checked += 1;
        let (verdict, fresh) = self.check(stored);
        let mut repaired = false;
        let mut repair_error = None;
        match &verdict {
            AuditVerdict::Match => {
                summary.matched += 1;
                return Ok(());
            }
            AuditVerdict::Mismatch { details } => {
                summary.mismatches += 1;
                warn!(instance_id = %stored.instance_id, details = ?details, "price mismatch");
                if self.mode == AuditMode::Repair {
                    if let Some(fresh) = fresh.filter(|f| f.instance_id == stored.instance_id) {
                        match self.store.upsert_sailing(&fresh).await {
                            Ok(_) => {
                                summary.repaired += 1;
                                repaired = true;
                            }
                            Err(err) => {
                                warn!(instance_id = %stored.instance_id, kind = %err.kind(), error = %err, "repair rejected");
                                summary.repair_failed += 1;
                                repair_error = Some(err.to_string());
                            }
                        }
                    }
                }
            }
            AuditVerdict::Corrupt { reason } => {
                summary.corrupt += 1;
                warn!(instance_id = %stored.instance_id, reason = %reason, "stored payload is corrupt");
            }
        }
        summary.findings.push(AuditFinding {
            instance_id: stored.instance_id.clone(),
            line_id: stored.line_id,
            verdict,
            repaired,
            repair_error,
        });
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error("sailing {0} is not stored")]
    UnknownSailing(InstanceId),
    #[error("sailing {0} has no recorded source path")]
    NoSourcePath(InstanceId),
    #[error("fetching {path} failed: {source}")]
    Remote {
        path: String,
        #[source]
        source: RemoteError,
    },
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("source file now describes sailing {found}, not {expected}")]
    IdentityChanged { expected: InstanceId, found: InstanceId },
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Re-fetches a sailing's source file from the remote, normalizes it and upserts the result.
pub async fn reconstruct(pipeline: &FilePipeline, instance_id: &InstanceId) -> Result<UpsertOutcome, ReconstructError> {
    let stored = pipeline
        .store()
        .sailing(instance_id)
        .await?
        .ok_or_else(|| ReconstructError::UnknownSailing(instance_id.clone()))?;
    let relative = stored
        .source_path
        .clone()
        .ok_or_else(|| ReconstructError::NoSourcePath(instance_id.clone()))?;
    let path = join_remote(pipeline.root(), &relative);

    let bytes = pipeline
        .remote()
        .fetch(&path)
        .await
        .map_err(|source| ReconstructError::Remote {
            path: path.clone(),
            source,
        })?;

    let mut ctx = ExtractContext::new(stored.line_id).with_source_path(relative);
    if let Some(ship_id) = stored.ship_id {
        ctx = ctx.with_ship(ship_id);
    }
    let record = pipeline.normalizer().normalize(&bytes, &ctx)?;
    if record.instance_id != stored.instance_id {
        return Err(ReconstructError::IdentityChanged {
            expected: stored.instance_id,
            found: record.instance_id,
        });
    }
    let outcome = pipeline.store().upsert_sailing(&record).await?;
    info!(instance_id = %instance_id, path = %path, "sailing reconstructed from source");
    Ok(outcome)
}
