use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::bulk::BulkRunReport;

/// Writes `summary.json` and `summary.md` under `{reports_root}/{run_id}/`.
pub async fn write_bulk_report(reports_root: &Path, report: &BulkRunReport) -> Result<PathBuf> {
    let reports_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing bulk run summary")?;
    fs::write(reports_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    fs::write(reports_dir.join("summary.md"), bulk_markdown(report))
        .await
        .context("writing summary.md")?;

    Ok(reports_dir)
}

pub fn bulk_markdown(report: &BulkRunReport) -> String {
    let totals = report.totals();
    let mut out = format!(
        "# Berth Bulk Sync\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Stopped early: {}\n- Files: {} seen, {} skipped, {} succeeded, {} failed\n- Sailings: {} inserted, {} updated\n- Price anomalies: {}\n\n## Periods\n\n| period | status | seen | skipped | ok | failed | inserted | updated | elapsed ms |\n|---|---|---|---|---|---|---|---|---|\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        if report.cancelled { "yes" } else { "no" },
        totals.files_seen,
        totals.files_skipped,
        totals.succeeded,
        totals.failed,
        totals.inserted,
        totals.updated,
        totals.anomalies,
    );
    for period in &report.periods {
        let c = &period.tally.counters;
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} | {} |\n",
            period.period,
            period.status.as_str(),
            c.files_seen,
            c.files_skipped,
            c.succeeded,
            c.failed,
            c.inserted,
            c.updated,
            period.elapsed_ms,
        ));
    }

    if !totals.failures_by_kind.is_empty() {
        out.push_str("\n## Failures by kind\n");
        for (kind, n) in &totals.failures_by_kind {
            out.push_str(&format!("- {kind}: {n}\n"));
        }
    }

    let samples: Vec<_> = report
        .periods
        .iter()
        .flat_map(|p| p.tally.failure_samples.iter())
        .collect();
    if !samples.is_empty() {
        out.push_str("\n## Failure samples\n");
        for sample in samples {
            out.push_str(&format!("- `{}` ({}): {}\n", sample.path, sample.kind, sample.message));
        }
    }
    out
}
