//! Pipeline events and where they go: a Slack incoming webhook, or the log when none is configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::{LineId, Period, RunCounters};
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auditor::AuditMode;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    BulkRunCompleted {
        run_id: Uuid,
        periods: Vec<Period>,
        counters: RunCounters,
        partially_failed: usize,
        report_dir: Option<String>,
    },
    BulkRunFailed {
        run_id: Uuid,
        period: Period,
        error: String,
        report_dir: Option<String>,
    },
    WebhookJobFailed {
        job_id: Uuid,
        line_id: LineId,
        error: String,
    },
    AuditFindings {
        mode: AuditMode,
        checked: usize,
        mismatches: usize,
        corrupt: usize,
        repaired: usize,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::BulkRunCompleted { .. } => "bulk_run_completed",
            PipelineEvent::BulkRunFailed { .. } => "bulk_run_failed",
            PipelineEvent::WebhookJobFailed { .. } => "webhook_job_failed",
            PipelineEvent::AuditFindings { .. } => "audit_findings",
        }
    }

    pub fn title(&self) -> String {
        match self {
            PipelineEvent::BulkRunCompleted { partially_failed, .. } if *partially_failed > 0 => {
                "Bulk sync finished with failures".to_string()
            }
            PipelineEvent::BulkRunCompleted { .. } => "Bulk sync completed".to_string(),
            PipelineEvent::BulkRunFailed { period, .. } => format!("Bulk sync of {period} failed"),
            PipelineEvent::WebhookJobFailed { line_id, .. } => format!("Line {line_id} sync failed"),
            PipelineEvent::AuditFindings { .. } => "Consistency audit findings".to_string(),
        }
    }

    pub fn details(&self) -> String {
        match self {
            PipelineEvent::BulkRunCompleted {
                run_id,
                periods,
                counters,
                partially_failed,
                report_dir,
            } => {
                let span = match (periods.first(), periods.last()) {
                    (Some(first), Some(last)) if first != last => format!("{first} to {last}"),
                    (Some(first), _) => first.to_string(),
                    _ => "none".to_string(),
                };
                let mut text = format!(
                    "Run: `{run_id}`\nPeriods: {span} ({partially_failed} partially failed)\nFiles: {} seen, {} skipped, {} ok, {} failed\nSailings: {} inserted, {} updated, {} anomalies",
                    counters.files_seen,
                    counters.files_skipped,
                    counters.succeeded,
                    counters.failed,
                    counters.inserted,
                    counters.updated,
                    counters.anomalies,
                );
                if let Some(dir) = report_dir {
                    text.push_str(&format!("\nReport: `{dir}`"));
                }
                text
            }
            PipelineEvent::BulkRunFailed {
                run_id,
                period,
                error,
                report_dir,
            } => {
                let mut text = format!("Run: `{run_id}`\nPeriod: {period}\nError: {error}");
                if let Some(dir) = report_dir {
                    text.push_str(&format!("\nReport: `{dir}`"));
                }
                text
            }
            PipelineEvent::WebhookJobFailed { job_id, line_id, error } => {
                format!("Job: `{job_id}`\nLine: {line_id}\nError: {error}")
            }
            PipelineEvent::AuditFindings {
                mode,
                checked,
                mismatches,
                corrupt,
                repaired,
            } => format!(
                "Mode: {}\nChecked: {checked}\nMismatches: {mismatches} ({repaired} repaired)\nCorrupt: {corrupt}",
                mode.as_str()
            ),
        }
    }

    /// Slack incoming-webhook body: fallback text plus header/section/context blocks.
    pub fn slack_payload(&self) -> JsonValue {
        let title = self.title();
        json!({
            "text": title,
            "blocks": [
                {
                    "type": "header",
                    "text": { "type": "plain_text", "text": title }
                },
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": self.details() }
                },
                {
                    "type": "context",
                    "elements": [
                        {
                            "type": "mrkdwn",
                            "text": format!("Sent at {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))
                        }
                    ]
                }
            ]
        })
    }
}

/// Fire-and-forget event sink. Implementations swallow and log their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &PipelineEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &PipelineEvent) {
        info!(event = event.name(), title = %event.title(), details = %event.details(), "pipeline event");
    }
}

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, event: &PipelineEvent) {
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&event.slack_payload())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(event = event.name(), "notification sent");
            }
            Ok(resp) => {
                warn!(event = event.name(), status = %resp.status(), "notification rejected");
            }
            Err(err) => {
                warn!(event = event.name(), error = %err, "notification failed");
            }
        }
    }
}

/// Slack when a webhook URL is configured, otherwise the log.
pub fn notifier_from_config(slack_webhook_url: Option<&str>) -> Arc<dyn Notifier> {
    match slack_webhook_url {
        Some(url) => match SlackNotifier::new(url) {
            Ok(slack) => Arc::new(slack),
            Err(err) => {
                warn!(error = %err, "could not build slack client; falling back to log notifier");
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slack_payload_has_text_and_blocks() {
        let event = PipelineEvent::WebhookJobFailed {
            job_id: Uuid::nil(),
            line_id: LineId::new(16).unwrap(),
            error: "remote authentication failed".into(),
        };
        let payload = event.slack_payload();
        assert_eq!(payload["text"], "Line 16 sync failed");
        let blocks = payload["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0]["type"], "header");
        assert!(blocks[1]["text"]["text"]
            .as_str()
            .unwrap()
            .contains("remote authentication failed"));
        assert_eq!(blocks[2]["type"], "context");
    }

    #[test]
    fn bulk_title_reflects_partial_failure() {
        let mut event = PipelineEvent::BulkRunCompleted {
            run_id: Uuid::nil(),
            periods: vec![Period::new(2025, 5).unwrap(), Period::new(2025, 6).unwrap()],
            counters: RunCounters::default(),
            partially_failed: 0,
            report_dir: None,
        };
        assert_eq!(event.title(), "Bulk sync completed");
        assert!(event.details().contains("2025/05 to 2025/06"));
        if let PipelineEvent::BulkRunCompleted { partially_failed, .. } = &mut event {
            *partially_failed = 1;
        }
        assert_eq!(event.title(), "Bulk sync finished with failures");
    }

    #[tokio::test]
    async fn unreachable_slack_does_not_propagate() {
        let notifier = SlackNotifier::new("http://127.0.0.1:9/hook").unwrap();
        notifier
            .notify(&PipelineEvent::AuditFindings {
                mode: AuditMode::Report,
                checked: 3,
                mismatches: 1,
                corrupt: 0,
                repaired: 0,
            })
            .await;
    }
}
