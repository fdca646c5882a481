//! Environment-driven configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use berth_remote::{BackoffPolicy, FtpConfig, PoolConfig};
use thiserror::Error;

use crate::auditor::AuditMode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub ftp_host: Option<String>,
    pub ftp_port: u16,
    pub ftp_user: Option<String>,
    pub ftp_password: Option<String>,
    pub ftp_root: String,
    pub pool_size: usize,
    pub ftp_timeout: Duration,
    pub max_retries: usize,
    pub batch_size: usize,
    pub inter_file_delay: Duration,
    pub fetch_concurrency: usize,
    pub failure_sample_size: usize,
    pub workers: usize,
    pub lock_ttl: Duration,
    pub requeue_delay: Duration,
    pub lookahead_months: u32,
    pub job_retention_days: i64,
    pub deactivate_after_days: i64,
    pub audit_mode: AuditMode,
    pub audit_tolerance: f64,
    pub audit_sample_size: Option<usize>,
    pub slack_webhook_url: Option<String>,
    pub reports_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub bulk_cron: Option<String>,
    pub audit_cron: Option<String>,
    pub maintenance_cron: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            ftp_host: None,
            ftp_port: 21,
            ftp_user: None,
            ftp_password: None,
            ftp_root: String::new(),
            pool_size: 3,
            ftp_timeout: Duration::from_secs(30),
            max_retries: 3,
            batch_size: 50,
            inter_file_delay: Duration::from_millis(100),
            fetch_concurrency: 1,
            failure_sample_size: 20,
            workers: 4,
            lock_ttl: Duration::from_secs(120),
            requeue_delay: Duration::from_secs(5),
            lookahead_months: 24,
            job_retention_days: 7,
            deactivate_after_days: 30,
            audit_mode: AuditMode::Report,
            audit_tolerance: 0.01,
            audit_sample_size: None,
            slack_webhook_url: None,
            reports_dir: PathBuf::from("./reports"),
            rules_dir: PathBuf::from("./rules"),
            web_port: 8000,
            scheduler_enabled: false,
            bulk_cron: None,
            audit_cron: None,
            maintenance_cron: None,
        }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, FatalConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| FatalConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn text(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> bool {
    lookup(var)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, FatalConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FatalConfigError> {
        let d = Self::default();
        let audit_mode = match text(&lookup, "BERTH_AUDIT_MODE") {
            Some(raw) => AuditMode::parse(&raw).ok_or(FatalConfigError::Invalid {
                var: "BERTH_AUDIT_MODE",
                reason: format!("expected `report` or `repair`, got `{raw}`"),
            })?,
            None => d.audit_mode,
        };
        let config = Self {
            database_url: text(&lookup, "DATABASE_URL"),
            ftp_host: text(&lookup, "BERTH_FTP_HOST"),
            ftp_port: parsed(&lookup, "BERTH_FTP_PORT", d.ftp_port)?,
            ftp_user: text(&lookup, "BERTH_FTP_USER"),
            ftp_password: lookup("BERTH_FTP_PASSWORD").filter(|v| !v.is_empty()),
            ftp_root: text(&lookup, "BERTH_FTP_ROOT").unwrap_or(d.ftp_root),
            pool_size: parsed(&lookup, "BERTH_POOL_SIZE", d.pool_size)?,
            ftp_timeout: Duration::from_secs(parsed(&lookup, "BERTH_FTP_TIMEOUT_SECS", d.ftp_timeout.as_secs())?),
            max_retries: parsed(&lookup, "BERTH_MAX_RETRIES", d.max_retries)?,
            batch_size: parsed(&lookup, "BERTH_BATCH_SIZE", d.batch_size)?,
            inter_file_delay: Duration::from_millis(parsed(
                &lookup,
                "BERTH_INTER_FILE_DELAY_MS",
                d.inter_file_delay.as_millis() as u64,
            )?),
            fetch_concurrency: parsed(&lookup, "BERTH_FETCH_CONCURRENCY", d.fetch_concurrency)?,
            failure_sample_size: parsed(&lookup, "BERTH_FAILURE_SAMPLE_SIZE", d.failure_sample_size)?,
            workers: parsed(&lookup, "BERTH_WORKERS", d.workers)?,
            lock_ttl: Duration::from_secs(parsed(&lookup, "BERTH_LOCK_TTL_SECS", d.lock_ttl.as_secs())?),
            requeue_delay: Duration::from_secs(parsed(
                &lookup,
                "BERTH_REQUEUE_DELAY_SECS",
                d.requeue_delay.as_secs(),
            )?),
            lookahead_months: parsed(&lookup, "BERTH_LOOKAHEAD_MONTHS", d.lookahead_months)?,
            job_retention_days: parsed(&lookup, "BERTH_JOB_RETENTION_DAYS", d.job_retention_days)?,
            deactivate_after_days: parsed(&lookup, "BERTH_DEACTIVATE_AFTER_DAYS", d.deactivate_after_days)?,
            audit_mode,
            audit_tolerance: parsed(&lookup, "BERTH_AUDIT_TOLERANCE", d.audit_tolerance)?,
            audit_sample_size: match text(&lookup, "BERTH_AUDIT_SAMPLE_SIZE") {
                Some(_) => Some(parsed(&lookup, "BERTH_AUDIT_SAMPLE_SIZE", 0usize)?),
                None => None,
            },
            slack_webhook_url: text(&lookup, "BERTH_SLACK_WEBHOOK_URL"),
            reports_dir: text(&lookup, "BERTH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.reports_dir),
            rules_dir: text(&lookup, "BERTH_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.rules_dir),
            web_port: parsed(&lookup, "BERTH_WEB_PORT", d.web_port)?,
            scheduler_enabled: flag(&lookup, "BERTH_SCHEDULER_ENABLED"),
            bulk_cron: text(&lookup, "BERTH_BULK_CRON"),
            audit_cron: text(&lookup, "BERTH_AUDIT_CRON"),
            maintenance_cron: text(&lookup, "BERTH_MAINTENANCE_CRON"),
        };
        Ok(config)
    }

    pub fn require_database(&self) -> Result<&str, FatalConfigError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(FatalConfigError::Missing("DATABASE_URL"))?;
        if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
            return Err(FatalConfigError::Invalid {
                var: "DATABASE_URL",
                reason: "expected a postgres:// URL".to_string(),
            });
        }
        Ok(url)
    }

    pub fn ftp_config(&self) -> Result<FtpConfig, FatalConfigError> {
        Ok(FtpConfig {
            host: self.ftp_host.clone().ok_or(FatalConfigError::Missing("BERTH_FTP_HOST"))?,
            port: self.ftp_port,
            user: self.ftp_user.clone().ok_or(FatalConfigError::Missing("BERTH_FTP_USER"))?,
            password: self
                .ftp_password
                .clone()
                .ok_or(FatalConfigError::Missing("BERTH_FTP_PASSWORD"))?,
            read_timeout: self.ftp_timeout,
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.pool_size,
            op_timeout: self.ftp_timeout,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
            ..PoolConfig::default()
        }
    }

    /// Checks everything a full sync process needs.
    pub fn validate(&self) -> Result<(), FatalConfigError> {
        self.require_database()?;
        self.ftp_config()?;
        let positive = [
            ("BERTH_POOL_SIZE", self.pool_size),
            ("BERTH_BATCH_SIZE", self.batch_size),
            ("BERTH_FETCH_CONCURRENCY", self.fetch_concurrency),
            ("BERTH_WORKERS", self.workers),
        ];
        for (var, value) in positive {
            if value == 0 {
                return Err(FatalConfigError::Invalid {
                    var,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.fetch_concurrency > self.pool_size {
            return Err(FatalConfigError::Invalid {
                var: "BERTH_FETCH_CONCURRENCY",
                reason: format!("must not exceed BERTH_POOL_SIZE ({})", self.pool_size),
            });
        }
        if self.lock_ttl < Duration::from_secs(3) {
            return Err(FatalConfigError::Invalid {
                var: "BERTH_LOCK_TTL_SECS",
                reason: "must be at least 3 seconds".to_string(),
            });
        }
        if !(self.audit_tolerance >= 0.0) {
            return Err(FatalConfigError::Invalid {
                var: "BERTH_AUDIT_TOLERANCE",
                reason: "must be a non-negative number".to_string(),
            });
        }
        Ok(())
    }
}
