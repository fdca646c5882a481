//! Remote feed access: FTP session pool with retry/backoff, plus the
//! `{year}/{month}/{line}/{ship}/{file}.json` path resolver.

use std::time::Duration;

use async_trait::async_trait;
use berth_core::FailureKind;
use thiserror::Error;

pub mod ftp;
pub mod memory;
pub mod paths;
pub mod pool;

pub use ftp::{FtpConfig, FtpConnector};
pub use memory::MemoryRemote;
pub use paths::{FeedFile, FeedPath, LineScope, PeriodWalker, WalkError};
pub use pool::{ConnectionManager, PoolConfig, RemoteSession, SessionFactory};

pub const CRATE_NAME: &str = "berth-remote";

/// Network or timeout failure; safe to retry.
#[derive(Debug, Clone, Error)]
#[error("transient remote I/O failure on {path}: {reason}")]
pub struct TransientIoError {
    pub path: String,
    pub reason: String,
    pub timed_out: bool,
}

impl TransientIoError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
            timed_out: false,
        }
    }

    pub fn timeout(path: impl Into<String>, after: Duration) -> Self {
        Self {
            path: path.into(),
            reason: format!("timed out after {}ms", after.as_millis()),
            timed_out: true,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Transient(#[from] TransientIoError),
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("remote authentication failed: {0}")]
    Auth(String),
    #[error("remote protocol error on {path}: {reason}")]
    Protocol { path: String, reason: String },
}

impl RemoteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RemoteError::Transient(_) => FailureKind::TransientIo,
            RemoteError::NotFound(_) => FailureKind::RemoteNotFound,
            RemoteError::Auth(_) => FailureKind::RemoteAuth,
            RemoteError::Protocol { .. } => FailureKind::RemoteProtocol,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            RemoteError::Transient(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Read-only view of the remote feed tree.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Entry names (last path segment) directly under `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>, RemoteError>;

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, RemoteError>;
}

/// Keeps only the last path segment; FTP servers differ on whether NLST echoes the directory.
pub(crate) fn entry_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}
