//! Pooled, reconnecting access to the remote file server.
//!
//! Sessions are blocking (the FTP client is synchronous), so every operation
//! runs on the blocking thread pool under a hard timeout. A session is owned
//! by exactly one operation at a time: it is moved into the blocking task and
//! only returns to the idle list once that task hands it back. The pool
//! permit travels with the session, so a timed-out task keeps its slot until
//! the blocking call actually returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info_span, warn, Instrument};

use crate::{BackoffPolicy, RemoteError, RemoteFs, RetryDisposition, TransientIoError};

pub trait RemoteSession: Send + 'static {
    fn list(&mut self, path: &str) -> Result<Vec<String>, RemoteError>;
    fn fetch(&mut self, path: &str) -> Result<Vec<u8>, RemoteError>;
}

pub trait SessionFactory: Send + Sync + 'static {
    type Session: RemoteSession;

    /// Opens and authenticates a new session. Called on a blocking thread.
    fn connect(&self) -> Result<Self::Session, RemoteError>;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub op_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive transient failures after which a pooled session is discarded.
    pub reconnect_after: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            op_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            reconnect_after: 2,
        }
    }
}

struct Pooled<S> {
    session: S,
    consecutive_failures: u32,
}

pub struct ConnectionManager<F: SessionFactory> {
    factory: Arc<F>,
    idle: Mutex<Vec<Pooled<F::Session>>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    connects: AtomicU64,
}

type SessionOp<S, T> = fn(&mut S, &str) -> Result<T, RemoteError>;

impl<F: SessionFactory> ConnectionManager<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            idle: Mutex::new(Vec::new()),
            permits: Arc::new(Semaphore::new(config.pool_size.max(1))),
            config,
            connects: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of sessions opened over the manager's lifetime.
    pub fn connections_opened(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Drops every idle session so the next borrow reconnects.
    pub async fn force_reconnect(&self) {
        let dropped = {
            let mut idle = self.idle.lock().await;
            std::mem::take(&mut *idle)
        };
        debug!(sessions = dropped.len(), "forced reconnect of idle sessions");
    }

    async fn checkout(
        &self,
        path: &str,
        permit: OwnedSemaphorePermit,
    ) -> Result<(Pooled<F::Session>, OwnedSemaphorePermit), RemoteError> {
        if let Some(pooled) = self.idle.lock().await.pop() {
            return Ok((pooled, permit));
        }

        let factory = Arc::clone(&self.factory);
        let handle = tokio::task::spawn_blocking(move || (factory.connect(), permit));
        match timeout(self.config.op_timeout, handle).await {
            Err(_) => Err(TransientIoError::timeout(path, self.config.op_timeout).into()),
            Ok(Err(join_err)) => {
                Err(TransientIoError::new(path, format!("connect task failed: {join_err}")).into())
            }
            Ok(Ok((result, permit))) => {
                let session = result?;
                self.connects.fetch_add(1, Ordering::Relaxed);
                Ok((
                    Pooled {
                        session,
                        consecutive_failures: 0,
                    },
                    permit,
                ))
            }
        }
    }

    async fn checkin(&self, pooled: Pooled<F::Session>) {
        self.idle.lock().await.push(pooled);
    }

    async fn run_once<T: Send + 'static>(
        &self,
        path: &str,
        op: SessionOp<F::Session, T>,
    ) -> Result<T, RemoteError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| TransientIoError::new(path, "session pool closed"))?;
        let (mut pooled, permit) = self.checkout(path, permit).await?;

        let owned_path = path.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let result = op(&mut pooled.session, &owned_path);
            (pooled, result, permit)
        });

        let (mut pooled, result, _permit) = match timeout(self.config.op_timeout, handle).await {
            Err(_) => {
                warn!(path, "remote operation timed out; discarding session");
                return Err(TransientIoError::timeout(path, self.config.op_timeout).into());
            }
            Ok(Err(join_err)) => {
                return Err(
                    TransientIoError::new(path, format!("session task failed: {join_err}")).into(),
                );
            }
            Ok(Ok(done)) => done,
        };

        match &result {
            Ok(_) | Err(RemoteError::NotFound(_)) | Err(RemoteError::Protocol { .. }) => {
                pooled.consecutive_failures = 0;
                self.checkin(pooled).await;
            }
            Err(RemoteError::Transient(_)) => {
                pooled.consecutive_failures += 1;
                if pooled.consecutive_failures >= self.config.reconnect_after {
                    warn!(
                        path,
                        failures = pooled.consecutive_failures,
                        "discarding session after repeated failures"
                    );
                } else {
                    self.checkin(pooled).await;
                }
            }
            Err(RemoteError::Auth(_)) => {}
        }
        result
    }

    async fn with_retry<T: Send + 'static>(
        &self,
        path: &str,
        op: SessionOp<F::Session, T>,
    ) -> Result<T, RemoteError> {
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            match self.run_once(path, op).await {
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < backoff.max_retries =>
                {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(path, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying remote operation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<F: SessionFactory> RemoteFs for ConnectionManager<F> {
    async fn list(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let span = info_span!("remote_list", path);
        self.with_retry(path, <F::Session as RemoteSession>::list)
            .instrument(span)
            .await
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let span = info_span!("remote_fetch", path);
        self.with_retry(path, <F::Session as RemoteSession>::fetch)
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct Script {
        failures_left: AtomicUsize,
        fetch_calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        op_sleep_ms: AtomicU64,
    }

    struct FakeFactory {
        script: Arc<Script>,
    }

    struct FakeSession {
        script: Arc<Script>,
        busy: Arc<AtomicBool>,
    }

    impl RemoteSession for FakeSession {
        fn list(&mut self, path: &str) -> Result<Vec<String>, RemoteError> {
            if path.ends_with("missing") {
                return Err(RemoteError::NotFound(path.to_string()));
            }
            Ok(vec!["16".to_string()])
        }

        fn fetch(&mut self, path: &str) -> Result<Vec<u8>, RemoteError> {
            assert!(!self.busy.swap(true, Ordering::SeqCst), "session borrowed twice");
            let now = self.script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.script.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.script.fetch_calls.fetch_add(1, Ordering::SeqCst);

            let sleep_ms = self.script.op_sleep_ms.load(Ordering::SeqCst);
            if sleep_ms > 0 {
                std::thread::sleep(Duration::from_millis(sleep_ms));
            }

            let failing = self
                .script
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            self.script.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.busy.store(false, Ordering::SeqCst);
            if failing {
                Err(TransientIoError::new(path, "connection reset").into())
            } else {
                Ok(path.as_bytes().to_vec())
            }
        }
    }

    impl SessionFactory for FakeFactory {
        type Session = FakeSession;

        fn connect(&self) -> Result<FakeSession, RemoteError> {
            Ok(FakeSession {
                script: Arc::clone(&self.script),
                busy: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    fn manager(script: &Arc<Script>, pool_size: usize, max_retries: usize) -> ConnectionManager<FakeFactory> {
        ConnectionManager::new(
            FakeFactory {
                script: Arc::clone(script),
            },
            PoolConfig {
                pool_size,
                op_timeout: Duration::from_millis(500),
                backoff: BackoffPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(4),
                },
                reconnect_after: 2,
            },
        )
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let script = Arc::new(Script::default());
        script.failures_left.store(2, Ordering::SeqCst);
        let remote = manager(&script, 1, 3);

        let bytes = remote.fetch("2025/05/16/412/S1.json").await.unwrap();
        assert_eq!(bytes, b"2025/05/16/412/S1.json");
        assert_eq!(script.fetch_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_configured_maximum() {
        let script = Arc::new(Script::default());
        script.failures_left.store(10, Ordering::SeqCst);
        let remote = manager(&script, 1, 3);

        let err = remote.fetch("a.json").await.unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
        assert_eq!(script.fetch_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn repeated_failures_force_a_reconnect() {
        let script = Arc::new(Script::default());
        script.failures_left.store(2, Ordering::SeqCst);
        let remote = manager(&script, 1, 3);

        remote.fetch("a.json").await.unwrap();
        assert_eq!(remote.connections_opened(), 2);

        remote.force_reconnect().await;
        remote.fetch("b.json").await.unwrap();
        assert_eq!(remote.connections_opened(), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let script = Arc::new(Script::default());
        let remote = manager(&script, 1, 3);
        let err = remote.list("2025/05/missing").await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
        assert_eq!(remote.connections_opened(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn borrows_are_exclusive_and_bounded_by_pool_size() {
        let script = Arc::new(Script::default());
        script.op_sleep_ms.store(20, Ordering::SeqCst);
        let remote = Arc::new(manager(&script, 2, 0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let remote = Arc::clone(&remote);
            handles.push(tokio::spawn(async move {
                remote.fetch(&format!("{i}.json")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(script.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert!(remote.connections_opened() <= 2);
    }

    #[tokio::test]
    async fn slow_operations_time_out_as_transient() {
        let script = Arc::new(Script::default());
        script.op_sleep_ms.store(300, Ordering::SeqCst);
        let remote = ConnectionManager::new(
            FakeFactory {
                script: Arc::clone(&script),
            },
            PoolConfig {
                pool_size: 1,
                op_timeout: Duration::from_millis(50),
                backoff: BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                reconnect_after: 2,
            },
        );

        match remote.fetch("slow.json").await {
            Err(RemoteError::Transient(err)) => assert!(err.timed_out),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_session_keeps_its_pool_slot() {
        let script = Arc::new(Script::default());
        script.op_sleep_ms.store(200, Ordering::SeqCst);
        let remote = ConnectionManager::new(
            FakeFactory {
                script: Arc::clone(&script),
            },
            PoolConfig {
                pool_size: 1,
                op_timeout: Duration::from_millis(50),
                backoff: BackoffPolicy {
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
                reconnect_after: 2,
            },
        );

        assert!(remote.fetch("slow.json").await.is_err());
        script.op_sleep_ms.store(0, Ordering::SeqCst);
        let started = std::time::Instant::now();
        remote.fetch("next.json").await.unwrap();

        // The second borrow waited for the abandoned blocking call to finish.
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(script.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(remote.connections_opened(), 2);
    }
}
