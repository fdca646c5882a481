//! In-memory remote tree for dry runs and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::paths::FeedPath;
use crate::{RemoteError, RemoteFs, TransientIoError};

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    list_failures: HashMap<String, RemoteError>,
    fetch_failures: HashMap<String, usize>,
    listed: Vec<String>,
    fetched: Vec<String>,
    in_flight: usize,
    max_in_flight: usize,
    in_flight_by_line: HashMap<i32, usize>,
    max_in_flight_by_line: HashMap<i32, usize>,
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    fetch_delay: Duration,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps for `delay`, which makes overlapping fetches observable.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.state().files.insert(path.into(), bytes);
    }

    pub fn remove(&self, path: &str) {
        self.state().files.remove(path);
    }

    /// Every `list(path)` fails with `err` until cleared.
    pub fn fail_list(&self, path: impl Into<String>, err: RemoteError) {
        self.state().list_failures.insert(path.into(), err);
    }

    /// The next `times` fetches of `path` fail transiently.
    pub fn fail_fetch(&self, path: impl Into<String>, times: usize) {
        self.state().fetch_failures.insert(path.into(), times);
    }

    pub fn listed_paths(&self) -> Vec<String> {
        self.state().listed.clone()
    }

    pub fn fetched_paths(&self) -> Vec<String> {
        self.state().fetched.clone()
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.state().max_in_flight
    }

    /// Highest number of simultaneous fetches observed for one line.
    pub fn max_concurrent_fetches_for_line(&self, line_id: i32) -> usize {
        self.state()
            .max_in_flight_by_line
            .get(&line_id)
            .copied()
            .unwrap_or(0)
    }

    fn begin_fetch(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let mut state = self.state();
        state.fetched.push(path.to_string());
        if let Some(left) = state.fetch_failures.get_mut(path) {
            if *left > 0 {
                *left -= 1;
                return Err(TransientIoError::new(path, "injected failure").into());
            }
        }
        let Some(bytes) = state.files.get(path).cloned() else {
            return Err(RemoteError::NotFound(path.to_string()));
        };
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        if let Some(feed) = FeedPath::parse(path) {
            let line = feed.line_id.get();
            let now = {
                let entry = state.in_flight_by_line.entry(line).or_default();
                *entry += 1;
                *entry
            };
            let max = state.max_in_flight_by_line.entry(line).or_default();
            *max = (*max).max(now);
        }
        Ok(bytes)
    }

    fn end_fetch(&self, path: &str) {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(feed) = FeedPath::parse(path) {
            if let Some(entry) = state.in_flight_by_line.get_mut(&feed.line_id.get()) {
                *entry = entry.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl RemoteFs for MemoryRemote {
    async fn list(&self, path: &str) -> Result<Vec<String>, RemoteError> {
        let mut state = self.state();
        state.listed.push(path.to_string());
        if let Some(err) = state.list_failures.get(path) {
            return Err(err.clone());
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let children: BTreeSet<String> = state
            .files
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        if children.is_empty() {
            return Err(RemoteError::NotFound(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    async fn fetch(&self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let bytes = self.begin_fetch(path)?;
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        self.end_fetch(path);
        Ok(bytes)
    }
}
