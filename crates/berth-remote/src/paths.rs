//! Remote Path Resolver: `{year}/{month:02}/{lineId}/{shipId}/{sailingFileId}.json`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use berth_core::{LineId, Period};
use thiserror::Error;
use tracing::debug;

use crate::{RemoteError, RemoteFs};

/// Parsed location of one sailing file, relative to the feed root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedPath {
    pub period: Period,
    pub line_id: LineId,
    pub ship_id: i32,
    pub file_id: String,
}

impl FeedPath {
    /// Parses the trailing five segments of `path`; any leading root prefix is ignored.
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        if segments.len() < 5 {
            return None;
        }
        let tail = &segments[segments.len() - 5..];
        let year: i32 = tail[0].parse().ok()?;
        let month: u32 = tail[1].parse().ok()?;
        let line_id = LineId::new(tail[2].parse().ok()?)?;
        let ship_id: i32 = tail[3].parse().ok()?;
        let file_id = tail[4].strip_suffix(".json")?;
        if file_id.is_empty() || ship_id <= 0 {
            return None;
        }
        Some(Self {
            period: Period::new(year, month)?,
            line_id,
            ship_id,
            file_id: file_id.to_string(),
        })
    }
}

impl fmt::Display for FeedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.json",
            self.period, self.line_id, self.ship_id, self.file_id
        )
    }
}

/// A discovered sailing file: full remote path plus its parsed components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFile {
    pub path: String,
    pub feed: FeedPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineScope {
    All,
    Line(LineId),
}

#[derive(Debug, Clone, Error)]
#[error("listing {path} failed: {source}")]
pub struct WalkError {
    pub path: String,
    /// Set when the failure happened on the walker's first remote call.
    pub startup: bool,
    #[source]
    pub source: RemoteError,
}

pub fn join_remote(root: &str, relative: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        relative.to_string()
    } else {
        format!("{root}/{relative}")
    }
}

fn sorted_numeric<T: std::str::FromStr + Ord>(names: Vec<String>) -> VecDeque<T> {
    let mut ids: Vec<T> = names.iter().filter_map(|n| n.parse().ok()).collect();
    ids.sort();
    ids.dedup();
    ids.into()
}

/// Lazy, restartable walk over one period of the remote tree.
///
/// Only one directory listing per level is held at a time. Listings are
/// sorted, so a fresh walker over an unchanged tree yields the same sequence.
pub struct PeriodWalker {
    remote: Arc<dyn RemoteFs>,
    root: String,
    period: Period,
    scope: LineScope,
    calls_made: bool,
    lines_listed: bool,
    lines: VecDeque<LineId>,
    current_line: Option<LineId>,
    ships: VecDeque<i32>,
    current_ship: Option<i32>,
    files: VecDeque<String>,
}

impl PeriodWalker {
    pub fn new(remote: Arc<dyn RemoteFs>, root: impl Into<String>, period: Period, scope: LineScope) -> Self {
        Self {
            remote,
            root: root.into(),
            period,
            scope,
            calls_made: false,
            lines_listed: false,
            lines: VecDeque::new(),
            current_line: None,
            ships: VecDeque::new(),
            current_ship: None,
            files: VecDeque::new(),
        }
    }

    pub fn period(&self) -> Period {
        self.period
    }

    async fn list_dir(&mut self, relative: &str) -> Result<Option<Vec<String>>, WalkError> {
        let path = join_remote(&self.root, relative);
        let startup = !self.calls_made;
        self.calls_made = true;
        match self.remote.list(&path).await {
            Ok(names) => Ok(Some(names)),
            Err(RemoteError::NotFound(_)) => {
                debug!(path, "no remote directory; skipping");
                Ok(None)
            }
            Err(source) => Err(WalkError {
                path,
                startup,
                source,
            }),
        }
    }

    pub async fn next(&mut self) -> Result<Option<FeedFile>, WalkError> {
        loop {
            if let Some(file_name) = self.files.pop_front() {
                let (Some(line_id), Some(ship_id)) = (self.current_line, self.current_ship) else {
                    continue;
                };
                let Some(file_id) = file_name.strip_suffix(".json") else {
                    continue;
                };
                let feed = FeedPath {
                    period: self.period,
                    line_id,
                    ship_id,
                    file_id: file_id.to_string(),
                };
                let path = join_remote(&self.root, &feed.to_string());
                return Ok(Some(FeedFile { path, feed }));
            }

            if let Some(ship_id) = self.ships.pop_front() {
                let Some(line_id) = self.current_line else {
                    continue;
                };
                let relative = format!("{}/{}/{}", self.period, line_id, ship_id);
                self.current_ship = Some(ship_id);
                if let Some(names) = self.list_dir(&relative).await? {
                    let mut files: Vec<String> = names
                        .into_iter()
                        .filter(|n| n.ends_with(".json") && n.len() > ".json".len())
                        .collect();
                    files.sort();
                    self.files = files.into();
                }
                continue;
            }

            if let Some(line_id) = self.lines.pop_front() {
                let relative = format!("{}/{}", self.period, line_id);
                self.current_line = Some(line_id);
                if let Some(names) = self.list_dir(&relative).await? {
                    self.ships = sorted_numeric::<i32>(names)
                        .into_iter()
                        .filter(|id| *id > 0)
                        .collect();
                }
                continue;
            }

            if !self.lines_listed {
                self.lines_listed = true;
                match self.scope {
                    LineScope::Line(line_id) => self.lines.push_back(line_id),
                    LineScope::All => {
                        let relative = self.period.to_string();
                        if let Some(names) = self.list_dir(&relative).await? {
                            self.lines = sorted_numeric::<i64>(names)
                                .into_iter()
                                .filter_map(LineId::new)
                                .collect();
                        }
                    }
                }
                continue;
            }

            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::TransientIoError;

    fn period() -> Period {
        Period::new(2025, 5).unwrap()
    }

    fn tree() -> Arc<MemoryRemote> {
        let remote = MemoryRemote::new();
        remote.insert("feed/2025/05/16/412/S2.json", b"{}".to_vec());
        remote.insert("feed/2025/05/16/412/S1.json", b"{}".to_vec());
        remote.insert("feed/2025/05/16/98/S9.json", b"{}".to_vec());
        remote.insert("feed/2025/05/3/7/A.json", b"{}".to_vec());
        remote.insert("feed/2025/05/3/7/notes.txt", b"x".to_vec());
        remote.insert("feed/2025/05/tmp/1/B.json", b"{}".to_vec());
        Arc::new(remote)
    }

    async fn collect(mut walker: PeriodWalker) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(file) = walker.next().await.unwrap() {
            out.push(file.path);
        }
        out
    }

    #[test]
    fn feed_paths_round_trip_and_reject_garbage() {
        let parsed = FeedPath::parse("feed/2025/05/16/412/S1.json").unwrap();
        assert_eq!(parsed.line_id.get(), 16);
        assert_eq!(parsed.ship_id, 412);
        assert_eq!(parsed.file_id, "S1");
        assert_eq!(parsed.to_string(), "2025/05/16/412/S1.json");

        assert!(FeedPath::parse("2025/05/16/412/S1.txt").is_none());
        assert!(FeedPath::parse("2025/13/16/412/S1.json").is_none());
        assert!(FeedPath::parse("2025/05/0/412/S1.json").is_none());
        assert!(FeedPath::parse("05/16/412/S1.json").is_none());
    }

    #[tokio::test]
    async fn walks_lines_ships_and_files_in_sorted_order() {
        let walker = PeriodWalker::new(tree(), "feed", period(), LineScope::All);
        assert_eq!(
            collect(walker).await,
            vec![
                "feed/2025/05/3/7/A.json",
                "feed/2025/05/16/98/S9.json",
                "feed/2025/05/16/412/S1.json",
                "feed/2025/05/16/412/S2.json",
            ]
        );
    }

    #[tokio::test]
    async fn walk_is_restartable() {
        let remote = tree();
        let first = collect(PeriodWalker::new(remote.clone(), "feed", period(), LineScope::All)).await;
        let second = collect(PeriodWalker::new(remote, "feed", period(), LineScope::All)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_directories_mean_no_data() {
        let walker = PeriodWalker::new(tree(), "feed", Period::new(2031, 1).unwrap(), LineScope::All);
        assert!(collect(walker).await.is_empty());

        let line = LineId::new(77).unwrap();
        let walker = PeriodWalker::new(tree(), "feed", period(), LineScope::Line(line));
        assert!(collect(walker).await.is_empty());
    }

    #[tokio::test]
    async fn line_scope_never_lists_other_lines() {
        let remote = tree();
        let line = LineId::new(16).unwrap();
        let walker = PeriodWalker::new(remote.clone(), "feed", period(), LineScope::Line(line));
        let files = collect(walker).await;
        assert_eq!(files.len(), 3);
        assert!(remote.listed_paths().iter().all(|p| p.starts_with("feed/2025/05/16")));
    }

    #[tokio::test]
    async fn startup_failures_are_flagged_and_later_ones_are_not() {
        let remote = tree();
        remote.fail_list("feed/2025/05", RemoteError::Auth("530 login incorrect".into()));
        let mut walker = PeriodWalker::new(remote.clone(), "feed", period(), LineScope::All);
        let err = walker.next().await.unwrap_err();
        assert!(err.startup);

        let remote = tree();
        remote.fail_list(
            "feed/2025/05/16/98",
            TransientIoError::new("feed/2025/05/16/98", "reset").into(),
        );
        let mut walker = PeriodWalker::new(remote, "feed", period(), LineScope::All);
        let mut seen = Vec::new();
        let mut errors = Vec::new();
        loop {
            match walker.next().await {
                Ok(Some(file)) => seen.push(file.path),
                Ok(None) => break,
                Err(err) => errors.push(err),
            }
        }
        assert_eq!(errors.len(), 1);
        assert!(!errors[0].startup);
        assert_eq!(seen.len(), 3);
    }
}
