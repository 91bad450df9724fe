//! Cache directory lifecycle state and its on-disk marker files
//!
//! The persisted record of a cache directory's state is a zero-byte file inside that directory
//! named [`MARKER_PREFIX`] followed by the state name. Only the four "visible" states have a
//! marker; `Empty` and `Unknown` are represented by the absence of one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Prefix of every marker file name. Output lines mentioning it are never treated as content.
pub const MARKER_PREFIX: &str = ".rcache-state.";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    Empty,
    InProgress,
    Populated,
    Played,
    Invalid,
    Unknown,
}

impl CacheState {
    /// States persisted with a marker file.
    pub const MARKED: [CacheState; 4] = [
        CacheState::Played,
        CacheState::Populated,
        CacheState::InProgress,
        CacheState::Invalid,
    ];

    pub fn has_marker(self) -> bool {
        Self::MARKED.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheState::Empty => "Empty",
            CacheState::InProgress => "InProgress",
            CacheState::Populated => "Populated",
            CacheState::Played => "Played",
            CacheState::Invalid => "Invalid",
            CacheState::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CacheState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Empty" => Ok(CacheState::Empty),
            "InProgress" => Ok(CacheState::InProgress),
            "Populated" => Ok(CacheState::Populated),
            "Played" => Ok(CacheState::Played),
            "Invalid" => Ok(CacheState::Invalid),
            "Unknown" => Ok(CacheState::Unknown),
            _ => Err(anyhow::anyhow!("unknown cache state {:?}", s)),
        }
    }
}

pub fn marker_name(state: CacheState) -> Option<String> {
    state
        .has_marker()
        .then(|| format!("{}{}", MARKER_PREFIX, state))
}

/// Returns the state a marker file name stands for, if it is one.
pub fn parse_marker_name(name: &str) -> Option<CacheState> {
    let state = name.strip_prefix(MARKER_PREFIX)?.parse::<CacheState>().ok()?;
    state.has_marker().then_some(state)
}

pub fn is_marker_name(name: &str) -> bool {
    parse_marker_name(name).is_some()
}

/// Persists `state` for `dir`: removes every marker, then creates the one for `state` (if any).
#[tracing::instrument]
pub async fn mark(dir: &std::path::Path, state: CacheState) -> Result<()> {
    for old in CacheState::MARKED {
        let Some(name) = marker_name(old) else {
            continue;
        };
        let path = dir.join(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!("removed marker {:?}", &path),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed removing marker {:?}", &path));
            }
        }
    }
    if let Some(name) = marker_name(state) {
        let path = dir.join(name);
        tokio::fs::write(&path, b"")
            .await
            .with_context(|| format!("failed creating marker {:?}", &path))?;
        tracing::debug!("created marker {:?}", &path);
    }
    Ok(())
}

/// Reads the persisted state of `dir`.
///
/// Without a marker a missing or empty directory is `Empty` and anything else is `Unknown`.
/// More than one marker breaks the protocol's invariant and is also reported as `Unknown`.
pub async fn read_marker(dir: &std::path::Path) -> Result<CacheState> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(CacheState::Empty),
        Err(err) => {
            return Err(err).with_context(|| format!("cannot open directory {:?} for reading", dir));
        }
    };
    let mut found = vec![];
    let mut has_content = false;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        match parse_marker_name(&entry.file_name().to_string_lossy()) {
            Some(state) => found.push(state),
            None => has_content = true,
        }
    }
    match found.as_slice() {
        [] if has_content => Ok(CacheState::Unknown),
        [] => Ok(CacheState::Empty),
        [state] => Ok(*state),
        _ => {
            tracing::warn!("multiple state markers in {:?}: {:?}", dir, &found);
            Ok(CacheState::Unknown)
        }
    }
}
