use enum_map::{Enum, EnumMap};
use serde::Serialize;

use crate::classify::AnalysisEvent;
use crate::state::CacheState;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum, Serialize)]
pub enum DiffKind {
    Extra, // present only in the destination
    New,   // present only in the source
    Newer, // source copy is newer
    Older, // destination copy is newer
}

pub type DiffFiles = EnumMap<DiffKind, Vec<String>>;

/// Outcome of an analysis run: the differing file names in the order the tool reported them.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DiffResult {
    pub files: DiffFiles,
    /// The destination did not exist or held no content, no comparison was run.
    pub dest_empty: bool,
}

impl DiffResult {
    pub fn empty_destination() -> Self {
        Self {
            dest_empty: true,
            ..Default::default()
        }
    }

    /// Records an analysis event, returns `false` for lines that are not differences.
    pub fn record(&mut self, event: AnalysisEvent) -> bool {
        let (kind, name) = match event {
            AnalysisEvent::ExtraFile(name) => (DiffKind::Extra, name),
            AnalysisEvent::NewFile(name) => (DiffKind::New, name),
            AnalysisEvent::Newer(name) => (DiffKind::Newer, name),
            AnalysisEvent::Older(name) => (DiffKind::Older, name),
            _ => return false,
        };
        self.files[kind].push(name);
        true
    }

    pub fn total(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn count(&self, kind: DiffKind) -> usize {
        self.files[kind].len()
    }

    /// When the analysis ran from the cache towards the source: files that exist only in the
    /// cache or are newer there would be lost by deleting it.
    pub fn is_dirty(&self) -> bool {
        self.count(DiffKind::New) > 0 || self.count(DiffKind::Newer) > 0
    }

    /// State of a cache analyzed as the destination of its source.
    pub fn implied_state(&self) -> CacheState {
        if self.dest_empty {
            CacheState::Empty
        } else if self.count(DiffKind::Extra) > 0 || self.count(DiffKind::Newer) > 0 {
            CacheState::Invalid
        } else if self.count(DiffKind::New) > 0 || self.count(DiffKind::Older) > 0 {
            CacheState::InProgress
        } else {
            CacheState::Populated
        }
    }
}

impl std::fmt::Display for DiffResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.dest_empty {
            return writeln!(f, "destination empty");
        }
        for (kind, names) in &self.files {
            writeln!(f, "{:?}: {}", kind, names.len())?;
        }
        writeln!(f, "total: {}", self.total())
    }
}
