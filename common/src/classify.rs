//! Classification of mirroring-tool output lines
//!
//! The mirroring tool is run in one of two output grammars. In copy mode (and in list-only copy
//! mode used for resume) it announces each file with its size and reports per-file percentages.
//! In analysis mode it prints one classified line per difference between the two trees.
//!
//! Both classifiers are total: every input maps to exactly one event and nothing here panics or
//! performs I/O. A numeric field that fails to parse turns the whole line into [`CopyEvent::Other`]
//! so the caller treats it as unexpected output rather than crashing the stream loop.

use std::sync::LazyLock;

use regex::Regex;

use crate::state;

static SIZE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\t\s*(\S.*?)\s*$").expect("size/name pattern must compile")
});

static PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)?)%\s*$").expect("percent pattern must compile")
});

static EXTRA_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\*EXTRA File\s+(?:\d+\t\s*)?(\S.*?)\s*$")
        .expect("extra file pattern must compile")
});

static NEW_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*New File\s+(?:\d+\t\s*)?(\S.*?)\s*$").expect("new file pattern must compile")
});

static NEWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Newer\s+(?:\d+\t\s*)?(\S.*?)\s*$").expect("newer pattern must compile")
});

static OLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*Older\s+(?:\d+\t\s*)?(\S.*?)\s*$").expect("older pattern must compile")
});

/// Diagnostics the tool prints when the destination volume is full.
const DISK_FULL_PATTERNS: &[&str] = &[
    "ERROR 112 (0x00000070)",
    "There is not enough space on the disk",
    "No space left on device",
];

#[derive(Debug, Clone, PartialEq)]
pub enum CopyEvent {
    Empty,
    /// References a state marker file; never a real transferred file.
    MarkerFile,
    /// A new file is about to be copied.
    SizeName {
        size: u64,
        name: String,
    },
    /// Completion of the current file, strictly below 100%.
    Progress(f64),
    Prog100,
    DiskFull,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisEvent {
    Empty,
    MarkerFile,
    /// Present only in the destination.
    ExtraFile(String),
    /// Present only in the source.
    NewFile(String),
    /// Source copy is newer.
    Newer(String),
    /// Destination copy is newer.
    Older(String),
    Unrecognized(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Grammar {
    Copy,
    Analysis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Copy(CopyEvent),
    Analysis(AnalysisEvent),
}

pub fn classify(grammar: Grammar, line: &str) -> LineEvent {
    match grammar {
        Grammar::Copy => LineEvent::Copy(classify_copy(line)),
        Grammar::Analysis => LineEvent::Analysis(classify_analysis(line)),
    }
}

fn mentions_marker(line: &str) -> bool {
    line.contains(state::MARKER_PREFIX)
}

pub fn classify_copy(line: &str) -> CopyEvent {
    if line.trim().is_empty() {
        return CopyEvent::Empty;
    }
    if mentions_marker(line) {
        return CopyEvent::MarkerFile;
    }
    if DISK_FULL_PATTERNS
        .iter()
        .any(|pattern| line.contains(pattern))
    {
        return CopyEvent::DiskFull;
    }
    if let Some(caps) = SIZE_NAME.captures(line) {
        return match caps[1].parse::<u64>() {
            Ok(size) => CopyEvent::SizeName {
                size,
                name: caps[2].to_string(),
            },
            Err(_) => CopyEvent::Other(line.to_string()),
        };
    }
    if let Some(caps) = PERCENT.captures(line) {
        return match caps[1].parse::<f64>() {
            Ok(pct) if pct == 100.0 => CopyEvent::Prog100,
            Ok(pct) if (0.0..100.0).contains(&pct) => CopyEvent::Progress(pct),
            _ => CopyEvent::Other(line.to_string()),
        };
    }
    CopyEvent::Other(line.to_string())
}

pub fn classify_analysis(line: &str) -> AnalysisEvent {
    if line.trim().is_empty() {
        return AnalysisEvent::Empty;
    }
    if mentions_marker(line) {
        return AnalysisEvent::MarkerFile;
    }
    let name = |re: &Regex| re.captures(line).map(|caps| caps[1].to_string());
    if let Some(name) = name(&EXTRA_FILE) {
        AnalysisEvent::ExtraFile(name)
    } else if let Some(name) = name(&NEW_FILE) {
        AnalysisEvent::NewFile(name)
    } else if let Some(name) = name(&NEWER) {
        AnalysisEvent::Newer(name)
    } else if let Some(name) = name(&OLDER) {
        AnalysisEvent::Older(name)
    } else {
        AnalysisEvent::Unrecognized(line.to_string())
    }
}
