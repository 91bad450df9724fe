use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use crate::entry::CacheEntry;
use crate::progress::{SharedStatistics, Statistics};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Populate,
    Resume,
    Evict { write_back: bool },
}

/// Why a job stopped early. The flags are independent; callers inspect them afterwards to pick
/// the message shown to the user.
#[derive(Debug, Default)]
pub struct CancelCauses {
    disk_full: AtomicBool,
    max_fill_exceeded: AtomicBool,
    error: AtomicBool,
}

impl CancelCauses {
    pub fn disk_full(&self) -> bool {
        self.disk_full.load(Ordering::Acquire)
    }

    pub fn max_fill_exceeded(&self) -> bool {
        self.max_fill_exceeded.load(Ordering::Acquire)
    }

    pub fn error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn any(&self) -> bool {
        self.disk_full() || self.max_fill_exceeded() || self.error()
    }

    pub fn set_disk_full(&self) {
        self.disk_full.store(true, Ordering::Release);
    }

    pub fn set_max_fill_exceeded(&self) {
        self.max_fill_exceeded.store(true, Ordering::Release);
    }

    pub fn set_error(&self) {
        self.error.store(true, Ordering::Release);
    }
}

impl std::fmt::Display for CancelCauses {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let causes: Vec<&str> = [
            (self.disk_full(), "disk full"),
            (self.max_fill_exceeded(), "max fill exceeded"),
            (self.error(), "error"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if causes.is_empty() {
            f.write_str("cancelled")
        } else {
            f.write_str(&causes.join(", "))
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JobSettings {
    /// Stop populating when the cache volume would be filled beyond this percentage.
    pub max_fill_percent: Option<f64>,
}

/// One requested populate, resume or evict operation against a cache entry.
///
/// A job is handed to the engine, which gives it back exactly once through
/// [`crate::JobEvent::Done`] or [`crate::JobEvent::Cancelled`]. It is not reused afterwards.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub entry: Arc<CacheEntry>,
    pub settings: JobSettings,
    pub stats: SharedStatistics,
    pub cancel: CancellationToken,
    pub causes: Arc<CancelCauses>,
    /// Captured output tail plus a trailing diagnostic line, filled when the job is cancelled.
    pub error_log: Vec<String>,
}

/// Cloneable view of a running job for cancelling and observing it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: u64,
    pub cancel: CancellationToken,
    pub causes: Arc<CancelCauses>,
    pub stats: SharedStatistics,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels because the cache volume reached its configured fill limit.
    pub fn cancel_on_max_fill(&self) {
        self.causes.set_max_fill_exceeded();
        self.cancel.cancel();
    }

    pub fn stats(&self) -> Statistics {
        self.stats.lock().clone()
    }
}

impl Job {
    pub fn new(kind: JobKind, entry: Arc<CacheEntry>) -> Self {
        Self::with_settings(kind, entry, JobSettings::default())
    }

    pub fn with_settings(kind: JobKind, entry: Arc<CacheEntry>, settings: JobSettings) -> Self {
        let stats = Statistics::new(entry.source_files(), entry.source_size());
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            entry,
            settings,
            stats: Arc::new(parking_lot::Mutex::new(stats)),
            cancel: CancellationToken::new(),
            causes: Default::default(),
            error_log: vec![],
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            cancel: self.cancel.clone(),
            causes: self.causes.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> Statistics {
        self.stats.lock().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled_on_disk_full(&self) -> bool {
        self.causes.disk_full()
    }

    pub fn cancelled_on_max_fill(&self) -> bool {
        self.causes.max_fill_exceeded()
    }

    pub fn cancelled_on_error(&self) -> bool {
        self.causes.error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryStatus;
    use crate::state::CacheState;

    fn entry() -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            "game",
            "/src/game",
            "/cache/game",
            EntryStatus {
                state: CacheState::Empty,
                cache_size: 0,
                cache_files: 0,
                source_size: 1000,
                source_files: 10,
            },
        ))
    }

    #[test]
    fn new_job_counts_source() {
        let job = Job::new(JobKind::Populate, entry());
        let stats = job.stats();
        assert_eq!(stats.files_to_copy, 10);
        assert_eq!(stats.bytes_to_copy, 1000);
        assert!(!job.is_cancelled());
        assert!(!job.causes.any());
        assert_ne!(job.id, Job::new(JobKind::Populate, entry()).id);
    }

    #[test]
    fn handle_cancels_job() {
        let job = Job::new(JobKind::Evict { write_back: true }, entry());
        let handle = job.handle();
        handle.cancel_on_max_fill();
        assert!(job.is_cancelled());
        assert!(job.cancelled_on_max_fill());
        assert!(!job.cancelled_on_disk_full());
        assert_eq!(job.causes.to_string(), "max fill exceeded");
    }

    #[test]
    fn causes_are_independent() {
        let causes = CancelCauses::default();
        assert_eq!(causes.to_string(), "cancelled");
        causes.set_disk_full();
        causes.set_error();
        assert!(causes.disk_full() && causes.error() && !causes.max_fill_exceeded());
        assert_eq!(causes.to_string(), "disk full, error");
    }
}
