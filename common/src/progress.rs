use serde::Serialize;

use crate::classify::CopyEvent;

/// Progress counters of one job.
///
/// Only the process driver mutates these while a job runs; observers read snapshots. The
/// authoritative number of bytes transferred is [`Statistics::bytes_copied_total`], which adds the
/// completed part of the current file to the finished files exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    #[serde(skip)]
    pub start_time: std::time::Instant,
    pub files_to_copy: u64,
    pub bytes_to_copy: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
    /// Bytes already present when the job started (resume baseline).
    pub resume_bytes: u64,
    pub percent_done: f64,
    pub curr_file_name: String,
    pub curr_file_size: u64,
    pub curr_file_pct: f64,
}

pub type SharedStatistics = std::sync::Arc<parking_lot::Mutex<Statistics>>;

/// What applying a copy event did to the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Applied {
    /// A file was folded into the totals.
    pub completed_file: bool,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Statistics {
    pub fn new(files_to_copy: u64, bytes_to_copy: u64) -> Self {
        Self {
            start_time: std::time::Instant::now(),
            files_to_copy,
            bytes_to_copy,
            files_copied: 0,
            bytes_copied: 0,
            resume_bytes: 0,
            percent_done: 0.0,
            curr_file_name: String::new(),
            curr_file_size: 0,
            curr_file_pct: 0.0,
        }
    }

    pub fn reset(&mut self, files_to_copy: u64, bytes_to_copy: u64) {
        *self = Self::new(files_to_copy, bytes_to_copy);
    }

    pub fn curr_file_bytes(&self) -> u64 {
        let partial = (self.curr_file_size as f64 * self.curr_file_pct / 100.0).floor() as u64;
        partial.min(self.curr_file_size)
    }

    pub fn bytes_copied_total(&self) -> u64 {
        self.bytes_copied.saturating_add(self.curr_file_bytes())
    }

    pub fn update_percent_done(&mut self) {
        self.percent_done = if self.bytes_to_copy > 0 {
            100.0 * self.bytes_copied_total() as f64 / self.bytes_to_copy as f64
        } else {
            0.0
        };
    }

    /// Adopts a newly announced file. Totals grow if the tool reports more than was expected,
    /// e.g. when the source changed after it was measured.
    pub fn begin_file(&mut self, name: &str, size: u64) {
        self.curr_file_name = name.to_string();
        self.curr_file_size = size;
        self.curr_file_pct = 0.0;
        self.files_to_copy = self.files_to_copy.max(self.files_copied.saturating_add(1));
        self.bytes_to_copy = self.bytes_to_copy.max(self.bytes_copied.saturating_add(size));
    }

    /// Folds the current file into the totals, at most once per announced file.
    pub fn complete_current_file(&mut self) -> bool {
        if self.curr_file_name.is_empty() {
            return false;
        }
        self.files_copied = self.files_copied.saturating_add(1);
        self.bytes_copied = self.bytes_copied.saturating_add(self.curr_file_size);
        self.curr_file_name.clear();
        self.curr_file_size = 0;
        self.curr_file_pct = 0.0;
        true
    }

    /// Applies one copy-mode progress event; other events leave the counters untouched.
    pub fn apply(&mut self, event: &CopyEvent) -> Applied {
        let mut applied = Applied::default();
        match event {
            CopyEvent::SizeName { size, name } => {
                // the previous file never reported 100%, it is done once the next one starts
                if self.curr_file_pct > 0.0 {
                    applied.completed_file = self.complete_current_file();
                }
                self.begin_file(name, *size);
            }
            CopyEvent::Prog100 => {
                if self.curr_file_size > 0 {
                    applied.completed_file = self.complete_current_file();
                } else if !self.curr_file_name.is_empty() {
                    // zero-byte file, counted when the next file starts or the run ends
                    self.curr_file_pct = 100.0;
                }
            }
            CopyEvent::Progress(pct) => {
                if !self.curr_file_name.is_empty() {
                    self.curr_file_pct = *pct;
                }
            }
            _ => {}
        }
        self.update_percent_done();
        applied
    }

    /// Starts a resume scan as if everything had been copied already.
    pub fn begin_resume_scan(&mut self, files_to_copy: u64, bytes_to_copy: u64) {
        self.reset(files_to_copy, bytes_to_copy);
        self.files_copied = files_to_copy;
        self.bytes_copied = bytes_to_copy;
    }

    /// Takes a file the resume scan found missing back out of the copied totals.
    pub fn discount_remaining(&mut self, size: u64) {
        self.files_copied = self.files_copied.saturating_sub(1);
        self.bytes_copied = self.bytes_copied.saturating_sub(size);
    }

    /// Makes the current copied totals the baseline the copy run continues from.
    pub fn seed_resume(&mut self) {
        self.resume_bytes = self.bytes_copied;
        self.update_percent_done();
    }

    pub fn is_resumed(&self) -> bool {
        self.resume_bytes > 0
    }

    pub fn finish(&mut self) {
        self.complete_current_file();
        self.files_copied = self.files_to_copy.max(self.files_copied);
        self.bytes_copied = self.bytes_to_copy.max(self.bytes_copied);
        self.percent_done = 100.0;
    }

    /// Transfer rate of this run, not counting the resume baseline.
    pub fn average_bps(&self) -> u64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (self.bytes_copied_total().saturating_sub(self.resume_bytes) as f64 / secs) as u64
    }

    pub fn eta(&self) -> Option<std::time::Duration> {
        match self.average_bps() {
            0 => None,
            bps => {
                let remaining = self.bytes_to_copy.saturating_sub(self.bytes_copied_total());
                Some(std::time::Duration::from_secs_f64(
                    remaining as f64 / bps as f64,
                ))
            }
        }
    }
}

/// Formats statistics snapshots for text progress updates.
pub struct ProgressPrinter {
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl Default for ProgressPrinter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressPrinter {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self, stats: &Statistics) -> String {
        let time_now = std::time::Instant::now();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64().max(f64::EPSILON);
        let bytes = stats.bytes_copied_total();
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "-----------------------\n\
            PROGRESS: {:>6.2}%\n\
            files:   {:>10} / {}\n\
            bytes:   {:>10} / {}\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            file:    {} ({:.1}%)",
            stats.percent_done,
            stats.files_copied,
            stats.files_to_copy,
            bytesize::ByteSize(bytes),
            bytesize::ByteSize(stats.bytes_to_copy),
            bytesize::ByteSize(stats.average_bps()),
            bytesize::ByteSize(current_bytes_rate as u64),
            stats.curr_file_name,
            stats.curr_file_pct,
        )
    }
}
