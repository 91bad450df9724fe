//! Cache population and eviction engine
//!
//! The engine runs the mirroring tool for four operations on a [`CacheEntry`]:
//!
//! - [`Engine::analyze`] compares source and cache in list-only mode and returns the differences.
//!   It is awaited in place and fails with an [`Error`].
//! - [`Engine::populate`] copies the source into the cache.
//! - [`Engine::resume`] measures what an interrupted populate already copied, then continues it.
//! - [`Engine::evict`] deletes the cache, first writing dirty files back to the source if asked.
//!
//! The last three run in a background task per job. Their outcome is reported on the job's event
//! channel: [`JobEvent::StatsUpdated`] after every applied progress line, then exactly one of
//! [`JobEvent::Done`] or [`JobEvent::Cancelled`], sent after all state changes for the job are
//! made and its tool process has been terminated and deregistered.
//!
//! Failures inside a running job (disk full, unexpected output, bad exit code, filesystem errors)
//! never surface as an `Err`; they set the job's cancel causes and error log instead.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::classify::{self, AnalysisEvent, CopyEvent};
use crate::config::{EngineConfig, Mode};
use crate::diff::DiffResult;
use crate::disk;
use crate::entry::CacheEntry;
use crate::error::{self, Error};
use crate::job::{Job, JobKind};
use crate::process::{MirrorProcess, ProcessRegistry};
use crate::rm;
use crate::rolling::SpeedHistory;
use crate::state::{self, CacheState};

#[derive(Debug)]
pub enum JobEvent {
    /// Statistics of the job working on the entry with this id changed.
    StatsUpdated(String),
    Done(Job),
    Cancelled(Job),
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<JobEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Populate,
    WriteBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Stopped,
}

struct Inner {
    config: EngineConfig,
    registry: ProcessRegistry,
    shutdown: CancellationToken,
    speeds: parking_lot::Mutex<SpeedHistory>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tool", &self.inner.config.tool.program)
            .field("active_processes", &self.inner.registry.len())
            .finish()
    }
}

async fn has_content(dir: &std::path::Path) -> anyhow::Result<bool> {
    use anyhow::Context;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("cannot open directory {:?} for reading", dir));
        }
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        if !state::is_marker_name(&entry.file_name().to_string_lossy()) {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let speeds = SpeedHistory::new(config.speed_history_depth);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Default::default(),
                shutdown: CancellationToken::new(),
                speeds: parking_lot::Mutex::new(speeds),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.inner.registry
    }

    /// Stops every running job and kills all mirroring processes.
    pub fn shutdown(&self) {
        tracing::info!("shutting down, stopping all mirroring processes");
        self.inner.shutdown.cancel();
        let killed = self.inner.registry.kill_all();
        tracing::debug!("killed {} mirroring processes", killed);
    }

    fn spawn_process(
        &self,
        mode: Mode,
        src: &std::path::Path,
        dst: &std::path::Path,
    ) -> Result<MirrorProcess, Error> {
        MirrorProcess::spawn(
            &self.inner.config.tool,
            mode,
            src,
            dst,
            &self.inner.registry,
            self.inner.config.error_log_lines,
        )
    }

    /// Sets the entry state and persists it; a failed marker update leaves the state `Unknown`.
    async fn persist_state(&self, entry: &CacheEntry, state: CacheState) {
        entry.set_state(state);
        if let Err(err) = state::mark(&entry.cache_dir, state).await {
            tracing::warn!(
                "failed to persist state {} for {:?}: {:#}",
                state,
                &entry.cache_dir,
                err
            );
            entry.set_state(CacheState::Unknown);
        }
    }

    async fn rescan(&self, entry: &CacheEntry) {
        match disk::dir_size(&entry.cache_dir).await {
            Ok(usage) => entry.set_cache_usage(usage),
            Err(err) => tracing::warn!("failed to measure {:?}: {:#}", &entry.cache_dir, err),
        }
    }

    fn check_capacity(&self, entry: &CacheEntry) -> Result<(), Error> {
        let needed = entry.missing_bytes();
        let available = disk::free_space(&entry.cache_dir)?;
        if available < needed {
            tracing::info!(
                "not enough space for {}: need {}, have {}",
                entry.id,
                bytesize::ByteSize(needed),
                bytesize::ByteSize(available)
            );
            return Err(Error::Capacity {
                path: entry.cache_dir.clone(),
                needed,
                available,
            });
        }
        Ok(())
    }

    /// Predicted duration of populating `entry` from past runs on the same device.
    pub fn estimate_populate(&self, entry: &CacheEntry) -> Option<std::time::Duration> {
        self.inner
            .speeds
            .lock()
            .estimate(disk::device_key(&entry.cache_dir), entry.missing_bytes())
    }

    /// Average populate rate observed on the device holding `path`.
    pub fn average_speed(&self, path: &std::path::Path) -> Option<u64> {
        self.inner.speeds.lock().average(disk::device_key(path))
    }

    /// Compares `entry`'s source with its cache. A missing or empty cache is reported as such
    /// without running the tool.
    #[instrument(skip(self, entry), fields(entry = %entry.id))]
    pub async fn analyze(&self, entry: &CacheEntry) -> Result<DiffResult, Error> {
        if !has_content(&entry.cache_dir).await? {
            tracing::debug!("cache directory is empty");
            return Ok(DiffResult::empty_destination());
        }
        self.run_analysis(&entry.source_dir, &entry.cache_dir, None)
            .await
    }

    /// Analyzes `entry` and records the resulting state and cache size on it and on disk.
    #[instrument(skip(self, entry), fields(entry = %entry.id))]
    pub async fn analyze_and_mark(&self, entry: &CacheEntry) -> Result<DiffResult, Error> {
        let diff = self.analyze(entry).await?;
        if diff.dest_empty {
            entry.set_cache_usage(Default::default());
        } else {
            self.rescan(entry).await;
        }
        let state = diff.implied_state();
        tracing::info!("{} analyzed as {} ({} differences)", entry.id, state, diff.total());
        self.persist_state(entry, state).await;
        Ok(diff)
    }

    async fn run_analysis(
        &self,
        src: &std::path::Path,
        dst: &std::path::Path,
        cancel: Option<&CancellationToken>,
    ) -> Result<DiffResult, Error> {
        let mut process = self.spawn_process(Mode::Analyze, src, dst)?;
        let job_cancel = cancel.cloned().unwrap_or_default();
        let mut diff = DiffResult::default();
        loop {
            let line = tokio::select! {
                biased;
                _ = job_cancel.cancelled() => None,
                _ = self.inner.shutdown.cancelled() => None,
                line = process.next_line() => Some(line),
            };
            let Some(line) = line else {
                process.kill().await;
                return Err(Error::Cancelled);
            };
            let Some(line) = line? else {
                break;
            };
            match classify::classify_analysis(&line) {
                AnalysisEvent::Unrecognized(line) => {
                    tracing::error!("unrecognized analysis output: {:?}", &line);
                    process.kill().await;
                    return Err(Error::Parse { line });
                }
                event => {
                    diff.record(event);
                }
            }
        }
        let code = process.wait().await?;
        if !self.inner.config.tool.is_success(code) {
            return Err(Error::ExitCode { code });
        }
        Ok(diff)
    }

    /// Starts copying the entry's source into its cache.
    ///
    /// Fails synchronously, before any process is started, if the cache volume cannot hold what is
    /// still missing. Everything else is reported through `events`.
    pub fn populate(&self, job: Job, events: EventSender) -> Result<(), Error> {
        self.check_capacity(&job.entry)?;
        let engine = self.clone();
        tokio::spawn(async move { engine.run_populate(job, events).await });
        Ok(())
    }

    /// Continues an interrupted populate: a list-only run establishes what is already copied,
    /// then the copy proceeds from that baseline within the same job.
    pub fn resume(&self, job: Job, events: EventSender) -> Result<(), Error> {
        self.check_capacity(&job.entry)?;
        let engine = self.clone();
        tokio::spawn(async move {
            let mut job = job;
            if engine.scan_remaining(&mut job, &events).await {
                engine.run_populate(job, events).await;
            } else {
                engine.cancelled(job, &events).await;
            }
        });
        Ok(())
    }

    /// Deletes the entry's cache. A played cache is checked for files changed in the cache; with
    /// `write_back` in the job kind those are copied to the source first.
    pub fn evict(&self, job: Job, events: EventSender) {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_evict(job, events).await });
    }

    async fn cancelled(&self, job: Job, events: &EventSender) {
        tracing::info!(
            "job {} on {} cancelled: {}",
            job.id,
            job.entry.id,
            &job.causes
        );
        let _ = events.send(JobEvent::Cancelled(job));
    }

    fn fail(&self, job: &mut Job, message: String) {
        tracing::error!("job {} on {}: {}", job.id, job.entry.id, &message);
        job.causes.set_error();
        job.error_log.push(message);
    }

    /// Ends a tool run. A run that was stopped early or exited outside the success range is killed
    /// and leaves its output tail plus `diagnostic` in the job's error log.
    async fn conclude(
        &self,
        job: &mut Job,
        mut process: MirrorProcess,
        ended: bool,
        mut diagnostic: Option<String>,
    ) -> Outcome {
        let mut stopped = !ended || job.is_cancelled() || job.causes.any();
        let mut code = None;
        if stopped {
            process.kill().await;
        } else {
            match process.wait().await {
                Ok(status) => code = status,
                Err(err) => {
                    job.causes.set_error();
                    process.kill().await;
                    diagnostic = Some(format!("{:#}", err));
                    stopped = true;
                }
            }
        }
        let exit_failed = !stopped && !self.inner.config.tool.is_success(code);
        if !stopped && !exit_failed {
            return Outcome::Succeeded;
        }
        job.error_log = process.tail();
        drop(process);
        if exit_failed {
            job.causes.set_error();
            job.error_log.push(format!(
                "rcache: mirroring tool {}",
                error::describe_exit(&code)
            ));
        } else if let Some(diagnostic) = diagnostic {
            job.error_log.push(format!("rcache: {}", diagnostic));
        } else {
            job.error_log
                .push(format!("rcache: job stopped ({})", &job.causes));
        }
        Outcome::Stopped
    }

    /// Waits for the next tool line, giving up when the job or the engine is cancelled.
    async fn next_line(
        &self,
        job: &Job,
        process: &mut MirrorProcess,
    ) -> Option<anyhow::Result<Option<String>>> {
        tokio::select! {
            biased;
            _ = job.cancel.cancelled() => None,
            _ = self.inner.shutdown.cancelled() => {
                job.cancel.cancel();
                None
            }
            line = process.next_line() => Some(line),
        }
    }

    fn exceeds_max_fill(&self, job: &Job, size: u64) -> bool {
        let Some(max_fill) = job.settings.max_fill_percent else {
            return false;
        };
        match disk::volume_stats(&job.entry.cache_dir) {
            Ok(volume) => {
                volume.used().saturating_add(size) as f64 > volume.total as f64 * max_fill / 100.0
            }
            Err(err) => {
                tracing::warn!("cannot check fill level: {:#}", err);
                false
            }
        }
    }

    /// Streams a copy run from `src` to `dst` into the job's statistics.
    #[instrument(skip(self, job, events), fields(job = job.id))]
    async fn drive_copy(
        &self,
        job: &mut Job,
        src: &std::path::Path,
        dst: &std::path::Path,
        role: Role,
        events: &EventSender,
    ) -> Outcome {
        let entry = job.entry.clone();
        let mut process = match self.spawn_process(Mode::Copy, src, dst) {
            Ok(process) => process,
            Err(err) => {
                self.fail(job, err.to_string());
                return Outcome::Stopped;
            }
        };
        let mut ended = false;
        let mut diagnostic = None;
        // the InProgress marker is written once, on the first completed file
        let mut first_completion_seen = false;
        while let Some(line) = self.next_line(job, &mut process).await {
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    ended = true;
                    break;
                }
                Err(err) => {
                    job.causes.set_error();
                    diagnostic = Some(format!("{:#}", err));
                    break;
                }
            };
            let event = classify::classify_copy(&line);
            match event {
                CopyEvent::Empty | CopyEvent::MarkerFile => continue,
                CopyEvent::DiskFull => {
                    tracing::warn!("{} ran out of disk space", entry.id);
                    job.causes.set_disk_full();
                    diagnostic = Some(format!("out of disk space writing to {:?}", dst));
                    break;
                }
                CopyEvent::Other(raw) => {
                    tracing::error!("unexpected tool output: {:?}", &raw);
                    job.causes.set_error();
                    diagnostic = Some(format!("unexpected tool output: {:?}", raw));
                    if role == Role::Populate {
                        self.persist_state(&entry, CacheState::Unknown).await;
                    }
                    break;
                }
                CopyEvent::SizeName { size, .. }
                    if role == Role::Populate && self.exceeds_max_fill(job, size) =>
                {
                    tracing::info!("{} would exceed the cache fill limit", entry.id);
                    job.causes.set_max_fill_exceeded();
                    diagnostic = Some("cache volume fill limit reached".to_string());
                    break;
                }
                event => {
                    let applied = job.stats.lock().apply(&event);
                    if role == Role::Populate && applied.completed_file && !first_completion_seen {
                        first_completion_seen = true;
                        if entry.state() != CacheState::InProgress {
                            self.persist_state(&entry, CacheState::InProgress).await;
                        }
                    }
                    let _ = events.send(JobEvent::StatsUpdated(entry.id.clone()));
                }
            }
        }
        self.conclude(job, process, ended, diagnostic).await
    }

    /// Resume baseline: starts from "everything copied" and takes back each file a list-only
    /// run reports as still to be copied. Returns `false` if the job was stopped.
    #[instrument(skip(self, job, events), fields(job = job.id, entry = %job.entry.id))]
    pub(crate) async fn scan_remaining(&self, job: &mut Job, events: &EventSender) -> bool {
        let entry = job.entry.clone();
        job.stats
            .lock()
            .begin_resume_scan(entry.source_files(), entry.source_size());
        let mut process =
            match self.spawn_process(Mode::ListOnly, &entry.source_dir, &entry.cache_dir) {
                Ok(process) => process,
                Err(err) => {
                    self.fail(job, err.to_string());
                    return false;
                }
            };
        let mut ended = false;
        let mut diagnostic = None;
        while let Some(line) = self.next_line(job, &mut process).await {
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    ended = true;
                    break;
                }
                Err(err) => {
                    job.causes.set_error();
                    diagnostic = Some(format!("{:#}", err));
                    break;
                }
            };
            match classify::classify_copy(&line) {
                CopyEvent::SizeName { size, name } => {
                    tracing::trace!("still to copy: {} ({} bytes)", name, size);
                    job.stats.lock().discount_remaining(size);
                }
                CopyEvent::DiskFull => {
                    job.causes.set_disk_full();
                    diagnostic = Some(format!(
                        "out of disk space writing to {:?}",
                        &entry.cache_dir
                    ));
                    break;
                }
                CopyEvent::Other(raw) => {
                    job.causes.set_error();
                    diagnostic = Some(format!("unexpected tool output: {:?}", raw));
                    break;
                }
                _ => {}
            }
        }
        if self.conclude(job, process, ended, diagnostic).await == Outcome::Stopped {
            self.rescan(&entry).await;
            return false;
        }
        let stats = {
            let mut stats = job.stats.lock();
            stats.seed_resume();
            stats.clone()
        };
        tracing::info!(
            "{}: {} of {} already cached",
            entry.id,
            bytesize::ByteSize(stats.bytes_copied),
            bytesize::ByteSize(stats.bytes_to_copy)
        );
        let _ = events.send(JobEvent::StatsUpdated(entry.id.clone()));
        true
    }

    #[instrument(skip(self, job, events), fields(job = job.id, entry = %job.entry.id))]
    async fn run_populate(&self, mut job: Job, events: EventSender) {
        let entry = job.entry.clone();
        if let Err(err) = tokio::fs::create_dir_all(&entry.cache_dir).await {
            self.fail(
                &mut job,
                format!("failed creating {:?}: {}", &entry.cache_dir, err),
            );
            self.cancelled(job, &events).await;
            return;
        }
        job.stats.lock().start_time = std::time::Instant::now();
        tracing::info!(
            "populating {:?} from {:?}",
            &entry.cache_dir,
            &entry.source_dir
        );
        match self
            .drive_copy(&mut job, &entry.source_dir, &entry.cache_dir, Role::Populate, &events)
            .await
        {
            Outcome::Succeeded => {
                let bps = {
                    let mut stats = job.stats.lock();
                    stats.finish();
                    stats.average_bps()
                };
                self.persist_state(&entry, CacheState::Populated).await;
                entry.set_cache_usage(disk::Usage {
                    bytes: entry.source_size(),
                    files: entry.source_files(),
                });
                if bps > 0 {
                    self.inner
                        .speeds
                        .lock()
                        .record(disk::device_key(&entry.cache_dir), bps);
                }
                tracing::info!("{} populated at {}/s", entry.id, bytesize::ByteSize(bps));
                let _ = events.send(JobEvent::StatsUpdated(entry.id.clone()));
                let _ = events.send(JobEvent::Done(job));
            }
            Outcome::Stopped => {
                self.rescan(&entry).await;
                self.cancelled(job, &events).await;
            }
        }
    }

    /// Copies files changed in the cache back to the source. The state marker is removed for the
    /// duration so it is not copied along, and restored if the copy fails.
    async fn write_back(&self, job: &mut Job, events: &EventSender) -> bool {
        let entry = job.entry.clone();
        if let Err(err) = state::mark(&entry.cache_dir, CacheState::Unknown).await {
            self.fail(job, format!("failed clearing state marker: {:#}", err));
            return false;
        }
        job.stats.lock().reset(0, 0);
        let outcome = self
            .drive_copy(job, &entry.cache_dir, &entry.source_dir, Role::WriteBack, events)
            .await;
        if outcome == Outcome::Stopped {
            // best effort, a partially written source is not repaired
            if let Err(err) = state::mark(&entry.cache_dir, CacheState::Played).await {
                tracing::warn!("failed restoring state marker: {:#}", err);
                entry.set_state(CacheState::Unknown);
            }
            return false;
        }
        tracing::info!("{}: dirty files written back to {:?}", entry.id, &entry.source_dir);
        true
    }

    #[instrument(skip(self, job, events), fields(job = job.id, entry = %job.entry.id))]
    async fn run_evict(&self, mut job: Job, events: EventSender) {
        let entry = job.entry.clone();
        let write_back = matches!(job.kind, JobKind::Evict { write_back: true });
        if entry.state() == CacheState::Played {
            // reversed: the cache is the source of this comparison
            let analysis = self
                .run_analysis(&entry.cache_dir, &entry.source_dir, Some(&job.cancel))
                .await;
            match analysis {
                Ok(diff) if diff.is_dirty() && write_back => {
                    if !self.write_back(&mut job, &events).await {
                        self.cancelled(job, &events).await;
                        return;
                    }
                }
                Ok(diff) if diff.is_dirty() => {
                    tracing::warn!(
                        "{}: discarding {} files changed in the cache",
                        entry.id,
                        diff.total()
                    );
                }
                Ok(_) => {}
                Err(Error::Cancelled) => {
                    self.cancelled(job, &events).await;
                    return;
                }
                Err(err) => {
                    self.fail(&mut job, format!("dirty check failed: {}", err));
                    self.cancelled(job, &events).await;
                    return;
                }
            }
        }
        if job.is_cancelled() {
            self.cancelled(job, &events).await;
            return;
        }
        match rm::rm(&entry.cache_dir).await {
            Ok(summary) => {
                tracing::info!(
                    "{}: removed {} files from {:?}",
                    entry.id,
                    summary.files_removed,
                    &entry.cache_dir
                );
                self.persist_state(&entry, CacheState::Empty).await;
                entry.set_cache_usage(Default::default());
                let _ = events.send(JobEvent::Done(job));
            }
            Err(err) => {
                self.fail(&mut job, format!("failed removing cache: {:#}", err));
                self.persist_state(&entry, CacheState::Unknown).await;
                self.rescan(&entry).await;
                self.cancelled(job, &events).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DiffKind;
    use crate::entry::EntryStatus;
    use crate::job::JobSettings;
    use crate::testutils;
    use std::os::unix::fs::PermissionsExt;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    const STALL: &str = "exec sleep 30";

    async fn setup(body: &str) -> anyhow::Result<(Engine, Arc<CacheEntry>, std::path::PathBuf)> {
        let tmp_dir = testutils::setup_source_tree().await?;
        let tool = testutils::fake_tool(&tmp_dir, body).await?;
        let engine = Engine::new(EngineConfig {
            tool,
            ..Default::default()
        });
        let entry =
            CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?;
        Ok((engine, Arc::new(entry), tmp_dir))
    }

    /// Collects events until the terminal one, returning it with the number of stats updates.
    async fn terminal(events: &mut mpsc::UnboundedReceiver<JobEvent>) -> (usize, JobEvent) {
        let mut updates = 0;
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(20), events.recv()).await {
                Ok(Some(JobEvent::StatsUpdated(_))) => updates += 1,
                Ok(Some(event)) => return (updates, event),
                Ok(None) => panic!("event channel closed without a terminal event"),
                Err(_) => panic!("timed out waiting for the job to finish"),
            }
        }
    }

    async fn first_update(events: &mut mpsc::UnboundedReceiver<JobEvent>) {
        match tokio::time::timeout(std::time::Duration::from_secs(20), events.recv()).await {
            Ok(Some(JobEvent::StatsUpdated(_))) => {}
            other => panic!("expected a stats update, got {:?}", other),
        }
    }

    fn done(event: JobEvent) -> Job {
        match event {
            JobEvent::Done(job) => job,
            other => panic!("expected Done, got {:?}", other),
        }
    }

    fn cancelled(event: JobEvent) -> Job {
        match event {
            JobEvent::Cancelled(job) => job,
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    async fn populated_cache(tmp_dir: &std::path::Path, state: CacheState) -> anyhow::Result<()> {
        let cache = tmp_dir.join("cache");
        tokio::fs::create_dir_all(&cache).await?;
        tokio::fs::write(cache.join("save.dat"), "save").await?;
        state::mark(&cache, state).await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn analyze_missing_cache_is_empty() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup("exit 16").await?;
        entry.set_cache_usage(disk::Usage { bytes: 7, files: 1 });
        let diff = engine.analyze_and_mark(&entry).await?;
        assert!(diff.dest_empty);
        assert_eq!(diff.total(), 0);
        assert_eq!(entry.state(), CacheState::Empty);
        assert_eq!(entry.cache_size(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn analyze_marker_only_cache_is_empty() -> anyhow::Result<()> {
        let (engine, entry, tmp_dir) = setup("exit 16").await?;
        let cache = tmp_dir.join("cache");
        tokio::fs::create_dir(&cache).await?;
        state::mark(&cache, CacheState::Populated).await?;
        let diff = engine.analyze_and_mark(&entry).await?;
        assert!(diff.dest_empty);
        assert_eq!(entry.state(), CacheState::Empty);
        assert_eq!(state::read_marker(&cache).await?, CacheState::Empty);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn analyze_partial_cache_is_in_progress() -> anyhow::Result<()> {
        let (engine, entry, tmp_dir) = setup(
            r#"test "$1" = "$(dirname "$2")/source" || exit 16
printf '\t  New File  \t\tsub/b.bin\n\n\t  .rcache-state.InProgress\n\t   Older \t\ta.bin\n'"#,
        )
        .await?;
        let cache = tmp_dir.join("cache");
        tokio::fs::create_dir(&cache).await?;
        tokio::fs::write(cache.join("a.bin"), "aaaaa").await?;
        let diff = engine.analyze_and_mark(&entry).await?;
        assert!(!diff.dest_empty);
        assert_eq!(diff.files[DiffKind::New], vec!["sub/b.bin"]);
        assert_eq!(diff.files[DiffKind::Older], vec!["a.bin"]);
        assert_eq!(entry.state(), CacheState::InProgress);
        assert_eq!(entry.cache_size(), 5);
        assert_eq!(state::read_marker(&cache).await?, CacheState::InProgress);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn analyze_extra_files_are_invalid() -> anyhow::Result<()> {
        let (engine, entry, tmp_dir) = setup(r#"printf '    *EXTRA File \t\tjunk.tmp\n'"#).await?;
        let cache = tmp_dir.join("cache");
        tokio::fs::create_dir(&cache).await?;
        tokio::fs::write(cache.join("junk.tmp"), "junk").await?;
        engine.analyze_and_mark(&entry).await?;
        assert_eq!(entry.state(), CacheState::Invalid);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn analyze_failures() -> anyhow::Result<()> {
        let (engine, entry, tmp_dir) = setup(&format!("echo 'what is this'\n{}", STALL)).await?;
        populated_cache(&tmp_dir, CacheState::Populated).await?;
        match engine.analyze(&entry).await {
            Err(Error::Parse { line }) => assert_eq!(line, "what is this"),
            other => panic!("expected a parse error, got {:?}", other),
        }
        assert!(engine.registry().is_empty());
        let tool = testutils::fake_tool(&tmp_dir, "exit 8").await?;
        let engine = Engine::new(EngineConfig {
            tool,
            ..Default::default()
        });
        assert!(matches!(
            engine.analyze(&entry).await,
            Err(Error::ExitCode { code: Some(8) })
        ));
        // the entry is left alone on failure
        assert_eq!(entry.state(), CacheState::Populated);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_streams_progress() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) =
            setup("printf '5000000\\tfoo.bin\\n100%%\\n2000\\tbar.bin\\n100%%\\n'\nexit 1").await?;
        let entry = Arc::new(CacheEntry::new(
            "game",
            tmp_dir.join("source"),
            tmp_dir.join("cache"),
            EntryStatus {
                state: CacheState::Empty,
                cache_size: 0,
                cache_files: 0,
                source_size: 5_002_000,
                source_files: 2,
            },
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let (updates, event) = terminal(&mut rx).await;
        let job = done(event);
        assert!(updates >= 4);
        let stats = job.stats();
        assert_eq!(stats.files_copied, 2);
        assert_eq!(stats.bytes_copied, 5_002_000);
        assert_eq!(stats.percent_done, 100.0);
        assert!(!job.causes.any());
        assert_eq!(entry.state(), CacheState::Populated);
        assert_eq!(entry.cache_size(), 5_002_000);
        assert_eq!(
            state::read_marker(&entry.cache_dir).await?,
            CacheState::Populated
        );
        assert!(engine.average_speed(&entry.cache_dir).is_some());
        assert!(engine.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_copies_tree() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup(
            r#"cp -R "$1"/. "$2"/ || exit 16
printf '\t5\ta.bin\n100%%\n\t10\tsub/b.bin\n100%%\n\t20\tsub/c.bin\n100%%\n'"#,
        )
        .await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let job = done(terminal(&mut rx).await.1);
        assert_eq!(job.stats().files_copied, 3);
        assert_eq!(disk::dir_size(&entry.cache_dir).await?.bytes, 35);
        assert_eq!(entry.status().cache_files, 3);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_with_in_place_progress() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) =
            setup(r#"printf '\t5\ta.bin\r\n  0%%  \r 40%%  \r100%%  \r\n'"#).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let (updates, event) = terminal(&mut rx).await;
        let job = done(event);
        assert!(updates >= 4);
        assert!(!job.causes.any());
        assert!(job.error_log.is_empty());
        assert_eq!(entry.state(), CacheState::Populated);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_marks_in_progress_once() -> anyhow::Result<()> {
        let (engine, entry, tmp_dir) = setup(
            "printf '5\\ta.bin\\n100%%\\n10\\tsub/b.bin\\n100%%\\n20\\tsub/c.bin\\n100%%\\n'",
        )
        .await?;
        let cache = tmp_dir.join("cache");
        tokio::fs::create_dir(&cache).await?;
        // markers cannot be written, the job itself still completes
        tokio::fs::set_permissions(&cache, std::fs::Permissions::from_mode(0o500)).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let job = done(terminal(&mut rx).await.1);
        tokio::fs::set_permissions(&cache, std::fs::Permissions::from_mode(0o700)).await?;
        assert_eq!(job.stats().files_copied, 3);
        if nix::unistd::geteuid().is_root() {
            // root ignores directory permissions
            assert_eq!(entry.state(), CacheState::Populated);
            return Ok(());
        }
        assert_eq!(entry.state(), CacheState::Unknown);
        logs_assert(|lines: &[&str]| {
            match lines
                .iter()
                .filter(|line| line.contains("failed to persist state InProgress"))
                .count()
            {
                1 => Ok(()),
                n => Err(format!("expected one InProgress marker attempt, saw {}", n)),
            }
        });
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_disk_full() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup(&format!(
            "printf '5\\ta.bin\\n100%%\\n10\\tsub/b.bin\\n40%%\\n'\n\
             echo 'ERROR 112 (0x00000070) Copying File sub/b.bin'\n{}",
            STALL
        ))
        .await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_disk_full());
        assert!(!job.cancelled_on_error());
        assert_eq!(entry.state(), CacheState::InProgress);
        assert_eq!(
            state::read_marker(&entry.cache_dir).await?,
            CacheState::InProgress
        );
        assert!(job.error_log.iter().any(|line| line.contains("ERROR 112")));
        assert!(engine.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_unexpected_output() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) =
            setup(&format!("printf '5\\ta.bin\\nAccess is denied.\\n'\n{}", STALL)).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_error());
        assert_eq!(entry.state(), CacheState::Unknown);
        assert!(job.error_log.iter().any(|line| line == "Access is denied."));
        assert!(engine.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_bad_exit_code() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup("printf '5\\ta.bin\\n100%%\\n'\nexit 8").await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_error());
        assert!(job
            .error_log
            .last()
            .is_some_and(|line| line.contains("exited with code 8")));
        assert_ne!(entry.state(), CacheState::Populated);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_missing_tool() -> anyhow::Result<()> {
        let (_, entry, _tmp_dir) = setup("exit 0").await?;
        let engine = Engine::new(EngineConfig {
            tool: crate::ToolConfig {
                program: "/nonexistent/rcache-mirror-tool".into(),
                ..Default::default()
            },
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_error());
        assert!(!job.error_log.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_without_space() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup("exit 16").await?;
        let entry = Arc::new(CacheEntry::new(
            "huge",
            tmp_dir.join("source"),
            tmp_dir.join("cache"),
            EntryStatus {
                state: CacheState::Empty,
                cache_size: 0,
                cache_files: 0,
                source_size: u64::MAX / 2,
                source_files: 1,
            },
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let res = engine.populate(Job::new(JobKind::Populate, entry.clone()), tx);
        assert!(matches!(res, Err(Error::Capacity { .. })));
        // the job was dropped with its sender, nothing was reported
        assert!(rx.recv().await.is_none());
        assert!(!entry.cache_dir.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_max_fill() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup(&format!("printf '5\\ta.bin\\n'\n{}", STALL)).await?;
        let job = Job::with_settings(
            JobKind::Populate,
            entry.clone(),
            JobSettings {
                max_fill_percent: Some(0.0),
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(job, tx)?;
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_max_fill());
        assert!(!job.cancelled_on_error());
        assert_eq!(job.stats().files_copied, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn populate_cancelled_by_user() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup(&format!("printf '5\\ta.bin\\n'\n{}", STALL)).await?;
        let job = Job::new(JobKind::Populate, entry.clone());
        let handle = job.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(job, tx)?;
        first_update(&mut rx).await;
        assert_eq!(handle.stats().curr_file_name, "a.bin");
        handle.cancel();
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.is_cancelled());
        assert!(!job.causes.any());
        assert!(engine.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn shutdown_stops_jobs() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup(&format!("printf '5\\ta.bin\\n'\n{}", STALL)).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.populate(Job::new(JobKind::Populate, entry.clone()), tx)?;
        first_update(&mut rx).await;
        assert_eq!(engine.registry().len(), 1);
        engine.shutdown();
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.is_cancelled());
        assert!(engine.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn resume_continues_from_baseline() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup(
            r#"case " $* " in
  *" /L "*) printf '10\tsub/b.bin\n20\tsub/c.bin\n' ;;
  *) printf '10\tsub/b.bin\n100%%\n20\tsub/c.bin\n100%%\n' ;;
esac"#,
        )
        .await?;
        let cache = tmp_dir.join("cache");
        tokio::fs::create_dir(&cache).await?;
        tokio::fs::write(cache.join("a.bin"), "aaaaa").await?;
        state::mark(&cache, CacheState::InProgress).await?;
        let entry =
            Arc::new(CacheEntry::scan("game", tmp_dir.join("source"), cache.clone()).await?);
        assert_eq!(entry.state(), CacheState::InProgress);
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.resume(Job::new(JobKind::Resume, entry.clone()), tx)?;
        let job = done(terminal(&mut rx).await.1);
        let stats = job.stats();
        assert_eq!(stats.resume_bytes, 5);
        assert!(stats.is_resumed());
        assert_eq!(stats.files_copied, 3);
        assert_eq!(stats.bytes_copied, 35);
        assert_eq!(entry.state(), CacheState::Populated);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn resume_scan_failure() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup("printf '10\\tsub/b.bin\\n'\nexit 9").await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.resume(Job::new(JobKind::Resume, entry.clone()), tx)?;
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_error());
        assert!(job
            .error_log
            .last()
            .is_some_and(|line| line.contains("exited with code 9")));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn evict_without_dirty_check() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup("exit 16").await?;
        populated_cache(&tmp_dir, CacheState::Populated).await?;
        let entry = Arc::new(
            CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.evict(
            Job::new(JobKind::Evict { write_back: true }, entry.clone()),
            tx,
        );
        done(terminal(&mut rx).await.1);
        assert!(!entry.cache_dir.exists());
        assert_eq!(entry.state(), CacheState::Empty);
        assert_eq!(entry.cache_size(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn evict_writes_back_dirty_files() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup(
            r#"case " $* " in
  *" /L "*) printf '\t  New File  \t\tsave.dat\n' ;;
  *) cp "$1/save.dat" "$2/save.dat" || exit 16
     printf '4\tsave.dat\n100%%\n' ;;
esac"#,
        )
        .await?;
        populated_cache(&tmp_dir, CacheState::Played).await?;
        let entry = Arc::new(
            CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?,
        );
        assert_eq!(entry.state(), CacheState::Played);
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.evict(
            Job::new(JobKind::Evict { write_back: true }, entry.clone()),
            tx,
        );
        let job = done(terminal(&mut rx).await.1);
        assert_eq!(job.stats().files_copied, 1);
        assert_eq!(
            tokio::fs::read_to_string(tmp_dir.join("source").join("save.dat")).await?,
            "save"
        );
        assert!(!entry.cache_dir.exists());
        assert_eq!(entry.state(), CacheState::Empty);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn evict_discards_dirty_files_without_write_back() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup(
            r#"case " $* " in
  *" /L "*) printf '\t  New File  \t\tsave.dat\n' ;;
  *) exit 16 ;;
esac"#,
        )
        .await?;
        populated_cache(&tmp_dir, CacheState::Played).await?;
        let entry = Arc::new(
            CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.evict(
            Job::new(JobKind::Evict { write_back: false }, entry.clone()),
            tx,
        );
        done(terminal(&mut rx).await.1);
        assert!(!tmp_dir.join("source").join("save.dat").exists());
        assert!(!entry.cache_dir.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn evict_write_back_failure_keeps_cache() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup(&format!(
            r#"case " $* " in
  *" /L "*) printf '\t  New File  \t\tsave.dat\n' ;;
  *) echo 'There is not enough space on the disk.'
     {} ;;
esac"#,
            STALL
        ))
        .await?;
        populated_cache(&tmp_dir, CacheState::Played).await?;
        let entry = Arc::new(
            CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.evict(
            Job::new(JobKind::Evict { write_back: true }, entry.clone()),
            tx,
        );
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_disk_full());
        assert!(entry.cache_dir.join("save.dat").exists());
        assert_eq!(entry.state(), CacheState::Played);
        assert_eq!(
            state::read_marker(&entry.cache_dir).await?,
            CacheState::Played
        );
        assert!(engine.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn evict_dirty_check_failure_keeps_cache() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup("echo 'bogus'\nexit 1").await?;
        populated_cache(&tmp_dir, CacheState::Played).await?;
        let entry = Arc::new(
            CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.evict(
            Job::new(JobKind::Evict { write_back: true }, entry.clone()),
            tx,
        );
        let job = cancelled(terminal(&mut rx).await.1);
        assert!(job.cancelled_on_error());
        assert!(entry.cache_dir.exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn evict_remove_failure_rescans() -> anyhow::Result<()> {
        let (engine, _, tmp_dir) = setup("exit 16").await?;
        populated_cache(&tmp_dir, CacheState::Populated).await?;
        let pinned = tmp_dir.join("cache").join("pinned");
        tokio::fs::create_dir(&pinned).await?;
        tokio::fs::write(pinned.join("keep.bin"), "keep me").await?;
        let entry = Arc::new(
            CacheEntry::scan("game", tmp_dir.join("source"), tmp_dir.join("cache")).await?,
        );
        assert_eq!(entry.cache_size(), 11);
        tokio::fs::set_permissions(&pinned, std::fs::Permissions::from_mode(0o500)).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.evict(
            Job::new(JobKind::Evict { write_back: false }, entry.clone()),
            tx,
        );
        let event = terminal(&mut rx).await.1;
        tokio::fs::set_permissions(&pinned, std::fs::Permissions::from_mode(0o700)).await?;
        if nix::unistd::geteuid().is_root() {
            // root ignores directory permissions
            done(event);
            assert!(!entry.cache_dir.exists());
            return Ok(());
        }
        let job = cancelled(event);
        assert!(job.cancelled_on_error());
        assert!(job
            .error_log
            .iter()
            .any(|line| line.contains("failed removing cache")));
        assert_eq!(entry.state(), CacheState::Unknown);
        // only the protected directory survived
        assert!(!entry.cache_dir.join("save.dat").exists());
        assert_eq!(entry.cache_size(), 7);
        assert_eq!(entry.status().cache_files, 1);
        Ok(())
    }

    #[tokio::test]
    async fn estimate_uses_device_history() -> anyhow::Result<()> {
        let (engine, entry, _tmp_dir) = setup("exit 0").await?;
        assert_eq!(engine.estimate_populate(&entry), None);
        engine
            .inner
            .speeds
            .lock()
            .record(disk::device_key(&entry.cache_dir), 7);
        assert_eq!(
            engine.estimate_populate(&entry),
            Some(std::time::Duration::from_secs(5))
        );
        Ok(())
    }
}
