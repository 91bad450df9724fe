//! Common library for the `rcache` tool
//!
//! `rcache` keeps local copies ("caches") of large source directories, filling and emptying them
//! with an external mirroring tool (robocopy by default) whose line output is parsed for progress.
//!
//! # Cache entries and states
//!
//! A [`CacheEntry`] pairs a source directory with its cache directory. Its [`CacheState`] is
//! persisted as a zero-byte marker file inside the cache directory (see [`state`]), so the state
//! survives restarts: a populate that was interrupted leaves an `InProgress` marker behind and can
//! be continued with [`Engine::resume`].
//!
//! # Jobs
//!
//! Populate, resume and evict run as [`Job`]s in the background. Each job reports on its own
//! channel: [`JobEvent::StatsUpdated`] while the tool makes progress, then exactly one of
//! [`JobEvent::Done`] or [`JobEvent::Cancelled`]. A cancelled job carries the reasons it stopped
//! (disk full, fill limit reached, error) and the last lines of tool output.
//!
//! # Analysis
//!
//! [`Engine::analyze`] runs the tool in list-only mode and sorts the reported differences into a
//! [`DiffResult`], from which the entry's state is derived.

use std::future::Future;

pub mod classify;
pub mod config;
pub mod diff;
pub mod disk;
pub mod engine;
pub mod entry;
pub mod error;
pub mod job;
pub mod process;
pub mod progress;
pub mod rm;
pub mod rolling;
pub mod state;

pub mod testutils;

pub use config::{EngineConfig, Mode, OutputConfig, RuntimeConfig, ToolConfig};
pub use diff::{DiffKind, DiffResult};
pub use engine::{Engine, EventSender, JobEvent};
pub use entry::{CacheEntry, EntryStatus};
pub use error::Error;
pub use job::{Job, JobHandle, JobKind, JobSettings};
pub use progress::{ProgressPrinter, Statistics};
pub use rolling::{RollingAverage, SpeedHistory};
pub use state::CacheState;

fn get_level(output: &OutputConfig) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;
    if output.quiet {
        return LevelFilter::OFF;
    }
    match output.verbose {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(output: &OutputConfig) {
    use tracing_subscriber::prelude::*;
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(get_level(output).into())
        .from_env_lossy();
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(output.verbose > 1)
        .with_writer(std::io::stderr);
    // a second call (tests running several commands in one process) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init();
}

/// Runs `func` on a tokio runtime configured from `runtime`, with logging set up per `output`.
///
/// Returns `None` if the runtime could not be built or `func` failed; the error is logged to
/// stderr unless `output.quiet` is set. On success the summary is printed to stdout when
/// `output.print_summary` is set.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: Future<Output = anyhow::Result<Summary>>,
{
    init_tracing(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start async runtime: {:#}", error);
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", &error);
            None
        }
    }
}
