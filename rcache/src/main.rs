use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rcache",
    version,
    about = "Keep local cached copies of large directory trees, filled by a mirroring tool",
    long_about = "`rcache` maintains a cache directory mirroring a (usually slower) source directory.

Copying is done by an external mirroring tool (robocopy by default) whose output is parsed for
progress. The state of each cache is persisted as a marker file inside the cache directory:
Empty, InProgress, Populated, Played, Invalid or Unknown.

EXAMPLES:
    # Show how a cache differs from its source and record the resulting state
    rcache analyze /mnt/library/game /cache/game --mark

    # Fill a cache, stopping before the cache volume is 90% full
    rcache populate /mnt/library/game /cache/game --max-fill 90 --progress --summary

    # Continue an interrupted populate
    rcache resume /mnt/library/game /cache/game --progress

    # Mark a cache as played, then delete it writing changed files back first
    rcache state /cache/game --set Played
    rcache evict /mnt/library/game /cache/game --write-back

EXIT STATUS:
    0  success
    1  the operation failed or was cancelled (reasons are reported on stderr)
    2  invalid arguments"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    // Mirroring tool
    /// Mirroring tool to run
    #[arg(
        long,
        global = true,
        default_value = "robocopy",
        value_name = "PROGRAM",
        help_heading = "Mirroring tool"
    )]
    tool: std::path::PathBuf,

    /// Argument placed before the source and destination (can be specified multiple times)
    ///
    /// Used to run the tool through an interpreter, e.g. `--tool /bin/sh --tool-arg mirror.sh`.
    #[arg(
        long,
        global = true,
        value_name = "ARG",
        action = clap::ArgAction::Append,
        allow_hyphen_values = true,
        help_heading = "Mirroring tool"
    )]
    tool_arg: Vec<String>,

    /// Highest tool exit code treated as success
    #[arg(
        long,
        global = true,
        default_value = "3",
        value_name = "N",
        help_heading = "Mirroring tool"
    )]
    max_success_code: i32,

    // Progress & output
    /// Show progress
    ///
    /// A progress bar is drawn when stderr is a terminal, otherwise periodic text updates are printed.
    #[arg(long, global = true, help_heading = "Progress & output")]
    progress: bool,

    /// Print summary at the end
    #[arg(long, global = true, help_heading = "Progress & output")]
    summary: bool,

    /// Print results as JSON on stdout
    #[arg(long, global = true, help_heading = "Progress & output")]
    json: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        global = true,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

#[derive(clap::Args, Debug, Clone)]
struct Dirs {
    /// Source directory
    source: std::path::PathBuf,
    /// Cache directory
    cache: std::path::PathBuf,
}

#[derive(clap::Subcommand, Debug, Clone)]
enum Command {
    /// Compare the cache with its source
    Analyze {
        #[command(flatten)]
        dirs: Dirs,
        /// Persist the state derived from the comparison
        #[arg(long)]
        mark: bool,
    },
    /// Copy the source into the cache
    Populate {
        #[command(flatten)]
        dirs: Dirs,
        /// Stop before the cache volume is filled beyond this percentage
        #[arg(long, value_name = "PERCENT")]
        max_fill: Option<f64>,
    },
    /// Continue an interrupted populate
    Resume {
        #[command(flatten)]
        dirs: Dirs,
        /// Stop before the cache volume is filled beyond this percentage
        #[arg(long, value_name = "PERCENT")]
        max_fill: Option<f64>,
    },
    /// Delete the cache
    Evict {
        #[command(flatten)]
        dirs: Dirs,
        /// Copy files changed in a played cache back to the source before deleting it
        #[arg(long)]
        write_back: bool,
    },
    /// Show or set the persisted state of a cache directory
    State {
        /// Cache directory
        cache: std::path::PathBuf,
        /// Persist this state instead of showing the current one
        #[arg(long, value_name = "STATE")]
        set: Option<common::CacheState>,
    },
}

#[derive(Debug, Default)]
struct Summary {
    status: Option<common::EntryStatus>,
    stats: Option<common::Statistics>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(status) = &self.status {
            writeln!(f, "state: {}", status.state)?;
            writeln!(
                f,
                "cache: {} in {} files",
                bytesize::ByteSize(status.cache_size),
                status.cache_files
            )?;
            writeln!(
                f,
                "source: {} in {} files",
                bytesize::ByteSize(status.source_size),
                status.source_files
            )?;
        }
        if let Some(stats) = &self.stats {
            writeln!(f, "files copied: {}", stats.files_copied)?;
            writeln!(f, "bytes copied: {}", bytesize::ByteSize(stats.bytes_copied))?;
            if stats.is_resumed() {
                writeln!(f, "already cached: {}", bytesize::ByteSize(stats.resume_bytes))?;
            }
            writeln!(
                f,
                "elapsed: {:.1?}, average: {}/s",
                stats.start_time.elapsed(),
                bytesize::ByteSize(stats.average_bps())
            )?;
        }
        Ok(())
    }
}

fn entry_id(dirs: &Dirs) -> String {
    dirs.cache
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| dirs.cache.display().to_string())
}

async fn scan_entry(dirs: &Dirs) -> Result<Arc<common::CacheEntry>> {
    let entry = common::CacheEntry::scan(entry_id(dirs), &dirs.source, &dirs.cache)
        .await
        .with_context(|| format!("failed reading {:?} and {:?}", &dirs.source, &dirs.cache))?;
    tracing::info!("{:?}", entry.status());
    Ok(Arc::new(entry))
}

enum ProgressDisplay {
    Bar(indicatif::ProgressBar),
    Text {
        printer: common::ProgressPrinter,
        last: Option<std::time::Instant>,
    },
}

impl ProgressDisplay {
    fn new() -> Self {
        if std::io::stderr().is_terminal() {
            let bar = indicatif::ProgressBar::new(0);
            if let Ok(style) = indicatif::ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {wide_bar} {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
            ) {
                bar.set_style(style);
            }
            ProgressDisplay::Bar(bar)
        } else {
            ProgressDisplay::Text {
                printer: common::ProgressPrinter::new(),
                last: None,
            }
        }
    }

    fn update(&mut self, stats: &common::Statistics) {
        match self {
            ProgressDisplay::Bar(bar) => {
                bar.set_length(stats.bytes_to_copy);
                bar.set_position(stats.bytes_copied_total());
                bar.set_message(stats.curr_file_name.clone());
            }
            ProgressDisplay::Text { printer, last } => {
                if last.is_some_and(|last| last.elapsed() < std::time::Duration::from_secs(1)) {
                    return;
                }
                *last = Some(std::time::Instant::now());
                eprintln!("{}", printer.print(stats));
            }
        }
    }

    fn finish(self) {
        if let ProgressDisplay::Bar(bar) = self {
            bar.finish_and_clear();
        }
    }
}

/// Starts `job` and waits for its terminal event, updating the progress display meanwhile.
async fn run_job(
    args: &Args,
    engine: &common::Engine,
    job: common::Job,
) -> Result<common::Job> {
    let handle = job.handle();
    let kind = job.kind;
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    match kind {
        common::JobKind::Populate => engine.populate(job, events_tx)?,
        common::JobKind::Resume => engine.resume(job, events_tx)?,
        common::JobKind::Evict { .. } => engine.evict(job, events_tx),
    }
    let mut display = args.progress.then(ProgressDisplay::new);
    let outcome = loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(common::JobEvent::StatsUpdated(_)) => {
                    if let Some(display) = display.as_mut() {
                        display.update(&handle.stats());
                    }
                }
                Some(common::JobEvent::Done(job)) => break Ok(job),
                Some(common::JobEvent::Cancelled(job)) => break Err(Some(job)),
                None => break Err(None),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling job {}", handle.id);
                handle.cancel();
            }
        }
    };
    if let Some(display) = display {
        display.finish();
    }
    match outcome {
        Ok(job) => Ok(job),
        Err(Some(job)) => {
            let mut message = format!("{:?} of {} stopped: {}", kind, job.entry.id, &job.causes);
            for line in &job.error_log {
                message.push('\n');
                message.push_str(line);
            }
            Err(anyhow!(message))
        }
        Err(None) => Err(anyhow!("{:?} ended without reporting an outcome", kind)),
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed serializing results")?
    );
    Ok(())
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> Result<Summary> {
    let engine = common::Engine::new(common::EngineConfig {
        tool: common::ToolConfig {
            program: args.tool.clone(),
            pre_args: args.tool_arg.clone(),
            max_success_code: args.max_success_code,
            ..Default::default()
        },
        ..Default::default()
    });
    let result = match &args.command {
        Command::Analyze { dirs, mark } => {
            let entry = scan_entry(dirs).await?;
            let diff = if *mark {
                engine.analyze_and_mark(&entry).await?
            } else {
                engine.analyze(&entry).await?
            };
            let state = diff.implied_state();
            if args.json {
                print_json(&serde_json::json!({
                    "entry": entry.id,
                    "state": state,
                    "diff": diff,
                }))?;
            } else {
                println!("{}: {}", entry.id, state);
                print!("{}", diff);
            }
            Summary {
                status: Some(entry.status()),
                stats: None,
            }
        }
        Command::Populate { dirs, max_fill } | Command::Resume { dirs, max_fill } => {
            let entry = scan_entry(dirs).await?;
            let kind = match &args.command {
                Command::Resume { .. } => common::JobKind::Resume,
                _ => common::JobKind::Populate,
            };
            if let Some(estimate) = engine.estimate_populate(&entry) {
                tracing::info!("estimated time: {:.0?}", estimate);
            }
            let job = common::Job::with_settings(
                kind,
                entry.clone(),
                common::JobSettings {
                    max_fill_percent: *max_fill,
                },
            );
            let job = run_job(&args, &engine, job).await?;
            if args.json {
                print_json(&serde_json::json!({
                    "entry": entry.status(),
                    "stats": job.stats(),
                }))?;
            }
            Summary {
                status: Some(entry.status()),
                stats: Some(job.stats()),
            }
        }
        Command::Evict { dirs, write_back } => {
            let entry = scan_entry(dirs).await?;
            let job = common::Job::new(
                common::JobKind::Evict {
                    write_back: *write_back,
                },
                entry.clone(),
            );
            let job = run_job(&args, &engine, job).await?;
            if args.json {
                print_json(&serde_json::json!({
                    "entry": entry.status(),
                    "stats": job.stats(),
                }))?;
            }
            Summary {
                status: Some(entry.status()),
                stats: Some(job.stats()),
            }
        }
        Command::State { cache, set } => {
            let state = match set {
                Some(state) => {
                    tokio::fs::create_dir_all(cache)
                        .await
                        .with_context(|| format!("failed creating {:?}", cache))?;
                    common::state::mark(cache, *state).await?;
                    *state
                }
                None => common::state::read_marker(cache).await?,
            };
            if args.json {
                print_json(&serde_json::json!({ "state": state }))?;
            } else {
                println!("{}", state);
            }
            Summary::default()
        }
    };
    Ok(result)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
