//! Mirroring tool subprocesses
//!
//! A [`MirrorProcess`] owns the child process for the whole run. The child is spawned with
//! `kill_on_drop`, and the process holds a [`RegistryGuard`] that removes it from the engine's
//! [`ProcessRegistry`] when dropped, so every way out of a run (success, failure, cancellation,
//! panic) both terminates the tool and deregisters it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use tokio::io::AsyncBufReadExt;

use crate::config::{Mode, ToolConfig};
use crate::error::Error;

static NEXT_PROCESS_KEY: AtomicU64 = AtomicU64::new(1);

/// Active mirroring processes, so a shutdown can terminate all of them.
#[derive(Debug, Default, Clone)]
pub struct ProcessRegistry {
    processes: Arc<parking_lot::Mutex<HashMap<u64, Option<u32>>>>,
}

impl ProcessRegistry {
    fn register(&self, pid: Option<u32>) -> RegistryGuard {
        let key = NEXT_PROCESS_KEY.fetch_add(1, Ordering::Relaxed);
        self.processes.lock().insert(key, pid);
        RegistryGuard {
            registry: self.clone(),
            key,
        }
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends SIGKILL to every registered process, returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let pids: Vec<u32> = self.processes.lock().values().flatten().copied().collect();
        let mut killed = 0;
        for pid in pids {
            let Ok(raw) = i32::try_from(pid) else {
                continue;
            };
            match nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(raw),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                Ok(()) => killed += 1,
                // already exited, the owning run will notice
                Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => tracing::warn!("failed to kill mirroring process {}: {}", pid, err),
            }
        }
        killed
    }
}

pub struct RegistryGuard {
    registry: ProcessRegistry,
    key: u64,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.processes.lock().remove(&self.key);
    }
}

/// Last lines of tool output, kept for the error log of a failed job.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

pub struct MirrorProcess {
    child: tokio::process::Child,
    stdout: tokio::io::BufReader<tokio::process::ChildStdout>,
    tail: OutputTail,
    /// The last terminator read was a `\r`, so a directly following `\n` belongs to it.
    after_cr: bool,
    _guard: RegistryGuard,
}

impl MirrorProcess {
    #[tracing::instrument(skip(tool, registry))]
    pub fn spawn(
        tool: &ToolConfig,
        mode: Mode,
        src: &std::path::Path,
        dst: &std::path::Path,
        registry: &ProcessRegistry,
        tail_lines: usize,
    ) -> Result<Self, Error> {
        let mut command = tokio::process::Command::new(&tool.program);
        command
            .args(tool.args(mode, src, dst))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        tracing::debug!("starting mirroring tool: {:?}", &command);
        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: tool.program.clone(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("mirroring tool stdout was not captured"))?;
        let guard = registry.register(child.id());
        Ok(Self {
            child,
            stdout: tokio::io::BufReader::new(stdout),
            tail: OutputTail::new(tail_lines),
            after_cr: false,
            _guard: guard,
        })
    }

    /// Reads the next output line without its line terminator; `None` at end of stream.
    ///
    /// `\n`, `\r\n` and a bare `\r` all end a line. The tool rewrites per-file percentages in
    /// place with bare `\r`, so each of them comes out as its own line; empty pieces between
    /// consecutive `\r` are skipped. Output that is not valid UTF-8 is decoded lossily so that it
    /// classifies as unexpected output instead of aborting the read.
    pub async fn next_line(&mut self) -> anyhow::Result<Option<String>> {
        let mut buf = vec![];
        loop {
            let available = self
                .stdout
                .fill_buf()
                .await
                .context("failed reading mirroring tool output")?;
            if available.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                break;
            }
            if self.after_cr {
                self.after_cr = false;
                if available[0] == b'\n' {
                    self.stdout.consume(1);
                    continue;
                }
            }
            match available.iter().position(|b| matches!(b, b'\n' | b'\r')) {
                Some(pos) => {
                    let terminator = available[pos];
                    buf.extend_from_slice(&available[..pos]);
                    self.stdout.consume(pos + 1);
                    if terminator == b'\r' {
                        self.after_cr = true;
                        if buf.is_empty() {
                            continue;
                        }
                    }
                    break;
                }
                None => {
                    let len = available.len();
                    buf.extend_from_slice(available);
                    self.stdout.consume(len);
                }
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        tracing::trace!("tool: {}", &line);
        self.tail.push(&line);
        Ok(Some(line))
    }

    /// Terminates the tool and reaps it, best effort.
    pub async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!("killing mirroring tool failed: {}", err);
        }
    }

    /// Waits for the tool to exit; `None` if it was terminated by a signal.
    pub async fn wait(&mut self) -> anyhow::Result<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .context("failed waiting for mirroring tool")?;
        Ok(status.code())
    }

    pub fn tail(&self) -> Vec<String> {
        self.tail.lines()
    }
}
