/// Errors returned directly to the caller.
///
/// Only analysis and the checks made before a job starts fail this way. Problems hit while a
/// populate, resume or evict job is running are recorded on the job instead and delivered with
/// [`crate::JobEvent::Cancelled`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not enough free space for {path:?}: {needed} bytes needed, {available} available")]
    Capacity {
        path: std::path::PathBuf,
        needed: u64,
        available: u64,
    },
    #[error("unexpected output from mirroring tool: {line:?}")]
    Parse { line: String },
    #[error("mirroring tool {}", describe_exit(.code))]
    ExitCode { code: Option<i32> },
    #[error("failed to start mirroring tool {program:?}")]
    Spawn {
        program: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0:#}")]
    Io(#[from] anyhow::Error),
}

pub(crate) fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}
