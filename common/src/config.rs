//! Configuration types for runtime, output and the mirroring tool

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// How the mirroring tool is invoked.
///
/// The defaults describe robocopy: recursive copy without directory, header or summary logging,
/// `/L` for list-only runs, `/NS` to drop the size column from analysis listings, `/NC /BYTES` to
/// print plain byte sizes without file classes in the copy grammar, and exit
/// codes 0 through 3 for success. Targeting another tool means changing these and the line
/// grammar in [`crate::classify`] together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub program: std::path::PathBuf,
    /// Placed before the source and destination, e.g. a script run by an interpreter `program`.
    pub pre_args: Vec<String>,
    /// Passed on every run, after the source and destination paths.
    pub common_args: Vec<String>,
    pub list_only_args: Vec<String>,
    /// Suppresses file sizes (analysis grammar).
    pub analysis_args: Vec<String>,
    /// Suppresses file classes and prints sizes in bytes (copy grammar).
    pub sizes_args: Vec<String>,
    /// Highest exit code still meaning success.
    pub max_success_code: i32,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: "robocopy".into(),
            pre_args: vec![],
            common_args: ["/E", "/NDL", "/NJH", "/NJS"]
                .map(String::from)
                .to_vec(),
            list_only_args: vec!["/L".to_string()],
            analysis_args: vec!["/NS".to_string()],
            sizes_args: vec!["/NC".to_string(), "/BYTES".to_string()],
            max_success_code: 3,
        }
    }
}

/// Kind of run, deciding both the arguments and the output grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// List-only comparison with file classes shown.
    Analyze,
    /// List-only run in the copy grammar, reporting what a copy would transfer.
    ListOnly,
    Copy,
}

impl Mode {
    pub fn grammar(self) -> crate::classify::Grammar {
        match self {
            Mode::Analyze => crate::classify::Grammar::Analysis,
            Mode::ListOnly | Mode::Copy => crate::classify::Grammar::Copy,
        }
    }
}

impl ToolConfig {
    pub fn args(&self, mode: Mode, src: &std::path::Path, dst: &std::path::Path) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = self.pre_args.iter().map(Into::into).collect();
        args.push(src.into());
        args.push(dst.into());
        args.extend(self.common_args.iter().map(Into::into));
        if matches!(mode, Mode::Analyze | Mode::ListOnly) {
            args.extend(self.list_only_args.iter().map(Into::into));
        }
        match mode {
            Mode::Analyze => args.extend(self.analysis_args.iter().map(Into::into)),
            Mode::ListOnly | Mode::Copy => args.extend(self.sizes_args.iter().map(Into::into)),
        }
        args
    }

    pub fn is_success(&self, code: Option<i32>) -> bool {
        matches!(code, Some(code) if (0..=self.max_success_code).contains(&code))
    }
}

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tool: ToolConfig,
    /// Number of populate runs averaged per device for time estimates.
    pub speed_history_depth: usize,
    /// Output lines kept for the error log of a cancelled job.
    pub error_log_lines: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool: Default::default(),
            speed_history_depth: 8,
            error_log_lines: 16,
        }
    }
}
