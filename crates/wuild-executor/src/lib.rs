//! # Wuild Executor
//!
//! Runs tools on the local machine with bounded concurrency. The tool
//! server uses it to execute shipped compile stages, the proxy daemon
//! for local preprocessing, and the version checker to probe compilers.
//!
//! Tasks optionally materialize a payload into a temp input file before
//! exec and read the produced output file back (compressed) after.

use std::time::Duration;

use async_trait::async_trait;

use wuild_core::{CompressionInfo, ToolCommandline};

mod executor;
pub mod files;
mod version;

pub use executor::ProcessExecutor;
pub use version::VersionChecker;

/// One unit of local work.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutorTask {
    pub commandline: ToolCommandline,
    /// Payload to materialize as the input file; interpreted per
    /// `compression_input`.
    pub input_data: Vec<u8>,
    /// Write `input_data` to a temp file and substitute input/output
    /// arguments with temp paths.
    pub write_input: bool,
    /// Read the produced output file back into the result, compressed
    /// per `compression_output`.
    pub read_output: bool,
    pub compression_input: CompressionInfo,
    pub compression_output: CompressionInfo,
    /// Directory the tool runs in; relative arguments resolve against
    /// it.
    pub working_dir: Option<std::path::PathBuf>,
}

impl LocalExecutorTask {
    /// A task that just runs the commandline in place, no file plumbing.
    pub fn plain(commandline: ToolCommandline) -> Self {
        Self {
            commandline,
            write_input: false,
            read_output: false,
            ..Self::default()
        }
    }

    pub fn short_info(&self) -> String {
        format!(
            "{} {}",
            self.commandline.id,
            self.commandline.input().unwrap_or("<no input>")
        )
    }
}

/// Outcome of one local execution.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutorResult {
    pub success: bool,
    /// Captured tool output (stdout and stderr), forwarded verbatim.
    pub std_out: String,
    /// The produced file, compressed per the task's `compression_output`.
    pub output_data: Vec<u8>,
    pub execution_time: Duration,
    pub exit_code: Option<i32>,
}

impl LocalExecutorResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            std_out: message.into(),
            ..Self::default()
        }
    }
}

pub type TaskCallback = Box<dyn FnOnce(LocalExecutorResult) + Send + 'static>;

/// The execution seam consumed by the tool server, the proxy and the
/// version checker.
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    /// Enqueue and return immediately; the callback runs when the task
    /// finished.
    fn add_task(&self, task: LocalExecutorTask, callback: TaskCallback);

    /// Run one task to completion.
    async fn run_task(&self, task: LocalExecutorTask) -> LocalExecutorResult;

    /// Tasks waiting for a process slot.
    fn queued_tasks(&self) -> u16;

    /// Tasks currently executing.
    fn running_tasks(&self) -> u16;

    /// Resize the process pool.
    fn set_thread_count(&self, threads: u16);

    /// Ids of the tools this executor can run.
    fn tool_ids(&self) -> Vec<String>;
}
