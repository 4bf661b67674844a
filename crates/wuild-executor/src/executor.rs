//! Process-pool executor bounded by a semaphore sized to the thread
//! count.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use wuild_invocation::InvocationToolProvider;

use crate::files::{read_compressed_payload, write_compressed_payload};
use crate::{LocalExecutor, LocalExecutorResult, LocalExecutorTask, TaskCallback};

struct Inner {
    provider: Arc<InvocationToolProvider>,
    temp_dir: PathBuf,
    semaphore: Semaphore,
    /// Logical pool size; `set_thread_count` adjusts the semaphore to
    /// match.
    limit: Mutex<u16>,
    queued: AtomicU16,
    running: AtomicU16,
    task_counter: AtomicU64,
}

/// Executes tasks with `tokio::process`, at most `thread_count` at once.
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct ProcessExecutor {
    inner: Arc<Inner>,
}

impl ProcessExecutor {
    pub fn new(
        provider: Arc<InvocationToolProvider>,
        temp_dir: PathBuf,
        thread_count: u16,
    ) -> Self {
        let threads = thread_count.max(1);
        Self {
            inner: Arc::new(Inner {
                provider,
                temp_dir,
                semaphore: Semaphore::new(usize::from(threads)),
                limit: Mutex::new(threads),
                queued: AtomicU16::new(0),
                running: AtomicU16::new(0),
                task_counter: AtomicU64::new(0),
            }),
        }
    }

    pub fn provider(&self) -> &Arc<InvocationToolProvider> {
        &self.inner.provider
    }
}

impl Inner {
    async fn execute(&self, task: LocalExecutorTask) -> LocalExecutorResult {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit = self.semaphore.acquire().await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        let Ok(_permit) = permit else {
            return LocalExecutorResult::error("executor is shut down");
        };
        self.running.fetch_add(1, Ordering::Relaxed);
        let result = self.execute_inner(task).await;
        self.running.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn execute_inner(&self, task: LocalExecutorTask) -> LocalExecutorResult {
        let mut inv = self.provider.complete_invocation(&task.commandline);
        if inv.id.executable.is_empty() {
            return LocalExecutorResult::error(format!(
                "cannot resolve an executable for {}",
                task.short_info()
            ));
        }

        let mut temp_input = None;
        let mut temp_output = None;
        if task.write_input {
            let (Some(input), Some(output)) = (inv.input(), inv.output()) else {
                return LocalExecutorResult::error(format!(
                    "failed to extract filenames for {}",
                    task.short_info()
                ));
            };
            let task_id = self.task_counter.fetch_add(1, Ordering::Relaxed);
            let input_path = self.temp_dir.join(format!("{task_id}_{}", file_name(input)));
            let output_path = self.temp_dir.join(format!("{task_id}_{}", file_name(output)));
            let _ = tokio::fs::remove_file(&output_path).await;

            if let Err(e) =
                write_compressed_payload(&input_path, &task.input_data, &task.compression_input)
                    .await
            {
                return LocalExecutorResult::error(format!(
                    "failed to write input for {}: {e}",
                    task.short_info()
                ));
            }
            inv.set_input(input_path.to_string_lossy().into_owned());
            inv.set_output(output_path.to_string_lossy().into_owned());
            temp_input = Some(input_path);
            temp_output = Some(output_path);
        }

        debug!("exec: {} {}", inv.id.executable, inv.args_string());
        let started = Instant::now();
        let mut command = Command::new(&inv.id.executable);
        command
            .args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &task.working_dir {
            command.current_dir(dir);
        }
        let spawned = command.output().await;

        let output = match spawned {
            Ok(output) => output,
            Err(e) => {
                cleanup(temp_input, temp_output).await;
                return LocalExecutorResult::error(format!(
                    "failed to execute {}: {e}",
                    inv.id.executable
                ));
            }
        };

        let mut result = LocalExecutorResult {
            success: output.status.success(),
            std_out: merge_output(&output.stdout, &output.stderr),
            output_data: Vec::new(),
            execution_time: started.elapsed(),
            exit_code: output.status.code(),
        };

        // cl.exe unconditionally echoes the input file name; a lone echo
        // line is not worth forwarding.
        if inv.id.executable.contains("cl.exe")
            && result.std_out.len() < 1000
            && result.std_out.trim_end().lines().count() <= 1
        {
            result.std_out.clear();
        }

        if result.success && task.read_output {
            let output_path = temp_output
                .clone()
                .unwrap_or_else(|| PathBuf::from(inv.output().unwrap_or_default()));
            match read_compressed_payload(&output_path, &task.compression_output).await {
                Ok(data) => result.output_data = data,
                Err(e) => {
                    warn!("failed to read {}: {e}", output_path.display());
                    result.success = false;
                    result.std_out = format!("Failed to read file {}", output_path.display());
                }
            }
        }

        cleanup(temp_input, temp_output).await;
        result
    }
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn merge_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        text.push_str(&String::from_utf8_lossy(stderr));
    }
    text
}

async fn cleanup(input: Option<PathBuf>, output: Option<PathBuf>) {
    for path in [input, output].into_iter().flatten() {
        let _ = tokio::fs::remove_file(&path).await;
    }
}

#[async_trait]
impl LocalExecutor for ProcessExecutor {
    fn add_task(&self, task: LocalExecutorTask, callback: TaskCallback) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = inner.execute(task).await;
            callback(result);
        });
    }

    async fn run_task(&self, task: LocalExecutorTask) -> LocalExecutorResult {
        self.inner.execute(task).await
    }

    fn queued_tasks(&self) -> u16 {
        self.inner.queued.load(Ordering::Relaxed)
    }

    fn running_tasks(&self) -> u16 {
        self.inner.running.load(Ordering::Relaxed)
    }

    fn set_thread_count(&self, threads: u16) {
        let threads = threads.max(1);
        let mut limit = self.inner.limit.lock().unwrap();
        let current = *limit;
        if threads > current {
            self.inner
                .semaphore
                .add_permits(usize::from(threads - current));
        } else if threads < current {
            let to_remove = u32::from(current - threads);
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Ok(permits) = inner.semaphore.acquire_many(to_remove).await {
                    permits.forget();
                }
            });
        }
        *limit = threads;
    }

    fn tool_ids(&self) -> Vec<String> {
        self.inner.provider.remote_tool_ids()
    }
}
