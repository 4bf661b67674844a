//! Integration surface for a Ninja-like build scheduler.
//!
//! The driver hands over raw command strings and opaque task keys; this
//! layer splits commands into their two stages, dispatches compile
//! stages through the remote client and hands finished results back as
//! a pollable queue, the shape a synchronous build loop consumes.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use wuild_core::{InvokeType, ToolCommandline, ToolId};
use wuild_invocation::{preprocessed_path, split_shell_command, InvocationToolProvider};

use crate::client::RemoteToolClient;

/// One finished remote command, keyed by the driver's opaque task key.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub key: u64,
    pub success: bool,
    pub output: String,
}

/// The two rewritten rules a split produces, as plain argument lists the
/// build graph can store.
#[derive(Debug, Clone)]
pub struct SplitRules {
    pub tool_id: String,
    pub preprocess: Vec<String>,
    pub compile: Vec<String>,
}

#[derive(Default)]
struct DriverState {
    results: VecDeque<CommandOutcome>,
    active: BTreeSet<u64>,
}

#[derive(Default)]
struct DriverShared {
    state: Mutex<DriverState>,
    finished: tokio::sync::Notify,
}

impl DriverShared {
    fn push(&self, key: u64, success: bool, output: String) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(&key);
        state.results.push_back(CommandOutcome {
            key,
            success,
            output,
        });
        drop(state);
        self.finished.notify_waiters();
    }
}

/// Wraps [`RemoteToolClient`] for a build driver.
pub struct BuildExecutor {
    client: RemoteToolClient,
    provider: Arc<InvocationToolProvider>,
    minimal_remote_tasks: i32,
    max_load_average: f64,
    started: AtomicBool,
    shared: Arc<DriverShared>,
}

impl BuildExecutor {
    pub fn new(client: RemoteToolClient, minimal_remote_tasks: i32, max_load_average: f64) -> Self {
        let provider = client.provider().clone();
        Self {
            client,
            provider,
            minimal_remote_tasks,
            max_load_average,
            started: AtomicBool::new(false),
            shared: Arc::new(DriverShared::default()),
        }
    }

    /// Split one raw rule (executable + arguments) into its preprocess
    /// and compile rules. `None` means "run the original locally".
    pub fn preprocess_code(
        &self,
        original_rule: &[String],
        ignored_args: &[String],
    ) -> Option<SplitRules> {
        if original_rule.len() < 3 {
            return None;
        }
        let mut words: Vec<String> = original_rule
            .iter()
            .flat_map(|part| split_shell_command(part))
            .collect();
        let executable = words.remove(0);
        let mut invocation =
            ToolCommandline::new(ToolId::from_executable(executable.clone()), words);
        invocation.ignored_args = ignored_args.iter().cloned().collect();

        let split = self.provider.split_invocation(&invocation).ok()??;
        let stage_rule = |args: &[String]| {
            let mut rule = Vec::with_capacity(args.len() + 1);
            rule.push(executable.clone());
            rule.extend(args.iter().cloned());
            rule
        };
        Some(SplitRules {
            tool_id: split.remote_tool_id.clone(),
            preprocess: stage_rule(&split.preprocess.args),
            compile: stage_rule(&split.compile.args),
        })
    }

    /// Where the preprocess stage of `source_path`/`object_path` writes.
    pub fn preprocessed_path(&self, source_path: &str, object_path: &str) -> String {
        preprocessed_path(source_path, object_path)
    }

    /// Stage-specific flag reduction for rule templates.
    pub fn filter_preprocessor_flags(&self, tool_id: &str, flags: Vec<String>) -> Vec<String> {
        self.provider
            .filter_flags(&ToolId::from_id(tool_id), flags, InvokeType::Preprocess)
    }

    pub fn filter_compiler_flags(&self, tool_id: &str, flags: Vec<String>) -> Vec<String> {
        self.provider
            .filter_flags(&ToolId::from_id(tool_id), flags, InvokeType::Compile)
    }

    /// Start the remote session once, lazily, when the build actually
    /// has remote-able work.
    pub fn run_if_needed(&self, tool_ids: Vec<String>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("starting remote session for tools {tool_ids:?}");
        self.client.start(tool_ids);
    }

    /// Builds below this remote-task count are not worth the fleet.
    pub fn minimal_remote_tasks(&self) -> i32 {
        self.minimal_remote_tasks
    }

    /// Local load-average ceiling the driver should respect when mixing
    /// local and remote jobs. Zero means unlimited.
    pub fn max_load_average(&self) -> f64 {
        self.max_load_average
    }

    /// Whether the fleet has a free slot for one more command.
    pub fn can_run_more(&self) -> bool {
        self.started.load(Ordering::Acquire) && self.client.free_remote_threads() > 0
    }

    /// Dispatch one compile-stage command string under `key`. Returns
    /// `false` when the session is not running.
    pub async fn start_command(&self, key: u64, command: &str) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        let mut words = split_shell_command(command);
        if words.is_empty() {
            return false;
        }
        let executable = words.remove(0);
        let invocation = self.provider.complete_invocation(&ToolCommandline::new(
            ToolId::from_executable(executable),
            words,
        ));

        self.shared.state.lock().unwrap().active.insert(key);
        let output_name = invocation.output().unwrap_or("<unknown>").to_string();
        let sink = self.shared.clone();
        self.client
            .invoke_tool(
                &invocation,
                Box::new(move |info| {
                    debug!(
                        "{output_name} -> {}, {}",
                        info.result,
                        info.profiling_str()
                    );
                    sink.push(key, info.result, info.std_out);
                }),
            )
            .await;
        true
    }

    /// Pop one finished command, if any.
    pub fn try_wait_for_command(&self) -> Option<CommandOutcome> {
        self.shared.state.lock().unwrap().results.pop_front()
    }

    /// Wait until some command finished and pop it.
    pub async fn wait_for_command(&self) -> CommandOutcome {
        loop {
            let notified = self.shared.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.try_wait_for_command() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Keys of commands still in flight.
    pub fn active_keys(&self) -> Vec<u64> {
        self.shared.state.lock().unwrap().active.iter().copied().collect()
    }

    /// End the session; in-flight results are dropped.
    pub fn abort(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.client.finish_session();
        info!("{}", self.client.session_info().summary());
    }
}
