//! The remote tool client: accepts compile stages from the build driver,
//! picks a tool server through the balancer, ships the preprocessed
//! source, writes the returned object file and reports per-session usage
//! to the coordinators.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use wuild_coordinator::CoordinatorClient;
use wuild_core::protocol::tool::{
    ToolRequest, ToolResponse, ToolsVersionRequest, ToolsVersionResponse, CHANNEL_PROTOCOL_VERSION,
};
use wuild_core::protocol::now_micros;
use wuild_core::types::tool::versions_compatible;
use wuild_core::{
    CompressionInfo, CoordinatorInfo, ToolCommandline, ToolServerInfo, ToolServerSessionInfo,
    ToolVersion, VersionMap, WuildError, WuildResult,
};
use wuild_executor::files::write_file_atomic;
use wuild_invocation::InvocationToolProvider;
use wuild_transport::{FrameHandler, FrameHandlerSettings, ReplyOutcome};

use crate::balancer::{ClientStatus, ToolBalancer};

/// How often the dispatch loop wakes to expire and place queued tasks.
const PROCESS_INTERVAL: Duration = Duration::from_millis(5);

/// Advertised thread count assumed for statically configured tool
/// servers until a coordinator snapshot refines it.
const STATIC_SERVER_THREADS: u16 = 4;

/// What the build driver learns about one finished task.
#[derive(Debug, Clone, Default)]
pub struct TaskExecutionInfo {
    pub result: bool,
    pub std_out: String,
    pub tool_execution_time: Duration,
    pub network_request_time: Duration,
}

impl TaskExecutionInfo {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            result: false,
            std_out: message.into(),
            ..Self::default()
        }
    }

    pub fn profiling_str(&self) -> String {
        let exec_us = self.tool_execution_time.as_micros() as i64;
        let net_us = self.network_request_time.as_micros() as i64;
        let overhead = (net_us - exec_us) * 100 / exec_us.max(1);
        format!("compilationTime: {exec_us} us., networkTime: {net_us} us., overhead: {overhead}%")
    }
}

pub type InvokeCallback = Box<dyn FnOnce(TaskExecutionInfo) + Send + 'static>;

/// Tunables lifted from `[toolClient]`.
#[derive(Debug, Clone)]
pub struct RemoteToolClientConfig {
    pub client_id: String,
    pub queue_timeout: Duration,
    pub request_timeout: Duration,
    pub invocation_attempts: u32,
    pub compression: CompressionInfo,
}

impl Default for RemoteToolClientConfig {
    fn default() -> Self {
        Self {
            client_id: "wuild".to_string(),
            queue_timeout: Duration::from_secs(600),
            request_timeout: Duration::from_secs(240),
            invocation_attempts: 2,
            compression: CompressionInfo::default(),
        }
    }
}

struct QueuedTask {
    task_index: i64,
    request: ToolRequest,
    /// Object file destination on the local disk.
    output_path: PathBuf,
    callback: InvokeCallback,
    started: Instant,
    deadline: Instant,
    attempts_remain: u32,
}

struct Inner {
    config: RemoteToolClientConfig,
    provider: Arc<InvocationToolProvider>,
    my_versions: VersionMap,
    balancer: ToolBalancer,
    handlers: Mutex<Vec<FrameHandler>>,
    queue: Mutex<VecDeque<QueuedTask>>,
    pending_tasks: AtomicI32,
    session: Mutex<ToolServerSessionInfo>,
    session_id: AtomicI64,
    started_at: Mutex<Option<Instant>>,
    coordinator: CoordinatorClient,
    task_counter: AtomicI64,
    /// Serializes balancer admission with the handler vector so entry
    /// index N always matches handler index N.
    admission: Mutex<()>,
    started: AtomicBool,
    stopping: AtomicBool,
    remote_available_reported: AtomicBool,
    remote_available: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

/// Handle to the remote compilation pipeline; cheap to clone.
#[derive(Clone)]
pub struct RemoteToolClient {
    inner: Arc<Inner>,
}

impl RemoteToolClient {
    pub fn new(
        config: RemoteToolClientConfig,
        provider: Arc<InvocationToolProvider>,
        my_versions: VersionMap,
        coordinator: CoordinatorClient,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                my_versions,
                balancer: ToolBalancer::new(),
                handlers: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                pending_tasks: AtomicI32::new(0),
                session: Mutex::new(ToolServerSessionInfo::default()),
                session_id: AtomicI64::new(0),
                started_at: Mutex::new(None),
                coordinator,
                task_counter: AtomicI64::new(0),
                admission: Mutex::new(()),
                started: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                remote_available_reported: AtomicBool::new(false),
                remote_available: Mutex::new(None),
            }),
        }
    }

    /// Fires once, the first time a free remote slot exists.
    pub fn set_remote_available_callback(&self, callback: Box<dyn Fn() + Send + Sync>) {
        *self.inner.remote_available.lock().unwrap() = Some(callback);
    }

    /// Begin a session: subscribe to coordinators, start the dispatch
    /// loop. `required_tool_ids` filters which servers enter the
    /// balancer.
    pub fn start(&self, required_tool_ids: Vec<String>) {
        let inner = &self.inner;
        inner.started.store(true, Ordering::Release);
        let session_id = now_micros();
        inner.session_id.store(session_id, Ordering::Release);
        *inner.started_at.lock().unwrap() = Some(Instant::now());
        {
            let mut session = inner.session.lock().unwrap();
            *session = ToolServerSessionInfo {
                client_id: inner.config.client_id.clone(),
                session_id,
                ..ToolServerSessionInfo::default()
            };
        }
        inner.balancer.set_required_tools(required_tool_ids);
        inner.balancer.set_session_id(session_id);

        let subscription = self.clone();
        inner
            .coordinator
            .set_info_arrived_callback(Arc::new(move |view: &CoordinatorInfo| {
                for server in &view.tool_servers {
                    subscription.add_client(server);
                }
            }));
        inner.coordinator.start();

        let loop_client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROCESS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if loop_client.inner.stopping.load(Ordering::Acquire) {
                    break;
                }
                loop_client.process_tasks();
            }
        });
    }

    /// Add statically configured tool servers (no coordinator involved).
    pub fn add_static_servers(&self, hosts: &[String], port: u16, tool_ids: &[String]) {
        for host in hosts {
            let info = ToolServerInfo {
                server_id: host.clone(),
                host: host.clone(),
                port,
                tool_ids: tool_ids.to_vec(),
                total_threads: STATIC_SERVER_THREADS,
                ..ToolServerInfo::default()
            };
            self.add_client(&info);
        }
    }

    /// Feed one fleet entry: merge into the balancer and, for servers
    /// seen the first time, open a persistent connection and run the
    /// version gate.
    pub fn add_client(&self, info: &ToolServerInfo) {
        let inner = &self.inner;
        let _admission = inner.admission.lock().unwrap();
        let status = inner.balancer.update_client(info);
        match status {
            ClientStatus::Skipped => return,
            ClientStatus::Updated => {
                self.check_remote_available();
                return;
            }
            ClientStatus::Added(index) => {
                info!("new tool server {}:{}", info.host, info.port);
                let settings = FrameHandlerSettings::bulk(CHANNEL_PROTOCOL_VERSION);
                let handler = FrameHandler::connect(info.host.clone(), info.port, settings);

                let gate_client = self.clone();
                handler.set_channel_notifier(Arc::new(move |connected| {
                    gate_client.inner.balancer.set_client_active(index, connected);
                    if connected && !gate_client.inner.balancer.is_client_checked(index) {
                        gate_client.run_version_gate(index);
                    }
                    gate_client.check_remote_available();
                }));

                // Registered before start: the connect notifier looks the
                // handler up by index.
                {
                    let mut handlers = inner.handlers.lock().unwrap();
                    debug_assert_eq!(handlers.len(), index);
                    handlers.push(handler.clone());
                }
                handler.start();
            }
        }
        self.check_remote_available();
    }

    /// Probe the server's tool versions and gate the balancer entry.
    fn run_version_gate(&self, index: usize) {
        let inner = self.inner.clone();
        let handler = {
            let handlers = inner.handlers.lock().unwrap();
            let Some(handler) = handlers.get(index).cloned() else {
                return;
            };
            handler
        };
        let gate_inner = inner.clone();
        handler.queue_frame_with_reply(
            &ToolsVersionRequest,
            Box::new(move |outcome| {
                let compatible = match outcome {
                    ReplyOutcome::Success(frame) => {
                        match frame.to_body::<ToolsVersionResponse>() {
                            Ok(response) => {
                                let mut theirs = VersionMap::new();
                                for entry in response.versions {
                                    theirs.insert(entry.tool_id, ToolVersion(entry.version));
                                }
                                let required: Vec<String> =
                                    gate_inner.my_versions.keys().cloned().collect();
                                let ok = versions_compatible(
                                    &required,
                                    &gate_inner.my_versions,
                                    &theirs,
                                );
                                if !ok {
                                    warn!(
                                        "tool server excluded: version mismatch (mine {:?}, theirs {:?})",
                                        gate_inner.my_versions, theirs
                                    );
                                }
                                ok
                            }
                            Err(e) => {
                                warn!("version probe decode failed: {e}");
                                false
                            }
                        }
                    }
                    ReplyOutcome::Timeout | ReplyOutcome::Error => {
                        warn!("version probe got no answer");
                        false
                    }
                };
                gate_inner.balancer.set_client_compatible(index, compatible);
            }),
            Some(Duration::from_secs(10)),
        );
    }

    /// Number of remote slots not spoken for yet. May be negative when
    /// the local queue runs ahead of the fleet.
    pub fn free_remote_threads(&self) -> i32 {
        self.inner.balancer.free_threads() - self.inner.pending_tasks.load(Ordering::Acquire)
    }

    /// Hand one compile stage to the fleet. The callback fires exactly
    /// once, from a worker task.
    pub async fn invoke_tool(&self, invocation: &ToolCommandline, callback: InvokeCallback) {
        let inner = &self.inner;
        let Some(input_path) = invocation.input().map(str::to_string) else {
            callback(TaskExecutionInfo::failure("invocation has no input file"));
            return;
        };
        let Some(output_path) = invocation.output().map(str::to_string) else {
            callback(TaskExecutionInfo::failure("invocation has no output file"));
            return;
        };

        let file_data = match self.read_compressed_input(&input_path).await {
            Ok(data) => data,
            Err(e) => {
                callback(TaskExecutionInfo::failure(format!(
                    "failed to read {input_path}: {e}"
                )));
                return;
            }
        };

        let remote = match inner.provider.prepare_remote(invocation) {
            Ok(remote) => remote,
            Err(e) => {
                callback(TaskExecutionInfo::failure(e.to_string()));
                return;
            }
        };

        let request = ToolRequest {
            client_id: inner.config.client_id.clone(),
            session_id: inner.session_id.load(Ordering::Acquire),
            file_data,
            args: remote.args.clone(),
            tool_id: remote.id.tool_id.clone(),
            compression: inner.config.compression,
        };

        let task_index = inner.task_counter.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        debug!(
            "queue [{task_index}] -> {} {}, balancer free: {}, pending: {}",
            request.tool_id,
            remote.args_string(),
            inner.balancer.free_threads(),
            inner.pending_tasks.load(Ordering::Acquire)
        );

        let task = QueuedTask {
            task_index,
            request,
            output_path: PathBuf::from(output_path),
            callback,
            started: now,
            deadline: now + inner.config.queue_timeout,
            attempts_remain: inner.config.invocation_attempts.max(1),
        };
        inner.queue.lock().unwrap().push_back(task);
        inner.pending_tasks.fetch_add(1, Ordering::AcqRel);
    }

    async fn read_compressed_input(&self, path: &str) -> WuildResult<Bytes> {
        let plain = tokio::fs::read(path).await.map_err(WuildError::Io)?;
        let packed = self.inner.config.compression.compress(&plain)?;
        Ok(Bytes::from(packed))
    }

    /// One pump of the dispatch loop: expire stale tasks, place the head
    /// task if a server is free.
    fn process_tasks(&self) {
        let inner = &self.inner;
        let now = Instant::now();

        let mut expired = Vec::new();
        let head = {
            let mut queue = inner.queue.lock().unwrap();
            let before = queue.len();
            let mut keep = VecDeque::with_capacity(before);
            for task in queue.drain(..) {
                if task.deadline <= now {
                    expired.push(task);
                } else {
                    keep.push_back(task);
                }
            }
            *queue = keep;
            queue.front().map(|t| t.request.tool_id.clone())
        };

        for task in expired {
            warn!("task [{}] expired in queue", task.task_index);
            inner.pending_tasks.fetch_sub(1, Ordering::AcqRel);
            // Never dispatched: not accounted as a session task.
            (task.callback)(TaskExecutionInfo::failure("Timeout expired."));
        }

        let Some(tool_id) = head else { return };
        let Some(index) = inner.balancer.find_free_client(&tool_id) else {
            return;
        };
        let Some(task) = inner.queue.lock().unwrap().pop_front() else {
            return;
        };

        let handler = {
            let handlers = inner.handlers.lock().unwrap();
            handlers.get(index).cloned()
        };
        let Some(handler) = handler else {
            // Statically added entry whose handler vanished; fail fast.
            inner.pending_tasks.fetch_sub(1, Ordering::AcqRel);
            let info = TaskExecutionInfo::failure("Internal error.");
            self.account_result(&info);
            (task.callback)(info);
            return;
        };

        inner.balancer.start_task(index);
        inner.pending_tasks.fetch_sub(1, Ordering::AcqRel);

        let reply_client = self.clone();
        let request = task.request.clone();
        let task_index = task.task_index;
        let output_path = task.output_path.clone();
        let started = task.started;
        let attempts_remain = task.attempts_remain;
        let callback = task.callback;
        let request_timeout = inner.config.request_timeout;
        let requeue_request = request.clone();

        handler.queue_frame_with_reply(
            &request,
            Box::new(move |outcome| {
                reply_client.inner.balancer.finish_task(index);
                match outcome {
                    ReplyOutcome::Success(frame) => {
                        tokio::spawn(async move {
                            let info = reply_client
                                .complete_task(frame, &output_path, started)
                                .await;
                            debug!("receiving [{task_index}]: {}", output_path.display());
                            reply_client.account_result(&info);
                            (callback)(info);
                        });
                    }
                    ReplyOutcome::Timeout => {
                        let info = TaskExecutionInfo::failure("Timeout expired.");
                        reply_client.account_result(&info);
                        (callback)(info);
                    }
                    ReplyOutcome::Error => {
                        if attempts_remain > 1 {
                            debug!(
                                "task [{task_index}] failed in transit, {} attempt(s) left",
                                attempts_remain - 1
                            );
                            reply_client.requeue(QueuedTask {
                                task_index,
                                request: requeue_request,
                                output_path,
                                callback,
                                started,
                                deadline: Instant::now()
                                    + reply_client.inner.config.queue_timeout,
                                attempts_remain: attempts_remain - 1,
                            });
                        } else {
                            let info = TaskExecutionInfo::failure("Internal error.");
                            reply_client.account_result(&info);
                            (callback)(info);
                        }
                    }
                }
            }),
            Some(request_timeout),
        );
    }

    fn requeue(&self, task: QueuedTask) {
        self.inner.queue.lock().unwrap().push_back(task);
        self.inner.pending_tasks.fetch_add(1, Ordering::AcqRel);
    }

    async fn complete_task(
        &self,
        frame: wuild_core::protocol::RawFrame,
        output_path: &std::path::Path,
        started: Instant,
    ) -> TaskExecutionInfo {
        let response = match frame.to_body::<ToolResponse>() {
            Ok(response) => response,
            Err(e) => return TaskExecutionInfo::failure(format!("broken response: {e}")),
        };

        let mut info = TaskExecutionInfo {
            result: response.result,
            std_out: response.std_out.clone(),
            tool_execution_time: response.execution_time,
            network_request_time: started.elapsed(),
        };

        if info.result {
            match response.compression.decompress(&response.file_data) {
                Ok(object) => {
                    if let Err(e) = write_file_atomic(output_path, &object).await {
                        info.result = false;
                        info.std_out = format!("failed to write {}: {e}", output_path.display());
                    }
                }
                Err(e) => {
                    info.result = false;
                    info.std_out = format!("failed to decompress response: {e}");
                }
            }
        }
        info
    }

    /// Fold one result into the session counters and push them out.
    fn account_result(&self, info: &TaskExecutionInfo) {
        let session = {
            let mut session = self.inner.session.lock().unwrap();
            session.tasks_count += 1;
            if !info.result {
                session.failures_count += 1;
            }
            session.total_network_time += info.network_request_time;
            session.total_execution_time += info.tool_execution_time;
            session.current_used_threads = self.inner.balancer.used_threads();
            session.max_used_threads =
                session.max_used_threads.max(session.current_used_threads);
            session.clone()
        };
        self.inner.coordinator.send_session_info(session, false);
    }

    /// Final session report; idempotent.
    pub fn finish_session(&self) {
        if !self.inner.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let session = {
            let mut session = self.inner.session.lock().unwrap();
            if let Some(started_at) = *self.inner.started_at.lock().unwrap() {
                session.elapsed_time = started_at.elapsed();
            }
            session.clone()
        };
        info!("{}", session.summary());
        self.inner.coordinator.send_session_info(session, true);
    }

    pub fn session_info(&self) -> ToolServerSessionInfo {
        self.inner.session.lock().unwrap().clone()
    }

    pub fn provider(&self) -> &Arc<InvocationToolProvider> {
        &self.inner.provider
    }

    pub fn balancer(&self) -> &ToolBalancer {
        &self.inner.balancer
    }

    fn check_remote_available(&self) {
        if self.inner.remote_available_reported.load(Ordering::Acquire) {
            return;
        }
        if self.inner.balancer.free_threads() > 0 {
            if self
                .inner
                .remote_available_reported
                .swap(true, Ordering::AcqRel)
            {
                return;
            }
            if let Some(callback) = self.inner.remote_available.lock().unwrap().as_ref() {
                callback();
            }
        }
    }

    /// Stop the dispatch loop and close every server connection.
    pub fn stop(&self) {
        self.finish_session();
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.coordinator.stop();
        let handlers = self.inner.handlers.lock().unwrap();
        for handler in handlers.iter() {
            handler.stop();
        }
    }
}
