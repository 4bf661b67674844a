//! # Wuild Server
//!
//! The worker process of the fleet: accepts `ToolRequest` frames from
//! build clients, runs the compiler through the local executor, returns
//! `ToolResponse` with the object file, and keeps the coordinators
//! posted about its load.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use wuild_coordinator::CoordinatorClient;
use wuild_core::protocol::tool::{
    ToolRequest, ToolResponse, ToolVersionEntry, ToolsVersionRequest, ToolsVersionResponse,
    CHANNEL_PROTOCOL_VERSION,
};
use wuild_core::{
    CompressionInfo, ConnectedClientInfo, ToolCommandline, ToolId, ToolServerInfo, VersionMap,
    WuildError, WuildResult,
};
use wuild_executor::{LocalExecutor, LocalExecutorTask};
use wuild_transport::{typed_reader, FrameHandlerSettings, FrameService, ServiceHooks};

/// Gauges (queued/running) are refreshed into the published info at this
/// cadence even when no task starts or finishes.
const GAUGE_REFRESH: Duration = Duration::from_secs(1);

/// Tunables lifted from `[toolServer]`.
#[derive(Debug, Clone, Default)]
pub struct RemoteToolServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub server_name: String,
    pub thread_count: u16,
    pub hosts_white_list: Vec<String>,
    /// Reply with the client's compression settings instead of ours.
    pub use_client_compression: bool,
    pub compression: CompressionInfo,
}

struct Inner {
    config: RemoteToolServerConfig,
    executor: Arc<dyn LocalExecutor>,
    coordinator: CoordinatorClient,
    versions: VersionMap,
    info: Mutex<ToolServerInfo>,
    /// Connection owner id -> session id it belongs to.
    sessions: Mutex<HashMap<u64, i64>>,
    service: OnceLock<FrameService>,
}

/// The tool server service.
#[derive(Clone)]
pub struct RemoteToolServer {
    inner: Arc<Inner>,
}

impl RemoteToolServer {
    pub fn new(
        config: RemoteToolServerConfig,
        executor: Arc<dyn LocalExecutor>,
        coordinator: CoordinatorClient,
        versions: VersionMap,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                coordinator,
                versions,
                info: Mutex::new(ToolServerInfo::default()),
                sessions: Mutex::new(HashMap::new()),
                service: OnceLock::new(),
            }),
        }
    }

    pub async fn start(&self) -> WuildResult<()> {
        let inner = &self.inner;
        let threads = inner.config.thread_count.max(1);
        inner.executor.set_thread_count(threads);

        let connect_server = self.clone();
        let destroy_server = self.clone();
        let mut hooks = ServiceHooks::new(
            move |owner_id, handler| {
                let request_server = connect_server.clone();
                handler
                    .register_reader(typed_reader(move |request: ToolRequest, output| {
                        request_server.on_tool_request(owner_id, request, output.clone());
                    }))
                    .expect("tool request reader registers once per handler");

                let versions = connect_server.inner.versions.clone();
                handler
                    .register_reader(typed_reader(move |_probe: ToolsVersionRequest, output| {
                        let versions = versions
                            .iter()
                            .map(|(tool_id, version)| ToolVersionEntry {
                                tool_id: tool_id.clone(),
                                version: version.0.clone(),
                            })
                            .collect();
                        output.send(&ToolsVersionResponse { versions });
                    }))
                    .expect("version reader registers once per handler");
            },
            move |owner_id| {
                destroy_server.on_disconnect(owner_id);
            },
        );

        if !inner.config.hosts_white_list.is_empty() {
            let allowed = inner.config.hosts_white_list.clone();
            hooks = hooks.with_accept_filter(move |peer| {
                let ip = peer.ip().to_string();
                allowed.iter().any(|host| host == &ip)
            });
        }

        let settings = FrameHandlerSettings::bulk(CHANNEL_PROTOCOL_VERSION);
        let service = FrameService::bind(
            &inner.config.listen_host,
            inner.config.listen_port,
            settings,
            hooks,
        )
        .await
        .map_err(|e| WuildError::transport(e.to_string()))?;
        let bound_port = service.local_addr().port();
        info!(
            "tool server '{}' serving {} thread(s) on port {bound_port}",
            inner.config.server_name, threads
        );
        inner
            .service
            .set(service)
            .map_err(|_| WuildError::transport("tool server started twice"))?;

        // Advertise the bound port: with listenPort = 0 the ephemeral
        // one is the only reachable address.
        {
            let mut info = inner.info.lock().unwrap();
            *info = ToolServerInfo {
                server_id: inner.config.server_name.clone(),
                host: inner.config.listen_host.clone(),
                port: bound_port,
                tool_ids: inner.executor.tool_ids(),
                total_threads: threads,
                ..ToolServerInfo::default()
            };
        }
        self.publish();
        inner.coordinator.start();

        // Keep the queued/running gauges fresh between task boundaries.
        let gauge_server = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(GAUGE_REFRESH).await;
                gauge_server.publish();
            }
        });

        Ok(())
    }

    pub fn listen_port(&self) -> u16 {
        self.inner
            .service
            .get()
            .map(|s| s.local_addr().port())
            .unwrap_or(0)
    }

    pub fn published_info(&self) -> ToolServerInfo {
        self.inner.info.lock().unwrap().clone()
    }

    fn on_tool_request(
        &self,
        owner_id: u64,
        request: ToolRequest,
        output: wuild_transport::OutputSender,
    ) {
        let inner = &self.inner;
        let session_id = request.session_id;
        inner.sessions.lock().unwrap().insert(owner_id, session_id);
        self.start_task(&request.client_id, session_id);

        debug!(
            "task for session {session_id}: {} [{} byte(s)]",
            request.tool_id,
            request.file_data.len()
        );

        let response_compression = if inner.config.use_client_compression {
            request.compression
        } else {
            inner.config.compression
        };

        let task = LocalExecutorTask {
            commandline: remote_commandline(&request),
            input_data: request.file_data.to_vec(),
            write_input: true,
            read_output: true,
            compression_input: request.compression,
            compression_output: response_compression,
            working_dir: None,
        };

        let done_server = self.clone();
        inner.executor.add_task(
            task,
            Box::new(move |result| {
                debug!("task result = {}", result.success);
                let response = ToolResponse {
                    result: result.success,
                    file_data: Bytes::from(result.output_data),
                    std_out: result.std_out,
                    execution_time: result.execution_time,
                    compression: response_compression,
                };
                output.send(&response);
                done_server.finish_task(session_id, false);
            }),
        );
    }

    fn on_disconnect(&self, owner_id: u64) {
        let session_id = self.inner.sessions.lock().unwrap().remove(&owner_id);
        if let Some(session_id) = session_id {
            self.finish_task(session_id, true);
        }
    }

    /// Account a task start against the session's client slot and push
    /// the new state to the coordinators.
    fn start_task(&self, client_id: &str, session_id: i64) {
        {
            let mut info = self.inner.info.lock().unwrap();
            let client = client_slot(&mut info, session_id);
            client.client_id = client_id.to_string();
            client.used_threads += 1;
        }
        self.publish();
    }

    /// `remove` drops the whole client slot (its connection died).
    fn finish_task(&self, session_id: i64, remove: bool) {
        {
            let mut info = self.inner.info.lock().unwrap();
            if remove {
                info.connected_clients
                    .retain(|c| c.session_id != session_id);
            } else if let Some(client) = info
                .connected_clients
                .iter_mut()
                .find(|c| c.session_id == session_id)
            {
                if client.used_threads == 0 {
                    warn!("used_threads underflow for session {session_id}");
                } else {
                    client.used_threads -= 1;
                }
            }
            // A session evicted mid-task needs no accounting: its slot
            // is already gone.
        }
        self.publish();
    }

    /// Push the current info (with fresh executor gauges) to the
    /// coordinators; unchanged values are dropped there.
    fn publish(&self) {
        let info = {
            let mut info = self.inner.info.lock().unwrap();
            info.running_tasks = self.inner.executor.running_tasks();
            info.queued_tasks = self.inner.executor.queued_tasks();
            info.clone()
        };
        self.inner.coordinator.set_tool_server_info(info);
    }

    pub fn stop(&self) {
        if let Some(service) = self.inner.service.get() {
            service.stop();
        }
        self.inner.coordinator.stop();
    }
}

fn remote_commandline(request: &ToolRequest) -> ToolCommandline {
    ToolCommandline::new(ToolId::from_id(&request.tool_id), request.args.clone())
}

fn client_slot<'a>(info: &'a mut ToolServerInfo, session_id: i64) -> &'a mut ConnectedClientInfo {
    if let Some(position) = info
        .connected_clients
        .iter()
        .position(|c| c.session_id == session_id)
    {
        return &mut info.connected_clients[position];
    }
    info.connected_clients.push(ConnectedClientInfo {
        session_id,
        ..ConnectedClientInfo::default()
    });
    info.connected_clients.last_mut().expect("just pushed")
}
