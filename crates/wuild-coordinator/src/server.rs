//! The registry service.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info};

use wuild_core::protocol::coordinator::{
    ListRequest, ListResponse, ToolServerSession, ToolServerStatus, CHANNEL_PROTOCOL_VERSION,
};
use wuild_core::{CoordinatorInfo, ToolServerInfo, ToolServerSessionInfo, WuildError, WuildResult};
use wuild_transport::{typed_reader, FrameHandlerSettings, FrameService, ServiceHooks};

/// How many finished sessions the coordinator remembers for the status
/// view.
const LATEST_SESSIONS_KEPT: usize = 20;

#[derive(Default)]
struct Registry {
    info: CoordinatorInfo,
    /// identity key -> owner id of the connection that advertised it.
    owners: HashMap<String, u64>,
    latest_sessions: VecDeque<ToolServerSessionInfo>,
    active_sessions: HashMap<(String, i64), ToolServerSessionInfo>,
}

struct Shared {
    registry: Mutex<Registry>,
    service: OnceLock<FrameService>,
}

impl Shared {
    fn snapshot(&self) -> ListResponse {
        let registry = self.registry.lock().unwrap();
        ListResponse {
            tool_servers: registry.info.tool_servers.clone(),
        }
    }
}

/// Accepts tool servers and clients, maintains the fleet view, broadcasts
/// it on every change.
pub struct CoordinatorServer {
    shared: Arc<Shared>,
}

impl CoordinatorServer {
    /// Bind and start serving.
    pub async fn start(listen_port: u16) -> WuildResult<Self> {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            service: OnceLock::new(),
        });

        let connect_shared = shared.clone();
        let destroy_shared = shared.clone();
        let hooks = ServiceHooks::new(
            move |owner_id, handler| {
                let status_shared = connect_shared.clone();
                handler
                    .register_reader(typed_reader(move |status: ToolServerStatus, _output| {
                        Shared::on_status(&status_shared, owner_id, status.info);
                    }))
                    .expect("status reader registers once per handler");

                let list_shared = connect_shared.clone();
                handler
                    .register_reader(typed_reader(move |_request: ListRequest, output| {
                        output.send(&list_shared.snapshot());
                    }))
                    .expect("list reader registers once per handler");

                let session_shared = connect_shared.clone();
                handler
                    .register_reader(typed_reader(move |message: ToolServerSession, _output| {
                        Shared::on_session(&session_shared, message);
                    }))
                    .expect("session reader registers once per handler");

                // A fresh peer gets the current view right away.
                handler.queue_frame(&connect_shared.snapshot());
            },
            move |owner_id| {
                Shared::on_disconnect(&destroy_shared, owner_id);
            },
        );

        let settings = FrameHandlerSettings {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            ..FrameHandlerSettings::default()
        };
        let service = FrameService::bind("", listen_port, settings, hooks)
            .await
            .map_err(|e| WuildError::transport(e.to_string()))?;
        info!("coordinator listening on port {}", service.local_addr().port());
        shared
            .service
            .set(service)
            .map_err(|_| WuildError::transport("coordinator started twice"))?;

        Ok(Self { shared })
    }

    pub fn listen_port(&self) -> u16 {
        self.shared
            .service
            .get()
            .map(|s| s.local_addr().port())
            .unwrap_or(0)
    }

    /// Current fleet view.
    pub fn fleet(&self) -> Vec<ToolServerInfo> {
        self.shared.registry.lock().unwrap().info.tool_servers.clone()
    }

    /// Recently finished sessions, newest last.
    pub fn latest_sessions(&self) -> Vec<ToolServerSessionInfo> {
        self.shared
            .registry
            .lock()
            .unwrap()
            .latest_sessions
            .iter()
            .cloned()
            .collect()
    }

    pub fn stop(&self) {
        if let Some(service) = self.shared.service.get() {
            service.stop();
        }
    }
}

impl Shared {
    fn on_status(shared: &Arc<Shared>, owner_id: u64, incoming: ToolServerInfo) {
        let changed = {
            let mut registry = shared.registry.lock().unwrap();
            let changed = registry.info.update_one(&incoming).is_some();
            registry.owners.insert(incoming.identity_key(), owner_id);
            changed
        };
        if !changed {
            return;
        }
        debug!("fleet changed: {incoming}");
        if let Some(service) = shared.service.get() {
            service.queue_to_all(Some(owner_id), &shared.snapshot());
        }
    }

    fn on_session(shared: &Arc<Shared>, message: ToolServerSession) {
        let mut registry = shared.registry.lock().unwrap();
        let key = (
            message.session.client_id.clone(),
            message.session.session_id,
        );
        if message.is_finished {
            registry.active_sessions.remove(&key);
            info!("session finished: {}", message.session.summary());
            registry.latest_sessions.push_back(message.session);
            if registry.latest_sessions.len() > LATEST_SESSIONS_KEPT {
                registry.latest_sessions.pop_front();
            }
        } else {
            registry.active_sessions.insert(key, message.session);
        }
    }

    fn on_disconnect(shared: &Arc<Shared>, owner_id: u64) {
        let mut registry = shared.registry.lock().unwrap();
        let evicted: Vec<String> = registry
            .owners
            .iter()
            .filter(|(_, owner)| **owner == owner_id)
            .map(|(key, _)| key.clone())
            .collect();
        if evicted.is_empty() {
            return;
        }
        for key in &evicted {
            registry.owners.remove(key);
        }
        registry
            .info
            .retain_identities(|server| !evicted.contains(&server.identity_key()));
        debug!("owner {owner_id} disconnected, evicted {} server(s)", evicted.len());
        // No broadcast here: the next status update carries the loss.
    }
}
