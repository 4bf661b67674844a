//! The coordinator subscription/publication client.
//!
//! One worker per configured coordinator host. Tool servers publish their
//! status through it; build clients subscribe to fleet snapshots. With
//! the default `Any` redundancy the first coordinator that delivers a
//! usable snapshot wins and the other workers are stopped, so the
//! subscriber sees one stream of events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use wuild_core::config::CoordinatorClientSettings;
use wuild_core::protocol::coordinator::{
    ListRequest, ListResponse, ToolServerSession, ToolServerStatus, CHANNEL_PROTOCOL_VERSION,
};
use wuild_core::{CoordinatorInfo, ToolServerInfo, ToolServerSessionInfo};
use wuild_transport::{typed_reader, FrameHandler, FrameHandlerSettings};

/// How coordinator replicas are consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redundancy {
    /// First usable snapshot wins; other coordinators are stopped.
    #[default]
    Any,
    /// Keep listening to every configured coordinator.
    All,
}

pub type InfoArrivedCallback = Arc<dyn Fn(&CoordinatorInfo) + Send + Sync>;

struct Worker {
    host: String,
    handler: FrameHandler,
    active: Arc<AtomicBool>,
    /// Set on disconnect so the next connect refreshes state.
    needs_resync: Arc<AtomicBool>,
}

struct Shared {
    settings: CoordinatorClientSettings,
    redundancy: Redundancy,
    info_arrived: Mutex<Option<InfoArrivedCallback>>,
    merged: Mutex<CoordinatorInfo>,
    workers: Mutex<Vec<Arc<Worker>>>,
    exclusive_host: Mutex<Option<String>>,
    published_info: Mutex<Option<ToolServerInfo>>,
    info_dirty: AtomicBool,
    stopping: AtomicBool,
}

/// Client side of the coordinator protocol.
#[derive(Clone)]
pub struct CoordinatorClient {
    shared: Arc<Shared>,
}

impl CoordinatorClient {
    pub fn new(settings: CoordinatorClientSettings) -> Self {
        Self::with_redundancy(settings, Redundancy::Any)
    }

    pub fn with_redundancy(settings: CoordinatorClientSettings, redundancy: Redundancy) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                redundancy,
                info_arrived: Mutex::new(None),
                merged: Mutex::new(CoordinatorInfo::default()),
                workers: Mutex::new(Vec::new()),
                exclusive_host: Mutex::new(None),
                published_info: Mutex::new(None),
                info_dirty: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Invoked with the full merged fleet view whenever it changed.
    pub fn set_info_arrived_callback(&self, callback: InfoArrivedCallback) {
        *self.shared.info_arrived.lock().unwrap() = Some(callback);
    }

    /// Queue our own tool server description for publication. Unchanged
    /// values are not re-sent.
    pub fn set_tool_server_info(&self, incoming: ToolServerInfo) {
        let mut published = self.shared.published_info.lock().unwrap();
        if published.as_ref() == Some(&incoming) {
            return;
        }
        *published = Some(incoming);
        self.shared.info_dirty.store(true, Ordering::Release);
    }

    /// Forward session counters to every connected coordinator.
    pub fn send_session_info(&self, session: ToolServerSessionInfo, is_finished: bool) {
        let workers = self.shared.workers.lock().unwrap();
        for worker in workers.iter() {
            if !worker.active.load(Ordering::Acquire) {
                continue;
            }
            worker.handler.queue_frame(&ToolServerSession {
                is_finished,
                session: session.clone(),
            });
        }
    }

    /// Spawn one worker per configured coordinator host. A client with
    /// coordinators disabled simply does nothing.
    pub fn start(&self) {
        if !self.shared.settings.enabled
            || self.shared.settings.port == 0
            || self.shared.settings.hosts.is_empty()
        {
            debug!("coordinator client disabled by configuration");
            return;
        }

        let mut workers = self.shared.workers.lock().unwrap();
        for host in self.shared.settings.hosts.clone() {
            let worker = self.spawn_worker(host);
            workers.push(worker);
        }
    }

    fn spawn_worker(&self, host: String) -> Arc<Worker> {
        let settings = FrameHandlerSettings {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            ..FrameHandlerSettings::default()
        };
        let handler = FrameHandler::connect(host.clone(), self.shared.settings.port, settings);

        let worker = Arc::new(Worker {
            host: host.clone(),
            handler: handler.clone(),
            active: Arc::new(AtomicBool::new(false)),
            needs_resync: Arc::new(AtomicBool::new(true)),
        });

        let shared = self.shared.clone();
        let reader_host = host.clone();
        handler
            .register_reader(typed_reader(move |response: ListResponse, _output| {
                Shared::on_list_response(&shared, &reader_host, response);
            }))
            .expect("list response reader registers once");

        let active = worker.active.clone();
        let needs_resync = worker.needs_resync.clone();
        handler.set_channel_notifier(Arc::new(move |connected| {
            active.store(connected, Ordering::Release);
            if !connected {
                needs_resync.store(true, Ordering::Release);
            }
        }));

        handler.start();

        // Publication pump: status when dirty, list request after
        // (re)connect, at most one status per send interval.
        let pump_shared = self.shared.clone();
        let pump_worker = worker.clone();
        tokio::spawn(async move {
            let interval = pump_shared.settings.send_info_interval;
            let mut last_send: Option<Instant> = None;
            loop {
                if pump_shared.stopping.load(Ordering::Acquire) {
                    break;
                }
                if pump_worker.active.load(Ordering::Acquire) {
                    if pump_worker.needs_resync.swap(false, Ordering::AcqRel) {
                        pump_worker.handler.queue_frame(&ListRequest);
                        pump_shared.info_dirty.store(true, Ordering::Release);
                    }
                    let due = last_send.map_or(true, |t| t.elapsed() >= interval);
                    if due && pump_shared.info_dirty.load(Ordering::Acquire) {
                        let info = pump_shared.published_info.lock().unwrap().clone();
                        if let Some(info) = info {
                            if info.total_threads > 0 {
                                debug!("publishing tool server {}", info.server_id);
                                pump_worker
                                    .handler
                                    .queue_frame(&ToolServerStatus { info });
                                last_send = Some(Instant::now());
                            }
                        }
                        pump_shared.info_dirty.store(false, Ordering::Release);
                    }
                }
                tokio::time::sleep(pump_sleep(interval)).await;
            }
        });

        worker
    }

    /// The merged fleet view assembled so far.
    pub fn fleet_view(&self) -> CoordinatorInfo {
        self.shared.merged.lock().unwrap().clone()
    }

    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        let workers = self.shared.workers.lock().unwrap();
        for worker in workers.iter() {
            worker.handler.stop();
        }
    }
}

fn pump_sleep(interval: Duration) -> Duration {
    (interval / 4).clamp(Duration::from_millis(50), Duration::from_millis(500))
}

impl Shared {
    fn on_list_response(shared: &Arc<Shared>, host: &str, response: ListResponse) {
        // Redundancy `Any`: the first coordinator to deliver wins.
        if shared.redundancy == Redundancy::Any {
            let mut exclusive = shared.exclusive_host.lock().unwrap();
            match exclusive.as_deref() {
                None => {
                    *exclusive = Some(host.to_string());
                    drop(exclusive);
                    let workers = shared.workers.lock().unwrap();
                    for worker in workers.iter() {
                        if worker.host != host {
                            info!("stopping unused coordinator: {}", worker.host);
                            worker.handler.stop();
                            worker.active.store(false, Ordering::Release);
                        }
                    }
                }
                Some(winner) if winner != host => return,
                Some(_) => {}
            }
        }

        debug!(
            "list arrived from {host} [{} server(s)]",
            response.tool_servers.len()
        );
        let changed = {
            let mut merged = shared.merged.lock().unwrap();
            // Servers the coordinator dropped are gone from our view too.
            let incoming_keys: Vec<String> = response
                .tool_servers
                .iter()
                .map(|s| s.identity_key())
                .collect();
            let before = merged.tool_servers.len();
            merged.retain_identities(|server| incoming_keys.contains(&server.identity_key()));
            let removed = before != merged.tool_servers.len();
            !merged.update(&response.tool_servers).is_empty() || removed
        };
        if !changed {
            return;
        }
        let callback = shared.info_arrived.lock().unwrap().clone();
        if let Some(callback) = callback {
            let view = shared.merged.lock().unwrap().clone();
            callback(&view);
        }
    }
}
