//! TCP listener that hands every accepted connection to an accepted-mode
//! [`FrameHandler`].
//!
//! Each connection gets a process-monotonic owner id. Registries built on
//! top of the service (the coordinator, the tool server) store owner ids,
//! never handler references, and evict by id when a connection dies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use wuild_core::protocol::FrameBody;

use crate::{FrameHandler, FrameHandlerSettings, Result, TransportError};

/// Owner ids are unique across every service in the process.
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle callbacks.
///
/// `on_connect` runs before the handler starts, so it is the place to
/// register frame readers and queue greeting frames. `on_disconnect`
/// runs after the handler fully terminated.
pub struct ServiceHooks {
    pub on_connect: Box<dyn Fn(u64, &FrameHandler) + Send + Sync>,
    pub on_disconnect: Box<dyn Fn(u64) + Send + Sync>,
    /// Optional accept filter (host allow-list). Rejected peers are
    /// dropped before a handler is created.
    pub accept_filter: Option<Box<dyn Fn(&SocketAddr) -> bool + Send + Sync>>,
}

impl ServiceHooks {
    pub fn new(
        on_connect: impl Fn(u64, &FrameHandler) + Send + Sync + 'static,
        on_disconnect: impl Fn(u64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_connect: Box::new(on_connect),
            on_disconnect: Box::new(on_disconnect),
            accept_filter: None,
        }
    }

    pub fn with_accept_filter(
        mut self,
        filter: impl Fn(&SocketAddr) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.accept_filter = Some(Box::new(filter));
        self
    }
}

struct ServiceShared {
    handlers: Mutex<HashMap<u64, FrameHandler>>,
    stopping: AtomicBool,
}

/// A listening frame endpoint.
pub struct FrameService {
    shared: Arc<ServiceShared>,
    local_addr: SocketAddr,
}

impl FrameService {
    /// Bind and start accepting. The accept loop runs until [`stop`].
    pub async fn bind(
        listen_host: &str,
        port: u16,
        settings: FrameHandlerSettings,
        hooks: ServiceHooks,
    ) -> Result<Self> {
        let host = if listen_host.is_empty() {
            "0.0.0.0"
        } else {
            listen_host
        };
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| TransportError::connection(format!("bind {host}:{port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::connection(format!("local_addr: {e}")))?;
        info!("listening on {local_addr}");

        let shared = Arc::new(ServiceShared {
            handlers: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        let hooks = Arc::new(hooks);
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if accept_shared.stopping.load(Ordering::Acquire) {
                            break;
                        }
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                if accept_shared.stopping.load(Ordering::Acquire) {
                    break;
                }
                if let Some(filter) = &hooks.accept_filter {
                    if !filter(&peer) {
                        warn!("rejecting connection from {peer}: not allow-listed");
                        continue;
                    }
                }

                let owner_id = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
                debug!("accepted {peer} as owner {owner_id}");
                let handler = FrameHandler::accepted(stream, settings.clone());
                (hooks.on_connect)(owner_id, &handler);
                handler.start();
                accept_shared
                    .handlers
                    .lock()
                    .unwrap()
                    .insert(owner_id, handler.clone());

                // Reap the registry entry once the handler terminates.
                let reap_shared = accept_shared.clone();
                let reap_hooks = hooks.clone();
                tokio::spawn(async move {
                    handler.wait_closed().await;
                    reap_shared.handlers.lock().unwrap().remove(&owner_id);
                    (reap_hooks.on_disconnect)(owner_id);
                    debug!("owner {owner_id} reaped");
                });
            }
        });

        Ok(Self { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.handlers.lock().unwrap().len()
    }

    /// Broadcast to every live connection except `except`.
    pub fn queue_to_all<T: FrameBody>(&self, except: Option<u64>, message: &T) {
        let handlers: Vec<FrameHandler> = {
            let map = self.shared.handlers.lock().unwrap();
            map.iter()
                .filter(|(owner, _)| Some(**owner) != except)
                .map(|(_, h)| h.clone())
                .collect()
        };
        for handler in handlers {
            handler.queue_frame(message);
        }
    }

    /// Send to one connection by owner id.
    pub fn queue_to<T: FrameBody>(&self, owner_id: u64, message: &T) {
        let handler = self.shared.handlers.lock().unwrap().get(&owner_id).cloned();
        if let Some(handler) = handler {
            handler.queue_frame(message);
        }
    }

    /// Stop accepting and shut down every live connection.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        let handlers: Vec<FrameHandler> = {
            let map = self.shared.handlers.lock().unwrap();
            map.values().cloned().collect()
        };
        for handler in handlers {
            handler.stop();
        }
    }
}
