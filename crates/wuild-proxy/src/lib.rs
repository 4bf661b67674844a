//! # Wuild Proxy
//!
//! Makes the distributed pipeline look like a synchronous compiler. The
//! daemon ([`ProxyServer`]) owns the remote tool client and the local
//! executor; the thin client ([`proxy_client_run`]) substitutes the
//! compiler in the build system, forwards one invocation over loopback
//! and exits with the compiler's result.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use wuild_client::RemoteToolClient;
use wuild_core::protocol::proxy::{ProxyRequest, ProxyResponse, CHANNEL_PROTOCOL_VERSION};
use wuild_core::{ToolCommandline, WuildError, WuildResult};
use wuild_executor::{LocalExecutor, LocalExecutorTask};
use wuild_invocation::split_shell_command;
use wuild_transport::{
    typed_reader, FrameHandler, FrameHandlerSettings, FrameService, OutputSender, ServiceHooks,
};

/// Tunables lifted from `[proxy]`.
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub listen_port: u16,
    pub inactive_timeout: Duration,
}

struct Inner {
    config: ProxyServerConfig,
    executor: Arc<dyn LocalExecutor>,
    remote_client: RemoteToolClient,
    last_activity: Mutex<Instant>,
    service: OnceLock<FrameService>,
    idle: tokio::sync::Notify,
    idle_reached: std::sync::atomic::AtomicBool,
}

/// The proxy daemon.
#[derive(Clone)]
pub struct ProxyServer {
    inner: Arc<Inner>,
}

impl ProxyServer {
    pub fn new(
        config: ProxyServerConfig,
        executor: Arc<dyn LocalExecutor>,
        remote_client: RemoteToolClient,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                executor,
                remote_client,
                last_activity: Mutex::new(Instant::now()),
                service: OnceLock::new(),
                idle: tokio::sync::Notify::new(),
                idle_reached: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub async fn start(&self) -> WuildResult<()> {
        let connect_server = self.clone();
        let hooks = ServiceHooks::new(
            move |_owner_id, handler| {
                let request_server = connect_server.clone();
                handler
                    .register_reader(typed_reader(move |request: ProxyRequest, output| {
                        request_server.on_request(request, output.clone());
                    }))
                    .expect("proxy reader registers once per handler");
            },
            |_owner_id| {},
        );

        let settings = FrameHandlerSettings {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            ..FrameHandlerSettings::default()
        };
        let service = FrameService::bind("127.0.0.1", self.inner.config.listen_port, settings, hooks)
            .await
            .map_err(|e| WuildError::transport(e.to_string()))?;
        info!("proxy daemon on port {}", service.local_addr().port());
        self.inner
            .service
            .set(service)
            .map_err(|_| WuildError::transport("proxy started twice"))?;

        // Idle watchdog.
        let watchdog = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(5)).await;
                let idle_for = watchdog.inner.last_activity.lock().unwrap().elapsed();
                if idle_for > watchdog.inner.config.inactive_timeout {
                    info!("proxy idle for {idle_for:?}, shutting down");
                    watchdog.inner.idle_reached.store(true, Ordering::Release);
                    watchdog.inner.idle.notify_waiters();
                    break;
                }
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

    /// Resolves when the daemon sat idle past its timeout.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.idle_reached.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn touch(&self) {
        *self.inner.last_activity.lock().unwrap() = Instant::now();
    }

    fn on_request(&self, request: ProxyRequest, output: OutputSender) {
        self.touch();
        let server = self.clone();
        tokio::spawn(async move {
            server.handle_request(request, output).await;
            server.touch();
        });
    }

    async fn handle_request(&self, request: ProxyRequest, output: OutputSender) {
        let inner = &self.inner;
        let cwd = PathBuf::from(&request.cwd);
        let invocation = request.to_commandline();

        let split = match self.split(&invocation) {
            Ok(split) => split,
            Err(e) => {
                warn!("cannot split invocation: {e}");
                None
            }
        };

        let Some(split) = split else {
            // Not a compile (or not splittable): run the original
            // locally, verbatim.
            let result = inner
                .executor
                .run_task(local_task(invocation, &cwd))
                .await;
            output.send(&ProxyResponse::new(result.success, result.std_out));
            return;
        };

        debug!(
            "split: preprocess -> {:?}, compile input {:?}",
            split.preprocess.output(),
            split.compile.input()
        );

        let preprocess_result = inner
            .executor
            .run_task(local_task(split.preprocess, &cwd))
            .await;
        if !preprocess_result.success {
            output.send(&ProxyResponse::new(false, preprocess_result.std_out));
            return;
        }

        let mut compile = split.compile;
        absolutize_files(&mut compile, &cwd);

        if inner.remote_client.free_remote_threads() > 0 {
            let (tx, rx) = tokio::sync::oneshot::channel();
            inner
                .remote_client
                .invoke_tool(
                    &compile,
                    Box::new(move |info| {
                        let _ = tx.send(info);
                    }),
                )
                .await;
            match rx.await {
                Ok(info) => output.send(&ProxyResponse::new(info.result, info.std_out)),
                Err(_) => output.send(&ProxyResponse::new(false, "Internal error.")),
            }
        } else {
            let result = inner.executor.run_task(local_task(compile, &cwd)).await;
            output.send(&ProxyResponse::new(result.success, result.std_out));
        }
    }

    fn split(
        &self,
        invocation: &ToolCommandline,
    ) -> WuildResult<Option<wuild_invocation::SplitInvocation>> {
        self.inner
            .remote_client
            .provider()
            .split_invocation(invocation)
    }

    pub fn stop(&self) {
        if let Some(service) = self.inner.service.get() {
            service.stop();
        }
        self.inner.remote_client.stop();
    }
}

fn local_task(commandline: ToolCommandline, cwd: &Path) -> LocalExecutorTask {
    LocalExecutorTask {
        working_dir: Some(cwd.to_path_buf()),
        ..LocalExecutorTask::plain(commandline)
    }
}

/// Make the input/output arguments absolute against the request cwd, so
/// the remote client reads and writes the right files regardless of the
/// daemon's own working directory.
fn absolutize_files(inv: &mut ToolCommandline, cwd: &Path) {
    if let Some(input) = inv.input().map(str::to_string) {
        if !Path::new(&input).is_absolute() {
            inv.set_input(cwd.join(input).to_string_lossy().into_owned());
        }
    }
    if let Some(out) = inv.output().map(str::to_string) {
        if !Path::new(&out).is_absolute() {
            inv.set_output(cwd.join(out).to_string_lossy().into_owned());
        }
    }
}

/// Outcome of one proxied invocation.
pub struct ProxyRunOutcome {
    pub exit_code: i32,
    pub std_out: String,
}

/// The thin client: forward one invocation to the daemon, starting it if
/// necessary, and wait for the outcome.
pub async fn proxy_client_run(
    port: u16,
    tool_id: &str,
    executable: &str,
    args: Vec<String>,
    timeout: Duration,
    start_command: &str,
) -> ProxyRunOutcome {
    let cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let request = ProxyRequest {
        cwd,
        tool_id: tool_id.to_string(),
        executable: executable.to_string(),
        args,
    };

    // Nobody listening yet: start the daemon once, then keep dialing.
    let probe = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
    if probe.is_err() && !start_command.is_empty() {
        info!("starting proxy daemon: {start_command}");
        let words = split_shell_command(start_command);
        if let Some((program, rest)) = words.split_first() {
            match tokio::process::Command::new(program).args(rest).spawn() {
                Ok(mut child) => {
                    // The daemon detaches; we only care that it spawned.
                    tokio::spawn(async move {
                        let _ = child.wait().await;
                    });
                }
                Err(e) => warn!("failed to start '{start_command}': {e}"),
            }
        }
    }

    let settings = FrameHandlerSettings {
        protocol_version: CHANNEL_PROTOCOL_VERSION,
        after_disconnect_wait: Duration::from_millis(200),
        ..FrameHandlerSettings::default()
    };
    let handler = FrameHandler::connect("127.0.0.1", port, settings);
    handler.start();

    let outcome = handler
        .request::<ProxyRequest, ProxyResponse>(&request, Some(timeout))
        .await;
    handler.stop();

    match outcome {
        Ok(response) => ProxyRunOutcome {
            exit_code: i32::from(!response.result),
            std_out: response.std_out,
        },
        Err(e) => ProxyRunOutcome {
            exit_code: 1,
            std_out: format!("wuild proxy request failed: {e}"),
        },
    }
}
