//! Proxy daemon scenarios: one synchronous-looking compiler invocation
//! travels over loopback, gets split, preprocessed locally and compiled
//! through the fallback path when no fleet is available.

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use wuild_client::{RemoteToolClient, RemoteToolClientConfig};
    use wuild_coordinator::CoordinatorClient;
    use wuild_core::config::{CoordinatorClientSettings, WuildConfig};
    use wuild_core::protocol::proxy::{ProxyRequest, ProxyResponse, CHANNEL_PROTOCOL_VERSION};
    use wuild_core::{CompressionInfo, VersionMap};
    use wuild_executor::ProcessExecutor;
    use wuild_invocation::InvocationToolProvider;
    use wuild_proxy::{ProxyServer, ProxyServerConfig};
    use wuild_transport::{FrameHandler, FrameHandlerSettings};

    fn write_fake_compiler(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        let script = "#!/bin/sh\n\
             out=\"\"; in=\"\"\n\
             while [ $# -gt 0 ]; do\n\
             case \"$1\" in\n\
             -o) out=\"$2\"; shift 2 ;;\n\
             -x) shift 2 ;;\n\
             -*) shift ;;\n\
             *) in=\"$1\"; shift ;;\n\
             esac\n\
             done\n\
             cat \"$in\" > \"$out\"\n";
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn provider_for(compiler: &Path) -> Arc<InvocationToolProvider> {
        let toml = format!(
            "[tools]\ntoolIds = \"fakecc\"\nfakecc = \"{}\"\nfakecc_type = \"gcc\"\nfakecc_version = \"1.0\"\n",
            compiler.display()
        );
        let config = WuildConfig::from_toml(&toml, &[]).unwrap();
        Arc::new(InvocationToolProvider::from_config(&config.tools).unwrap())
    }

    async fn start_daemon(compiler: &Path, temp: &Path) -> ProxyServer {
        let provider = provider_for(compiler);
        let executor = ProcessExecutor::new(provider.clone(), temp.to_path_buf(), 2);
        let remote_client = RemoteToolClient::new(
            RemoteToolClientConfig {
                client_id: "proxy-it".to_string(),
                queue_timeout: Duration::from_secs(5),
                request_timeout: Duration::from_secs(5),
                invocation_attempts: 1,
                compression: CompressionInfo::default(),
            },
            provider,
            VersionMap::new(),
            CoordinatorClient::new(CoordinatorClientSettings {
                hosts: Vec::new(),
                port: 0,
                enabled: false,
                send_info_interval: Duration::from_secs(1),
            }),
        );
        remote_client.start(vec!["fakecc".to_string()]);

        let proxy = ProxyServer::new(
            ProxyServerConfig {
                listen_port: 0,
                inactive_timeout: Duration::from_secs(600),
            },
            Arc::new(executor),
            remote_client,
        );
        proxy.start().await.unwrap();
        proxy
    }

    async fn send_request(port: u16, request: &ProxyRequest) -> ProxyResponse {
        let settings = FrameHandlerSettings {
            protocol_version: CHANNEL_PROTOCOL_VERSION,
            after_disconnect_wait: Duration::from_millis(100),
            ..FrameHandlerSettings::default()
        };
        let handler = FrameHandler::connect("127.0.0.1", port, settings);
        handler.start();
        let response = handler
            .request::<ProxyRequest, ProxyResponse>(request, Some(Duration::from_secs(20)))
            .await
            .expect("proxy answers");
        handler.stop();
        response
    }

    #[tokio::test]
    async fn compile_invocation_splits_and_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = write_fake_compiler(dir.path(), "fakecc");
        let proxy = start_daemon(&compiler, dir.path()).await;

        // Relative paths resolve against the request's cwd.
        let source = b"int main() { return 7; }\n".to_vec();
        std::fs::write(dir.path().join("main.cpp"), &source).unwrap();

        let request = ProxyRequest {
            cwd: dir.path().to_string_lossy().into_owned(),
            tool_id: "fakecc".to_string(),
            executable: String::new(),
            args: vec![
                "-c".to_string(),
                "main.cpp".to_string(),
                "-o".to_string(),
                "main.o".to_string(),
            ],
        };
        let response = send_request(proxy.listen_port(), &request).await;
        assert!(response.result, "proxy compile failed: {}", response.std_out);

        // The split ran: the preprocessed intermediate and the object
        // both exist, and the object carries the source content (our
        // fake compiler copies).
        assert!(dir.path().join("pp_main.cpp").exists());
        assert_eq!(std::fs::read(dir.path().join("main.o")).unwrap(), source);

        proxy.stop();
    }

    #[tokio::test]
    async fn non_compile_invocation_runs_locally_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = write_fake_compiler(dir.path(), "fakecc");
        let proxy = start_daemon(&compiler, dir.path()).await;

        std::fs::write(dir.path().join("input.txt"), b"payload").unwrap();

        // No -c: not a compile, the original command runs as-is.
        let request = ProxyRequest {
            cwd: dir.path().to_string_lossy().into_owned(),
            tool_id: "fakecc".to_string(),
            executable: String::new(),
            args: vec![
                "input.txt".to_string(),
                "-o".to_string(),
                "copied.txt".to_string(),
            ],
        };
        let response = send_request(proxy.listen_port(), &request).await;
        assert!(response.result, "local run failed: {}", response.std_out);
        assert_eq!(
            std::fs::read(dir.path().join("copied.txt")).unwrap(),
            b"payload"
        );

        proxy.stop();
    }

    #[tokio::test]
    async fn idle_daemon_shuts_itself_down() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = write_fake_compiler(dir.path(), "fakecc");

        let provider = provider_for(&compiler);
        let executor = ProcessExecutor::new(provider.clone(), dir.path().to_path_buf(), 1);
        let remote_client = RemoteToolClient::new(
            RemoteToolClientConfig::default(),
            provider,
            VersionMap::new(),
            CoordinatorClient::new(CoordinatorClientSettings {
                hosts: Vec::new(),
                port: 0,
                enabled: false,
                send_info_interval: Duration::from_secs(1),
            }),
        );
        let proxy = ProxyServer::new(
            ProxyServerConfig {
                listen_port: 0,
                inactive_timeout: Duration::from_millis(100),
            },
            Arc::new(executor),
            remote_client,
        );
        proxy.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(30), proxy.wait_idle())
            .await
            .expect("idle watchdog fires");
        proxy.stop();
    }
}
