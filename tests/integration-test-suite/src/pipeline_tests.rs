//! End-to-end remote compile pipeline with a fake compiler: client picks
//! a server, ships the preprocessed source, gets the object file back.

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use wuild_client::{RemoteToolClient, RemoteToolClientConfig, TaskExecutionInfo};
    use wuild_coordinator::CoordinatorClient;
    use wuild_core::config::{CoordinatorClientSettings, WuildConfig};
    use wuild_core::{CompressionInfo, ToolCommandline, ToolId, ToolVersion, VersionMap};
    use wuild_executor::ProcessExecutor;
    use wuild_invocation::InvocationToolProvider;
    use wuild_server::{RemoteToolServer, RemoteToolServerConfig};

    /// A stand-in compiler: copies its input to its output, understanding
    /// just enough of the GCC surface (`-c`, `-o`, `-x`). Appends one
    /// line per run to `log` so tests can see where work landed.
    fn write_fake_compiler(dir: &Path, name: &str, log: &Path, sleep: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        let script = format!(
            "#!/bin/sh\n\
             out=\"\"; in=\"\"\n\
             while [ $# -gt 0 ]; do\n\
             case \"$1\" in\n\
             -o) out=\"$2\"; shift 2 ;;\n\
             -x) shift 2 ;;\n\
             -*) shift ;;\n\
             *) in=\"$1\"; shift ;;\n\
             esac\n\
             done\n\
             {sleep}\n\
             cat \"$in\" > \"$out\"\n\
             echo run >> \"{}\"\n",
            log.display()
        );
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

    fn versions() -> VersionMap {
        let mut map = VersionMap::new();
        map.insert("fakecc".to_string(), ToolVersion::from("1.0"));
        map
    }

    fn disabled_coordinator() -> CoordinatorClient {
        CoordinatorClient::new(CoordinatorClientSettings {
            hosts: Vec::new(),
            port: 0,
            enabled: false,
            send_info_interval: Duration::from_secs(1),
        })
    }

    async fn start_server(
        name: &str,
        threads: u16,
        compiler: &Path,
        temp_dir: &Path,
    ) -> RemoteToolServer {
        let provider = provider_for(compiler);
        let executor = ProcessExecutor::new(provider, temp_dir.to_path_buf(), threads);
        let server = RemoteToolServer::new(
            RemoteToolServerConfig {
                listen_host: "127.0.0.1".to_string(),
                listen_port: 0,
                server_name: name.to_string(),
                thread_count: threads,
                hosts_white_list: Vec::new(),
                use_client_compression: true,
                compression: CompressionInfo::default(),
            },
            Arc::new(executor),
            disabled_coordinator(),
            versions(),
        );
        server.start().await.unwrap();
        server
    }

    fn client_for(compiler: &Path, queue_timeout: Duration) -> RemoteToolClient {
        RemoteToolClient::new(
            RemoteToolClientConfig {
                client_id: "it-build".to_string(),
                queue_timeout,
                request_timeout: Duration::from_secs(30),
                invocation_attempts: 2,
                compression: CompressionInfo::gzip(3),
            },
            provider_for(compiler),
            versions(),
            disabled_coordinator(),
        )
    }

    fn compile_stage(provider: &InvocationToolProvider, input: &Path, output: &Path) -> ToolCommandline {
        let raw = ToolCommandline::new(
            ToolId::from_id("fakecc"),
            vec![
                "-c".to_string(),
                input.to_string_lossy().into_owned(),
                "-o".to_string(),
                output.to_string_lossy().into_owned(),
            ],
        );
        provider.complete_invocation(&raw)
    }

    async fn invoke(client: &RemoteToolClient, invocation: &ToolCommandline) -> TaskExecutionInfo {
        let (tx, rx) = tokio::sync::oneshot::channel();
        client
            .invoke_tool(
                invocation,
                Box::new(move |info| {
                    let _ = tx.send(info);
                }),
            )
            .await;
        tokio::time::timeout(Duration::from_secs(30), rx)
            .await
            .expect("callback fires")
            .unwrap()
    }

    #[tokio::test]
    async fn one_client_one_server_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("runs.log");
        let compiler = write_fake_compiler(dir.path(), "fakecc", &log, "");
        let server = start_server("worker-1", 1, &compiler, dir.path()).await;

        let client = client_for(&compiler, Duration::from_secs(30));
        client.start(vec!["fakecc".to_string()]);
        client.add_static_servers(
            &["127.0.0.1".to_string()],
            server.listen_port(),
            &["fakecc".to_string()],
        );

        // The "preprocessed" source the client would have produced.
        let pp = dir.path().join("pp_hello.cpp");
        let obj = dir.path().join("hello.o");
        let source = b"// preprocessed\nint main() { return 0; }\n".to_vec();
        std::fs::write(&pp, &source).unwrap();

        let invocation = compile_stage(client.provider(), &pp, &obj);
        let info = invoke(&client, &invocation).await;

        assert!(info.result, "remote compile failed: {}", info.std_out);
        assert_eq!(std::fs::read(&obj).unwrap(), source);

        let session = client.session_info();
        assert_eq!(session.tasks_count, 1);
        assert_eq!(session.failures_count, 0);

        client.stop();
        server.stop();
    }

    #[tokio::test]
    async fn queue_timeout_fails_the_task_without_accounting_it() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("runs.log");
        let compiler = write_fake_compiler(dir.path(), "fakecc", &log, "");

        // No servers at all: the task can only expire.
        let client = client_for(&compiler, Duration::from_millis(100));
        client.start(vec!["fakecc".to_string()]);

        let pp = dir.path().join("pp_a.cpp");
        let obj = dir.path().join("a.o");
        std::fs::write(&pp, b"int a;\n").unwrap();

        let invocation = compile_stage(client.provider(), &pp, &obj);
        let started = tokio::time::Instant::now();
        let info = invoke(&client, &invocation).await;

        assert!(!info.result);
        assert_eq!(info.std_out, "Timeout expired.");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.session_info().tasks_count, 0);
        assert!(!obj.exists());

        client.stop();
    }

    #[tokio::test]
    async fn two_servers_share_the_load_by_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let log_a = dir.path().join("a.log");
        let log_b = dir.path().join("b.log");
        // Both "compilers" hold their slot briefly so load builds up.
        let compiler_a = write_fake_compiler(dir.path(), "fakecc_a", &log_a, "sleep 0.05");
        let compiler_b = write_fake_compiler(dir.path(), "fakecc_b", &log_b, "sleep 0.05");

        // Full discovery path: servers publish to a real coordinator,
        // the client learns true thread counts from the snapshots.
        let coordinator = wuild_coordinator::CoordinatorServer::start(0).await.unwrap();
        let coordinator_settings = |interval_ms: u64| CoordinatorClientSettings {
            hosts: vec!["127.0.0.1".to_string()],
            port: coordinator.listen_port(),
            enabled: true,
            send_info_interval: Duration::from_millis(interval_ms),
        };

        let start_published_server = |name: &'static str, threads: u16, compiler: PathBuf| {
            let settings = coordinator_settings(50);
            let temp = dir.path().to_path_buf();
            async move {
                let provider = provider_for(&compiler);
                let executor = ProcessExecutor::new(provider, temp, threads);
                let server = RemoteToolServer::new(
                    RemoteToolServerConfig {
                        listen_host: "127.0.0.1".to_string(),
                        listen_port: 0,
                        server_name: name.to_string(),
                        thread_count: threads,
                        hosts_white_list: Vec::new(),
                        use_client_compression: true,
                        compression: CompressionInfo::default(),
                    },
                    Arc::new(executor),
                    CoordinatorClient::new(settings),
                    versions(),
                );
                server.start().await.unwrap();
                server
            }
        };
        let server_a = start_published_server("worker-a", 2, compiler_a.clone()).await;
        let server_b = start_published_server("worker-b", 1, compiler_b.clone()).await;

        // The client resolves `fakecc` locally through compiler A's path;
        // which binary actually runs is each server's business.
        let client = RemoteToolClient::new(
            RemoteToolClientConfig {
                client_id: "it-build".to_string(),
                queue_timeout: Duration::from_secs(30),
                request_timeout: Duration::from_secs(30),
                invocation_attempts: 2,
                compression: CompressionInfo::gzip(3),
            },
            provider_for(&compiler_a),
            versions(),
            CoordinatorClient::new(coordinator_settings(50)),
        );
        client.start(vec!["fakecc".to_string()]);

        let mut handles = Vec::new();
        for i in 0..6 {
            let pp = dir.path().join(format!("pp_{i}.cpp"));
            let obj = dir.path().join(format!("{i}.o"));
            std::fs::write(&pp, format!("int x{i};\n")).unwrap();
            let invocation = compile_stage(client.provider(), &pp, &obj);
            let task_client = client.clone();
            handles.push(tokio::spawn(async move {
                invoke(&task_client, &invocation).await
            }));
        }

        for handle in handles {
            let info = handle.await.unwrap();
            assert!(info.result, "task failed: {}", info.std_out);
        }

        let runs = |log: &Path| -> usize {
            std::fs::read_to_string(log)
                .map(|text| text.lines().count())
                .unwrap_or(0)
        };
        let runs_a = runs(&log_a);
        let runs_b = runs(&log_b);
        assert_eq!(runs_a + runs_b, 6);
        assert!(runs_a >= 1 && runs_b >= 1, "both servers must contribute");
        assert!(
            runs_a >= runs_b,
            "the larger server should carry at least as much ({runs_a} vs {runs_b})"
        );

        let session = client.session_info();
        assert_eq!(session.tasks_count, 6);
        assert_eq!(session.failures_count, 0);

        client.stop();
        server_a.stop();
        server_b.stop();
        coordinator.stop();
    }

    #[tokio::test]
    async fn version_mismatch_excludes_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("runs.log");
        let compiler = write_fake_compiler(dir.path(), "fakecc", &log, "");

        // Server advertises version 2.0; the client insists on 1.0.
        let provider = provider_for(&compiler);
        let executor = ProcessExecutor::new(provider, dir.path().to_path_buf(), 1);
        let mut server_versions = VersionMap::new();
        server_versions.insert("fakecc".to_string(), ToolVersion::from("2.0"));
        let server = RemoteToolServer::new(
            RemoteToolServerConfig {
                listen_host: "127.0.0.1".to_string(),
                listen_port: 0,
                server_name: "worker-v2".to_string(),
                thread_count: 1,
                hosts_white_list: Vec::new(),
                use_client_compression: true,
                compression: CompressionInfo::default(),
            },
            Arc::new(executor),
            disabled_coordinator(),
            server_versions,
        );
        server.start().await.unwrap();

        let client = client_for(&compiler, Duration::from_millis(500));
        client.start(vec!["fakecc".to_string()]);
        client.add_static_servers(
            &["127.0.0.1".to_string()],
            server.listen_port(),
            &["fakecc".to_string()],
        );

        // Give the gate time to run, then verify the verdict.
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let entries = client.balancer().entries();
                if entries.first().is_some_and(|e| e.checked) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("version gate runs");
        let entry = &client.balancer().entries()[0];
        assert!(!entry.compatible, "mismatched server must be excluded");
        assert_eq!(client.balancer().find_free_client("fakecc"), None);

        // Tasks consequently expire instead of landing there.
        let pp = dir.path().join("pp_v.cpp");
        let obj = dir.path().join("v.o");
        std::fs::write(&pp, b"int v;\n").unwrap();
        let invocation = compile_stage(client.provider(), &pp, &obj);
        let info = invoke(&client, &invocation).await;
        assert!(!info.result);
        assert_eq!(info.std_out, "Timeout expired.");

        client.stop();
        server.stop();
    }
}
