//! `wuild proxy` - the local daemon behind the compiler shim.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use wuild::{
    CoordinatorClient, ProxyServer, ProxyServerConfig, RemoteToolClient, RemoteToolClientConfig,
    WuildConfig,
};

use crate::context::AppContext;

#[derive(Args)]
pub struct ProxyArgs {
    /// Listen port (overrides [proxy] listenPort)
    #[arg(long)]
    port: Option<u16>,
}

pub async fn execute(args: ProxyArgs, mut config: WuildConfig) -> Result<()> {
    if let Some(port) = args.port {
        config.proxy.listen_port = port;
    }
    config.proxy.validate()?;

    let threads = config.proxy.thread_count.max(1);
    let (provider, executor, versions) = super::build_execution_stack(&config, threads).await?;

    let coordinator = CoordinatorClient::new(config.tool_client.coordinator());
    let remote_client = RemoteToolClient::new(
        RemoteToolClientConfig {
            client_id: config.tool_client.resolved_client_id(),
            queue_timeout: config.tool_client.queue_timeout(),
            request_timeout: config.tool_client.request_timeout(),
            invocation_attempts: config.tool_client.invocation_attempts,
            compression: config.tool_client.compression()?,
        },
        provider.clone(),
        versions,
        coordinator,
    );

    // The proxy serves one tool; only servers carrying it matter.
    let required_tools = if config.proxy.tool_id.is_empty() {
        provider.remote_tool_ids()
    } else {
        let id = wuild::ToolId::from_id(&config.proxy.tool_id);
        match provider.resolve(&id) {
            Some(entry) => vec![entry.definition.remote_id().to_string()],
            None => anyhow::bail!("[proxy] toolId '{}' is not configured", config.proxy.tool_id),
        }
    };
    remote_client.start(required_tools);
    remote_client.add_static_servers(
        &config.tool_client.toolserver_hosts,
        config.tool_client.toolserver_port,
        &config.tool_client.toolserver_ids,
    );

    let proxy = ProxyServer::new(
        ProxyServerConfig {
            listen_port: config.proxy.listen_port,
            inactive_timeout: config.proxy.inactive_timeout(),
        },
        Arc::new(executor),
        remote_client,
    );

    let context = AppContext::install();
    proxy.start().await?;
    info!("proxy daemon up on port {}", proxy.listen_port());

    tokio::select! {
        _ = context.wait() => {}
        _ = proxy.wait_idle() => {}
    }
    proxy.stop();
    Ok(())
}
