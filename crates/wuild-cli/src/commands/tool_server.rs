//! `wuild tool-server` - the compile worker.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use wuild::{CoordinatorClient, RemoteToolServer, RemoteToolServerConfig, WuildConfig};

use crate::context::AppContext;

#[derive(Args)]
pub struct ToolServerArgs {
    /// Listen port (overrides [toolServer] listenPort)
    #[arg(long)]
    port: Option<u16>,

    /// Worker thread count (overrides [toolServer] threadCount)
    #[arg(long)]
    threads: Option<u16>,
}

pub async fn execute(args: ToolServerArgs, mut config: WuildConfig) -> Result<()> {
    if let Some(port) = args.port {
        config.tool_server.listen_port = port;
    }
    if let Some(threads) = args.threads {
        config.tool_server.thread_count = threads;
    }
    if config.tool_server.server_name.is_empty() {
        config.tool_server.server_name = hostname();
    }
    config.tool_server.validate()?;

    let threads = config.tool_server.resolved_thread_count();
    let (_provider, executor, versions) = super::build_execution_stack(&config, threads).await?;
    info!("tool versions: {versions:?}");

    let coordinator = CoordinatorClient::new(config.tool_server.coordinator());
    let server = RemoteToolServer::new(
        RemoteToolServerConfig {
            listen_host: config.tool_server.listen_host.clone(),
            listen_port: config.tool_server.listen_port,
            server_name: config.tool_server.server_name.clone(),
            thread_count: threads,
            hosts_white_list: config.tool_server.hosts_white_list.clone(),
            use_client_compression: config.tool_server.use_client_compression,
            compression: config.tool_server.compression()?,
        },
        Arc::new(executor),
        coordinator,
        versions,
    );

    let context = AppContext::install();
    server.start().await?;

    context.wait().await;
    server.stop();
    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("toolserver-{}", std::process::id()))
}
