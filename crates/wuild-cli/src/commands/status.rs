//! `wuild status` - show the fleet as a coordinator sees it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use wuild::{CoordinatorClient, CoordinatorInfo, WuildConfig};
use wuild_core::config::CoordinatorClientSettings;

#[derive(Args)]
pub struct StatusArgs {
    /// Coordinator host (defaults to the first [toolClient]
    /// coordinatorHost)
    #[arg(long)]
    host: Option<String>,

    /// Coordinator port (defaults to [toolClient] coordinatorPort)
    #[arg(long)]
    port: Option<u16>,

    /// Print the raw fleet view as JSON
    #[arg(long)]
    json: bool,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,
}

pub async fn execute(args: StatusArgs, config: WuildConfig) -> Result<()> {
    let host = args
        .host
        .or_else(|| config.tool_client.coordinator_host.first().cloned())
        .ok_or_else(|| anyhow::anyhow!("no coordinator host configured, pass --host"))?;
    let port = match args.port.unwrap_or(config.tool_client.coordinator_port) {
        0 => anyhow::bail!("no coordinator port configured, pass --port"),
        port => port,
    };

    let client = CoordinatorClient::new(CoordinatorClientSettings {
        hosts: vec![host.clone()],
        port,
        enabled: true,
        send_info_interval: Duration::from_secs(1),
    });

    let (tx, mut rx) = tokio::sync::mpsc::channel::<CoordinatorInfo>(1);
    client.set_info_arrived_callback(Arc::new(move |view| {
        let _ = tx.try_send(view.clone());
    }));
    client.start();

    let view = tokio::time::timeout(Duration::from_secs(args.timeout), rx.recv())
        .await
        .map_err(|_| anyhow::anyhow!("no answer from {host}:{port}"))?
        .ok_or_else(|| anyhow::anyhow!("coordinator connection closed"))?;
    client.stop();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view.tool_servers)?);
        return Ok(());
    }

    if view.tool_servers.is_empty() {
        println!("{}", "no tool servers registered".yellow());
        return Ok(());
    }

    println!(
        "{}",
        format!("{} tool server(s) @ {host}:{port}", view.tool_servers.len()).bold()
    );
    for server in &view.tool_servers {
        let load = format!(
            "{}/{} running, {} queued",
            server.running_tasks, server.total_threads, server.queued_tasks
        );
        let load = if server.running_tasks >= server.total_threads {
            load.red()
        } else if server.running_tasks > 0 {
            load.yellow()
        } else {
            load.green()
        };
        println!(
            "  {} {}:{} [{}] {}",
            server.server_id.bold(),
            server.host,
            server.port,
            server.tool_ids.join(", "),
            load
        );
        for client_info in &server.connected_clients {
            println!(
                "      client {} session {} using {} thread(s)",
                client_info.client_id, client_info.session_id, client_info.used_threads
            );
        }
    }
    Ok(())
}
