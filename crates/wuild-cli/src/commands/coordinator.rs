//! `wuild coordinator` - the fleet registry service.

use anyhow::Result;
use clap::Args;
use tracing::info;

use wuild::{CoordinatorServer, WuildConfig};

use crate::context::AppContext;

#[derive(Args)]
pub struct CoordinatorArgs {
    /// Listen port (overrides [coordinator] listenPort)
    #[arg(long)]
    port: Option<u16>,
}

pub async fn execute(args: CoordinatorArgs, mut config: WuildConfig) -> Result<()> {
    if let Some(port) = args.port {
        config.coordinator.listen_port = port;
    }
    config.coordinator.validate()?;

    let context = AppContext::install();
    let server = CoordinatorServer::start(config.coordinator.listen_port).await?;
    info!("coordinator up on port {}", server.listen_port());

    context.wait().await;
    server.stop();
    Ok(())
}
