//! # Wuild CLI
//!
//! One binary, one subcommand per process role:
//!
//! ```bash
//! wuild coordinator                 # fleet registry
//! wuild tool-server                 # worker serving compile tasks
//! wuild proxy                       # local daemon behind the proxy shim
//! wuild run -- g++ -c a.cpp -o a.o  # proxy-client compiler shim
//! wuild status                      # current fleet view
//! ```
//!
//! Any configuration key can be overridden on the command line with
//! `--wuild-<group>-<key>=<value>`, e.g.
//! `--wuild-coordinator-listenPort=7700`.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;

use wuild_core::config::split_cli_overrides;
use wuild_core::WuildConfig;

mod commands;
mod context;
mod logging;

use commands::*;

/// Wuild - distributed C/C++ compilation
#[derive(Parser)]
#[command(name = "wuild")]
#[command(about = "Wuild - distributed C/C++ compilation over a pool of tool servers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file path (default: $WUILD_CONFIG, ./wuild.toml,
    /// ~/.wuild.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator registry service
    Coordinator(CoordinatorArgs),
    /// Run a tool server (compile worker)
    ToolServer(ToolServerArgs),
    /// Run the local proxy daemon
    Proxy(ProxyArgs),
    /// Forward one compiler invocation through the proxy daemon
    Run(RunArgs),
    /// Show the current fleet view from a coordinator
    Status(StatusArgs),
}

fn find_config(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path);
    }
    if let Ok(env_path) = std::env::var("WUILD_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    let local = PathBuf::from("wuild.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = std::env::var_os("HOME") {
        let dotfile = PathBuf::from(home).join(".wuild.toml");
        if dotfile.exists() {
            return Some(dotfile);
        }
    }
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    // `--wuild-*` overrides are split out before clap sees the argument
    // list.
    let raw_args: Vec<String> = std::env::args().collect();
    let (overrides, mut plain_args) = match split_cli_overrides(&raw_args[1..]) {
        Ok(split) => split,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    plain_args.insert(0, raw_args[0].clone());
    let cli = Cli::parse_from(plain_args);

    let config_path = find_config(cli.config.clone());
    let config = match WuildConfig::load(config_path.as_deref(), &overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    logging::init(&config.logging, cli.verbose);
    debug!(
        "config loaded from {:?}, {} override(s)",
        config_path,
        overrides.len()
    );

    match cli.command {
        Commands::Coordinator(args) => coordinator::execute(args, config).await,
        Commands::ToolServer(args) => tool_server::execute(args, config).await,
        Commands::Proxy(args) => proxy::execute(args, config).await,
        Commands::Run(args) => run::execute(args, config).await,
        Commands::Status(args) => status::execute(args, config).await,
    }
}
