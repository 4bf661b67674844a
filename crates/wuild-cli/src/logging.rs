//! Logging setup from the `[logging]` configuration table.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use wuild_core::config::LoggingConfig;

pub fn init(config: &LoggingConfig, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wuild={level},wuild_core={level},wuild_transport={level},wuild_invocation={level},wuild_executor={level},wuild_coordinator={level},wuild_client={level},wuild_server={level},wuild_proxy={level},wuild_cli={level}")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if config.log_to_file && !config.log_dir.is_empty() {
        let _ = std::fs::create_dir_all(&config.log_dir);
        let path = std::path::Path::new(&config.log_dir)
            .join(format!("wuild-{}.log", std::process::id()));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let builder = builder.with_writer(Mutex::new(file)).with_ansi(false);
                if config.output_timestamp {
                    builder.init();
                } else {
                    builder.without_time().init();
                }
                return;
            }
            Err(e) => eprintln!("cannot open log file {}: {e}", path.display()),
        }
    }

    // Default: stderr, like every other build tool.
    let builder = builder.with_writer(std::io::stderr);
    if config.output_timestamp {
        builder.init();
    } else {
        builder.without_time().init();
    }
}
