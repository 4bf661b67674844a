//! Subcommand implementations.

pub mod coordinator;
pub mod proxy;
pub mod run;
pub mod status;
pub mod tool_server;

pub use coordinator::CoordinatorArgs;
pub use proxy::ProxyArgs;
pub use run::RunArgs;
pub use status::StatusArgs;
pub use tool_server::ToolServerArgs;

use std::sync::Arc;

use anyhow::Result;

use wuild::{InvocationToolProvider, ProcessExecutor, VersionChecker, VersionMap, WuildConfig};

/// Build the invocation provider + executor + version map trio shared by
/// the tool-server and proxy commands.
pub(crate) async fn build_execution_stack(
    config: &WuildConfig,
    thread_count: u16,
) -> Result<(Arc<InvocationToolProvider>, ProcessExecutor, VersionMap)> {
    let provider = Arc::new(InvocationToolProvider::from_config(&config.tools)?);
    let temp_dir = std::env::temp_dir().join("wuild");
    std::fs::create_dir_all(&temp_dir)?;
    let executor = ProcessExecutor::new(provider.clone(), temp_dir, thread_count);

    let checker = VersionChecker::new(Arc::new(executor.clone()), provider.clone());
    let versions = checker.determine_versions(&provider.tool_ids()).await;
    Ok((provider, executor, versions))
}
