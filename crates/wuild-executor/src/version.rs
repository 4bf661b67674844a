//! Compiler version probing for the version-matching gate.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use wuild_core::{ToolCommandline, ToolId, ToolVersion, ToolchainKind, VersionMap};
use wuild_invocation::InvocationToolProvider;

use crate::{LocalExecutor, LocalExecutorTask};

/// Determines tool versions by running each configured compiler once.
/// Pinned `<id>_version` values and `"no_check"` skip the probe.
pub struct VersionChecker {
    executor: Arc<dyn LocalExecutor>,
    provider: Arc<InvocationToolProvider>,
}

impl VersionChecker {
    pub fn new(executor: Arc<dyn LocalExecutor>, provider: Arc<InvocationToolProvider>) -> Self {
        Self { executor, provider }
    }

    /// Probe one executable.
    pub async fn tool_version(&self, id: &ToolId, kind: ToolchainKind) -> ToolVersion {
        let args: Vec<String> = match kind {
            ToolchainKind::Clang => vec!["--version".to_string()],
            ToolchainKind::Gcc => {
                vec!["-dumpfullversion".to_string(), "-dumpversion".to_string()]
            }
            // cl.exe prints its banner on any invocation.
            ToolchainKind::Msvc => Vec::new(),
            ToolchainKind::Auto => return ToolVersion::default(),
        };

        let task = LocalExecutorTask::plain(ToolCommandline::new(id.clone(), args));
        let result = self.executor.run_task(task).await;

        let pattern = match kind {
            ToolchainKind::Msvc => r"\d+\.\d+\.\d+\.\d+ for \w+",
            _ => r"\d+\.[0-9.]+",
        };
        let regex = Regex::new(pattern).expect("version pattern is valid");
        match regex.find(&result.std_out) {
            Some(found) => ToolVersion(found.as_str().to_string()),
            None => {
                debug!(
                    "no version in output of {}: {:?}",
                    id.executable,
                    result.std_out.lines().next().unwrap_or("")
                );
                ToolVersion::default()
            }
        }
    }

    /// Versions for every configured tool whose id is in `tool_ids`,
    /// keyed by the id the tool is advertised under.
    pub async fn determine_versions(&self, tool_ids: &[String]) -> VersionMap {
        let mut versions = VersionMap::new();
        for entry_id in self.provider.tool_ids() {
            if !tool_ids.is_empty() && !tool_ids.contains(&entry_id) {
                continue;
            }
            let Some(entry) = self.provider.resolve(&ToolId::from_id(&entry_id)) else {
                continue;
            };
            let advertised = entry.definition.remote_id().to_string();

            if !entry.definition.version.is_empty() {
                versions.insert(advertised, entry.definition.version.clone());
                continue;
            }

            let id = entry.tool_id();
            if id.executable.is_empty() {
                warn!("tool '{entry_id}' has no executable, version left empty");
                versions.insert(advertised, ToolVersion::default());
                continue;
            }
            let kind = match entry.definition.kind {
                ToolchainKind::Auto => ToolchainKind::guess(&id.executable),
                configured => configured,
            };
            let version = self.tool_version(&id, kind).await;
            debug!("tool '{entry_id}' -> version '{version}'");
            versions.insert(advertised, version);
        }
        versions
    }
}
