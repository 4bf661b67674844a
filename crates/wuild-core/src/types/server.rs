//! Fleet state: tool server descriptions, per-session usage counters and
//! the coordinator's merged view.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One build client currently using a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectedClientInfo {
    pub client_id: String,
    pub session_id: i64,
    pub used_threads: u16,
}

/// Advertised state of one tool server.
///
/// Two infos with equal `(server_id, host, port)` describe the same
/// server; newer values replace older ones on merge.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolServerInfo {
    pub server_id: String,
    pub host: String,
    pub port: u16,
    pub tool_ids: Vec<String>,
    pub total_threads: u16,
    pub running_tasks: u16,
    pub queued_tasks: u16,
    pub connected_clients: Vec<ConnectedClientInfo>,
}

impl ToolServerInfo {
    /// Identity comparison: same server, possibly different load.
    pub fn same_identity(&self, other: &ToolServerInfo) -> bool {
        self.server_id == other.server_id && self.host == other.host && self.port == other.port
    }

    /// Stable key for registries keyed by server identity.
    pub fn identity_key(&self) -> String {
        format!("{}@{}:{}", self.server_id, self.host, self.port)
    }

    pub fn advertises_tool(&self, tool_id: &str) -> bool {
        self.tool_ids.iter().any(|t| t == tool_id)
    }
}

impl fmt::Display for ToolServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}) threads={} running={} queued={} clients={}",
            self.server_id,
            self.host,
            self.port,
            self.total_threads,
            self.running_tasks,
            self.queued_tasks,
            self.connected_clients.len()
        )
    }
}

/// Usage counters for one build session (one build's use of the fleet).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolServerSessionInfo {
    pub client_id: String,
    pub session_id: i64,
    pub tasks_count: u32,
    pub failures_count: u32,
    pub total_network_time: Duration,
    pub total_execution_time: Duration,
    pub elapsed_time: Duration,
    pub current_used_threads: u32,
    pub max_used_threads: u32,
}

impl ToolServerSessionInfo {
    pub fn summary(&self) -> String {
        format!(
            "session {} of {}: {} tasks, {} failures, net {} us, exec {} us, max threads {}",
            self.session_id,
            self.client_id,
            self.tasks_count,
            self.failures_count,
            self.total_network_time.as_micros(),
            self.total_execution_time.as_micros(),
            self.max_used_threads
        )
    }
}

/// The merged fleet view held by a coordinator (server side) or assembled
/// from coordinator snapshots (client side).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoordinatorInfo {
    pub tool_servers: Vec<ToolServerInfo>,
}

impl CoordinatorInfo {
    /// Merge one server description by identity. Returns the index of the
    /// entry when it was inserted or its stored contents changed, `None`
    /// when the update was a no-op.
    pub fn update_one(&mut self, incoming: &ToolServerInfo) -> Option<usize> {
        for (index, existing) in self.tool_servers.iter_mut().enumerate() {
            if existing.same_identity(incoming) {
                if existing == incoming {
                    return None;
                }
                *existing = incoming.clone();
                return Some(index);
            }
        }
        self.tool_servers.push(incoming.clone());
        Some(self.tool_servers.len() - 1)
    }

    /// Merge a whole snapshot; returns the indices of entries that were
    /// inserted or changed, in merge order.
    pub fn update(&mut self, incoming: &[ToolServerInfo]) -> Vec<usize> {
        incoming
            .iter()
            .filter_map(|info| self.update_one(info))
            .collect()
    }

    /// Drop every entry whose identity key satisfies the predicate.
    pub fn retain_identities(&mut self, mut keep: impl FnMut(&ToolServerInfo) -> bool) {
        self.tool_servers.retain(|info| keep(info));
    }

    pub fn total_threads(&self) -> u32 {
        self.tool_servers
            .iter()
            .map(|s| u32::from(s.total_threads))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str, port: u16, running: u16) -> ToolServerInfo {
        ToolServerInfo {
            server_id: id.to_string(),
            host: "10.0.0.1".to_string(),
            port,
            tool_ids: vec!["gcc9".to_string()],
            total_threads: 8,
            running_tasks: running,
            queued_tasks: 0,
            connected_clients: vec![],
        }
    }

    #[test]
    fn identity_ignores_load_fields() {
        let a = server("a", 7767, 0);
        let b = server("a", 7767, 5);
        assert!(a.same_identity(&b));
        assert_ne!(a, b);
        assert!(!a.same_identity(&server("a", 7768, 0)));
    }

    #[test]
    fn update_returns_exactly_the_changed_subset() {
        let mut info = CoordinatorInfo::default();
        let a = server("a", 7767, 0);
        let b = server("b", 7767, 0);

        assert_eq!(info.update(&[a.clone(), b.clone()]), vec![0, 1]);

        // Identical snapshot: nothing changed.
        assert_eq!(info.update(&[a.clone(), b.clone()]), Vec::<usize>::new());

        // Only `b` moved.
        let b2 = server("b", 7767, 3);
        assert_eq!(info.update(&[a.clone(), b2.clone()]), vec![1]);
        assert_eq!(info.tool_servers[1], b2);
    }

    #[test]
    fn update_is_idempotent() {
        let mut first = CoordinatorInfo::default();
        let mut second = CoordinatorInfo::default();
        let snapshot = vec![server("a", 1, 2), server("b", 2, 0)];

        first.update(&snapshot);
        second.update(&snapshot);
        second.update(&snapshot);
        assert_eq!(first, second);
    }

    #[test]
    fn retain_drops_evicted_servers() {
        let mut info = CoordinatorInfo::default();
        info.update(&[server("a", 1, 0), server("b", 2, 0)]);
        info.retain_identities(|s| s.server_id != "a");
        assert_eq!(info.tool_servers.len(), 1);
        assert_eq!(info.tool_servers[0].server_id, "b");
    }
}
