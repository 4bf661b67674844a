//! The client-side load balancer: picks the least-loaded compatible tool
//! server for each task.

use std::sync::Mutex;

use tracing::debug;

use wuild_core::ToolServerInfo;

/// Load-score scale. Scores are `busy_total * WEIGHT / total_threads`, so
/// servers of different sizes compare by utilization, not absolute task
/// count.
const TASK_WEIGHT: i64 = 32768;

/// Result of feeding one fleet entry into the balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// New server; the returned index is stable for its lifetime.
    Added(usize),
    Updated,
    /// Ignored: advertises none of the required tools.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct BalancerEntry {
    pub tool_server: ToolServerInfo,
    /// Transport-level liveness.
    pub active: bool,
    /// Version-gate verdict; selection needs both flags.
    pub compatible: bool,
    /// Whether the version gate ran at all for this server.
    pub checked: bool,
    pub busy_mine: u16,
    pub busy_others: u16,
    pub busy_network_penalty: u16,
    pub busy_total: u16,
    pub load_score: i64,
    prev_queued: u16,
    prev_queued_avg: u16,
}

impl BalancerEntry {
    fn new(tool_server: ToolServerInfo) -> Self {
        Self {
            tool_server,
            active: false,
            compatible: false,
            checked: false,
            busy_mine: 0,
            busy_others: 0,
            busy_network_penalty: 0,
            busy_total: 0,
            load_score: 0,
            prev_queued: 0,
            prev_queued_avg: 0,
        }
    }

    fn update_load(&mut self, my_session_id: i64) {
        self.busy_others = 0;
        for client in &self.tool_server.connected_clients {
            if client.session_id != 0 && client.session_id != my_session_id {
                self.busy_others += client.used_threads;
            }
        }
        // Discount other sessions by one thread: a little greed wins the
        // race for a slot that is about to free up.
        self.busy_others = self.busy_others.saturating_sub(u16::from(self.busy_others > 0));

        let total = self.tool_server.total_threads;
        self.busy_total =
            (self.busy_mine + self.busy_others + self.busy_network_penalty).min(total);
        self.load_score = if total == 0 {
            i64::MAX
        } else {
            i64::from(self.busy_total) * TASK_WEIGHT / i64::from(total)
        };
    }

    /// Feed the server-side queue length into a two-sample moving
    /// average. A growing peer queue earns a penalty (up to the thread
    /// count); an empty queue pays it back.
    fn update_server_side_load(&mut self, queued: u16) {
        let avg = (self.prev_queued + queued) / 2;
        if queued == 0 {
            self.busy_network_penalty = self.busy_network_penalty.saturating_sub(1);
        } else if avg > self.prev_queued_avg
            && self.busy_network_penalty < self.tool_server.total_threads
        {
            self.busy_network_penalty += 1;
        }
        self.prev_queued = queued;
        self.prev_queued_avg = avg;
    }
}

#[derive(Default)]
struct State {
    entries: Vec<BalancerEntry>,
    required_tool_ids: Vec<String>,
    session_id: i64,
    total_remote_threads: u32,
    free_remote_threads: i32,
    used_threads: u32,
}

impl State {
    fn recalc(&mut self) {
        let mut total = 0u32;
        let mut free = 0i32;
        let mut used = 0u32;
        for entry in &self.entries {
            if entry.active && entry.compatible {
                total += u32::from(entry.tool_server.total_threads);
                free += i32::from(entry.tool_server.total_threads) - i32::from(entry.busy_total);
                used += u32::from(entry.busy_mine);
            }
        }
        self.total_remote_threads = total;
        self.free_remote_threads = free;
        self.used_threads = used;
    }
}

/// Thread-safe balancer state. One mutex guards the whole client vector;
/// readers and mutators take the same lock.
#[derive(Default)]
pub struct ToolBalancer {
    state: Mutex<State>,
}

impl ToolBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_required_tools(&self, tool_ids: Vec<String>) {
        self.state.lock().unwrap().required_tool_ids = tool_ids;
    }

    pub fn set_session_id(&self, session_id: i64) {
        self.state.lock().unwrap().session_id = session_id;
    }

    /// Merge a fleet entry. Servers advertising none of the required
    /// tools are skipped entirely.
    pub fn update_client(&self, tool_server: &ToolServerInfo) -> ClientStatus {
        let mut state = self.state.lock().unwrap();
        if !state.required_tool_ids.is_empty() {
            let has_any = state
                .required_tool_ids
                .iter()
                .any(|required| tool_server.advertises_tool(required));
            if !has_any {
                debug!("skipping tool server {}: no required tools", tool_server.host);
                return ClientStatus::Skipped;
            }
        }

        let session_id = state.session_id;
        for entry in &mut state.entries {
            if entry.tool_server.same_identity(tool_server) {
                entry.tool_server = tool_server.clone();
                // Snapshots carry the peer's queue length; fold it into
                // the network penalty as we merge.
                entry.update_server_side_load(tool_server.queued_tasks);
                entry.update_load(session_id);
                state.recalc();
                return ClientStatus::Updated;
            }
        }

        let mut entry = BalancerEntry::new(tool_server.clone());
        entry.update_load(session_id);
        state.entries.push(entry);
        let index = state.entries.len() - 1;
        state.recalc();
        ClientStatus::Added(index)
    }

    pub fn set_client_active(&self, index: usize, active: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(index) {
            entry.active = active;
        }
        state.recalc();
    }

    pub fn set_client_compatible(&self, index: usize, compatible: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(index) {
            entry.compatible = compatible;
            entry.checked = true;
        }
        state.recalc();
    }

    pub fn is_client_checked(&self, index: usize) -> bool {
        let state = self.state.lock().unwrap();
        state.entries.get(index).is_some_and(|e| e.checked)
    }

    /// Feed the advertised queue length of one server.
    pub fn set_server_side_load(&self, index: usize, queued: u16) {
        let mut state = self.state.lock().unwrap();
        let session_id = state.session_id;
        if let Some(entry) = state.entries.get_mut(index) {
            entry.update_server_side_load(queued);
            entry.update_load(session_id);
        }
        state.recalc();
    }

    /// Least-loaded active, compatible server advertising `tool_id` that
    /// still has a free slot. Ties break to the first fit in registry
    /// order, so equal loads keep landing on the same server (its file
    /// caches stay warm).
    pub fn find_free_client(&self, tool_id: &str) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let mut best: Option<(usize, i64)> = None;
        for (index, entry) in state.entries.iter().enumerate() {
            if !entry.active || !entry.compatible {
                continue;
            }
            if !entry.tool_server.advertises_tool(tool_id) {
                continue;
            }
            if entry.busy_total >= entry.tool_server.total_threads {
                continue;
            }
            if best.is_none_or(|(_, score)| entry.load_score < score) {
                best = Some((index, entry.load_score));
            }
        }
        best.map(|(index, _)| index)
    }

    pub fn start_task(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        let session_id = state.session_id;
        if let Some(entry) = state.entries.get_mut(index) {
            entry.busy_mine += 1;
            entry.update_load(session_id);
        }
        state.recalc();
    }

    pub fn finish_task(&self, index: usize) {
        let mut state = self.state.lock().unwrap();
        let session_id = state.session_id;
        if let Some(entry) = state.entries.get_mut(index) {
            entry.busy_mine = entry.busy_mine.saturating_sub(1);
            entry.update_load(session_id);
        }
        state.recalc();
    }

    pub fn total_remote_threads(&self) -> u32 {
        self.state.lock().unwrap().total_remote_threads
    }

    pub fn free_threads(&self) -> i32 {
        self.state.lock().unwrap().free_remote_threads
    }

    pub fn used_threads(&self) -> u32 {
        self.state.lock().unwrap().used_threads
    }

    pub fn all_active(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.entries.iter().all(|e| e.active)
    }

    pub fn entries(&self) -> Vec<BalancerEntry> {
        self.state.lock().unwrap().entries.clone()
    }
}
