/// Aggregate memory state.
///
/// `MemoryState` is the single root the engine mutates and the store
/// persists: the graph, the policy store, the recall session ring and the
/// operation history all hang off it. Everything here is plain data so a
/// snapshot is one serialization call.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::MemoryGraph;
use crate::policy::{PolicyStore, SessionRecord, SESSION_RING_CAPACITY};
use crate::types::HistoryEntry;

/// Current snapshot format. Loads reject any other major version.
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on retained history entries; the oldest are dropped first so
/// snapshots stay restartable.
pub const HISTORY_CAPACITY: usize = 10_000;

/// The complete persistent state of one memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryState {
    /// Snapshot format version
    #[serde(rename = "formatVersion")]
    pub format_version: u32,

    /// Stable identity of this memory
    pub id: String,

    /// When the memory was first created (epoch ms)
    pub born: u64,

    /// Sum of item energies, refreshed after every mutating operation
    pub global_energy: f64,

    /// Retention threshold for the decay pass: items whose
    /// energy + importance falls below it are evicted
    pub threshold: f64,

    /// Items and edges
    pub graph: MemoryGraph,

    /// Policy params, active selections and all installed versions
    pub policy: PolicyStore,

    /// Recent recall sessions, newest at the back
    pub recent_sessions: VecDeque<SessionRecord>,

    /// Operation log, oldest first
    pub history: Vec<HistoryEntry>,

    /// Monotonic count of item-level changes, used for manifest
    /// invalidation
    #[serde(default)]
    pub change_counter: u64,
}

impl MemoryState {
    /// Create a fresh state born at the given time.
    pub fn new(now_ms: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            id: Uuid::new_v4().to_string(),
            born: now_ms,
            global_energy: 0.0,
            threshold: 0.05,
            graph: MemoryGraph::new(),
            policy: PolicyStore::new(now_ms),
            recent_sessions: VecDeque::new(),
            history: Vec::new(),
            change_counter: 0,
        }
    }

    /// Append a history entry, dropping the oldest past capacity.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= HISTORY_CAPACITY {
            let excess = self.history.len() + 1 - HISTORY_CAPACITY;
            self.history.drain(0..excess);
        }
        self.history.push(entry);
    }

    /// Append a recall session, keeping the ring bounded.
    pub fn push_session(&mut self, session: SessionRecord) {
        if self.recent_sessions.len() >= SESSION_RING_CAPACITY {
            self.recent_sessions.pop_front();
        }
        self.recent_sessions.push_back(session);
    }

    /// Record that `n` items changed and refresh the cached energy total.
    pub fn note_changes(&mut self, n: u64) {
        self.change_counter += n;
        self.global_energy = self.graph.total_energy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_ring_is_bounded() {
        let mut state = MemoryState::new(0);
        for i in 0..(HISTORY_CAPACITY + 10) {
            state.push_history(HistoryEntry::new(i as u64, "op", "", ""));
        }
        assert_eq!(state.history.len(), HISTORY_CAPACITY);
        // Oldest entries were dropped
        assert_eq!(state.history[0].at, 10);
    }

    #[test]
    fn test_session_ring_is_bounded() {
        use crate::policy::{PolicySelection, SessionRecord};
        let mut state = MemoryState::new(0);
        let selection = PolicySelection {
            decay: "d".to_string(),
            recall_score: "r".to_string(),
            exploration: "e".to_string(),
        };
        for i in 0..(SESSION_RING_CAPACITY + 5) {
            state.push_session(SessionRecord {
                session_id: format!("s{i}"),
                query: String::new(),
                at: i as u64,
                returned_ids: vec![],
                policy_versions: selection.clone(),
            });
        }
        assert_eq!(state.recent_sessions.len(), SESSION_RING_CAPACITY);
        assert_eq!(state.recent_sessions.front().unwrap().at, 5);
    }

    #[test]
    fn test_serde_round_trip() {
        let state = MemoryState::new(42);
        let json = serde_json::to_string(&state).unwrap();
        let loaded: MemoryState = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.format_version, FORMAT_VERSION);
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.born, 42);
        assert_eq!(loaded.policy.version_count(), 3);
    }
}
