use crate::command::StateMachineKind;
use crate::session::SessionTrackerState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consistent cut of all state machine state plus the session tracker, as
/// of applying entries up to and including `prev_index`. Captured only
/// while the applier is drained, so the parts describe one single point in
/// the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub prev_index: u64,
    pub prev_term: u64,
    pub parts: BTreeMap<StateMachineKind, Vec<u8>>,
    pub sessions: SessionTrackerState,
}

impl Snapshot {
    /// Installs must never move a member backward.
    pub fn supersedes(&self, last_applied: u64) -> bool {
        self.prev_index > last_applied
    }
}

/// Result of an install attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// State machines, tracker and watermarks now reflect the snapshot.
    Installed { prev_index: u64 },
    /// The snapshot is at or behind the local applied watermark; nothing
    /// was touched.
    Stale {
        prev_index: u64,
        last_applied: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_supersedes_only_strictly_newer_state() {
        let snapshot = Snapshot {
            prev_index: 10,
            prev_term: 2,
            parts: BTreeMap::new(),
            sessions: SessionTrackerState::default(),
        };
        assert!(snapshot.supersedes(9));
        assert!(!snapshot.supersedes(10));
        assert!(!snapshot.supersedes(11));
    }

    #[test]
    fn snapshot_round_trips_with_machine_keyed_parts() {
        let mut parts = BTreeMap::new();
        parts.insert(StateMachineKind::Transaction, vec![1, 2, 3]);
        parts.insert(StateMachineKind::LockToken, vec![9]);
        let mut sessions = SessionTrackerState::default();
        sessions.sessions.insert(4, 7);
        sessions.ordinal = 10;
        let snapshot = Snapshot {
            prev_index: 10,
            prev_term: 3,
            parts,
            sessions,
        };
        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let decoded: Snapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, snapshot);
    }
}
