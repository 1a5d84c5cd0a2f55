use crate::storage::DurableState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialized form of the tracker. The ordinal is the log index of the
/// most recent update, which makes the state directly storable in a
/// dual-file store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTrackerState {
    pub sessions: BTreeMap<u64, u64>,
    pub ordinal: u64,
}

impl DurableState for SessionTrackerState {
    fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

/// Deduplicates replayed operations via a per-session monotonic operation
/// id. `validate` and `update` bracket a dispatch: an operation that fails
/// validation must neither reach a state machine nor advance the tracker.
#[derive(Debug, Default)]
pub struct SessionTracker {
    state: SessionTrackerState,
}

impl SessionTracker {
    pub fn from_state(state: SessionTrackerState) -> Self {
        Self { state }
    }

    /// True iff the operation should be applied: its id must be strictly
    /// greater than the recorded high-water id for the session. Unknown
    /// sessions are always valid.
    pub fn validate(&self, session_id: u64, operation_id: u64) -> bool {
        match self.state.sessions.get(&session_id) {
            Some(last) => operation_id > *last,
            None => true,
        }
    }

    pub fn update(&mut self, session_id: u64, operation_id: u64, index: u64) {
        self.state.sessions.insert(session_id, operation_id);
        self.state.ordinal = index;
    }

    pub fn last_operation(&self, session_id: u64) -> Option<u64> {
        self.state.sessions.get(&session_id).copied()
    }

    pub fn state(&self) -> &SessionTrackerState {
        &self.state
    }

    /// Wholesale replacement during snapshot install. The ordinal is pinned
    /// to the snapshot position so the durable copy always supersedes any
    /// pre-install record, even when the snapshot's own last session update
    /// happened at a lower index.
    pub fn install(&mut self, mut state: SessionTrackerState, at_index: u64) {
        state.ordinal = at_index;
        self.state = state;
    }
}
