use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;

/// Closed set of state machines the dispatcher can route to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum StateMachineKind {
    Transaction,
    IdAllocation,
    LockToken,
}

/// A single committed log position. Entries are immutable once appended;
/// the applier only ever borrows them from the log or the tail cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub payload: Operation,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: Operation) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operation {
    /// Client-originated operation carrying session identity for dedup.
    Distributed(DistributedOperation),
    /// Appended on leadership change; advances the applied watermark
    /// without touching any state machine.
    LeaderBarrier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistributedOperation {
    pub session_id: u64,
    pub operation_id: u64,
    pub content: CommandPayload,
}

impl DistributedOperation {
    pub fn new(session_id: u64, operation_id: u64, content: CommandPayload) -> Self {
        Self {
            session_id,
            operation_id,
            content,
        }
    }
}

/// Tagged command body, one variant per `StateMachineKind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandPayload {
    Transaction { body: Vec<u8> },
    IdAllocation { first_unallocated: u64, count: u64 },
    LockToken { candidate_id: u64 },
}

impl CommandPayload {
    pub fn kind(&self) -> StateMachineKind {
        match self {
            CommandPayload::Transaction { .. } => StateMachineKind::Transaction,
            CommandPayload::IdAllocation { .. } => StateMachineKind::IdAllocation,
            CommandPayload::LockToken { .. } => StateMachineKind::LockToken,
        }
    }
}

/// Result of one dispatched command, resolved only after the owning state
/// machine has applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub index: u64,
    pub kind: StateMachineKind,
    pub response: Vec<u8>,
}

/// Per-command result channel registered by the embedder for entries it is
/// waiting on. Dropped receivers are tolerated.
pub type CompletionSender = Sender<CommandOutcome>;
