//! Application layer of a replicated state machine: drains committed log
//! entries into registered state machines exactly once and in order, and
//! keeps the durable watermarks, session dedup state, snapshots and
//! catch-up machinery that make that survivable across restarts.

pub mod apply;
pub mod catchup;
pub mod command;
pub mod config;
pub mod log;
pub mod machines;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod telemetry;

pub use apply::{
    ApplierMode, AppliedIndexState, ApplyProgress, CommandApplier, FatalApplyError,
};
pub use catchup::{
    CatchUpError, CatchUpOrchestrator, ServiceGate, SnapshotRequestError, SnapshotSource,
    StoreCopyClient, StoreCopyError,
};
pub use command::{
    CommandOutcome, CommandPayload, CompletionSender, DistributedOperation, LogEntry, Operation,
    StateMachineKind,
};
pub use config::{ConfigError, CoreConfig};
pub use crate::log::{EntryCache, EntryCursor, InMemoryLog, LogError, ReplicatedLog};
pub use machines::{
    BatchDispatcher, DispatchError, MachineError, StateMachine, StateMachineRegistry,
};
pub use session::{SessionTracker, SessionTrackerState};
pub use snapshot::{InstallOutcome, Snapshot};
pub use storage::{DurableState, DurableStateStore, StateStoreError};
pub use telemetry::{ApplierMetricsPublisher, MetricsRegistry, MetricsSnapshot};
