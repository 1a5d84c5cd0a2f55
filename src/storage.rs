//! Durable state persistence: framed records, the dual-file store, and
//! crash recovery.

pub mod dual_file;
pub mod record;
pub mod recovery;

pub use dual_file::{ActiveFile, DurableState, DurableStateStore, StateStoreError};
pub use record::{write_record, RecordReader, ScanEnd, ScanOutcome};
pub use recovery::{recover, RecoveredState};
