use corestate::{
    CommandApplier, CommandPayload, CoreConfig, DistributedOperation, InMemoryLog, LogEntry,
    MachineError, Operation, StateMachine, StateMachineKind, StateMachineRegistry,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use tempfile::tempdir;

/// Keys every effect by log index and persists the set on flush, so
/// replaying an already-applied suffix after a crash changes nothing.
struct DurableSet {
    path: PathBuf,
    applied: BTreeSet<u64>,
    dirty: bool,
}

impl DurableSet {
    fn open(path: PathBuf) -> Self {
        let applied = fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            applied,
            dirty: false,
        }
    }
}

impl StateMachine for DurableSet {
    fn apply_command(&mut self, _payload: &CommandPayload, index: u64) -> Vec<u8> {
        self.applied.insert(index);
        self.dirty = true;
        index.to_le_bytes().to_vec()
    }

    fn ensure_visible(&mut self) {}

    fn flush(&mut self) -> Result<(), MachineError> {
        if self.dirty {
            fs::write(&self.path, serde_json::to_vec(&self.applied)?)?;
            self.dirty = false;
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, MachineError> {
        Ok(serde_json::to_vec(&self.applied)?)
    }

    fn install_snapshot(&mut self, part: &[u8]) -> Result<(), MachineError> {
        self.applied = serde_json::from_slice(part)?;
        self.dirty = true;
        Ok(())
    }
}

fn lock_entry(index: u64, session: u64, operation: u64) -> LogEntry {
    LogEntry::new(
        index,
        1,
        Operation::Distributed(DistributedOperation::new(
            session,
            operation,
            CommandPayload::LockToken { candidate_id: session },
        )),
    )
}

fn tx_entry(index: u64, session: u64, operation: u64) -> LogEntry {
    LogEntry::new(
        index,
        1,
        Operation::Distributed(DistributedOperation::new(
            session,
            operation,
            CommandPayload::Transaction {
                body: vec![index as u8],
            },
        )),
    )
}

fn durable_registry(dir: &std::path::Path, kind: StateMachineKind) -> StateMachineRegistry {
    let mut registry = StateMachineRegistry::new();
    registry.register(
        kind,
        Box::new(DurableSet::open(dir.join(format!("{kind:?}.json")))),
    );
    registry
}

fn machine_file(dir: &std::path::Path, kind: StateMachineKind) -> BTreeSet<u64> {
    fs::read(dir.join(format!("{kind:?}.json")))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

#[test]
fn duplicate_entry_advances_watermark_without_a_second_effect() {
    let state_dir = tempdir().unwrap();
    let machine_dir = tempdir().unwrap();
    let log = Arc::new(InMemoryLog::new());
    for index in 1..=4 {
        log.append(lock_entry(index, 1, index)).unwrap();
    }
    // Client retry of operation 4, committed again at index 5.
    log.append(lock_entry(5, 1, 4)).unwrap();
    let applier = CommandApplier::new(
        Arc::clone(&log),
        durable_registry(machine_dir.path(), StateMachineKind::LockToken),
        state_dir.path(),
        CoreConfig::default(),
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    applier.register_completion(5, tx);
    applier.notify_committed(5).unwrap();

    let progress = applier.progress();
    assert_eq!(progress.last_applied, 5);
    assert_eq!(progress.duplicates_dropped, 1);
    // The duplicate's completion is dropped, not resolved with a result.
    assert!(rx.try_recv().is_err());

    let snapshot = applier.snapshot().unwrap();
    let applied: BTreeSet<u64> =
        serde_json::from_slice(&snapshot.parts[&StateMachineKind::LockToken]).unwrap();
    assert_eq!(applied, BTreeSet::from([1, 2, 3, 4]));
    assert_eq!(snapshot.sessions.sessions.get(&1), Some(&4));
}

#[test]
fn operations_route_to_their_own_machine() {
    let state_dir = tempdir().unwrap();
    let machine_dir = tempdir().unwrap();
    let log = Arc::new(InMemoryLog::new());
    log.append(tx_entry(1, 1, 1)).unwrap();
    log.append(lock_entry(2, 2, 1)).unwrap();
    log.append(tx_entry(3, 1, 2)).unwrap();
    let mut registry = durable_registry(machine_dir.path(), StateMachineKind::Transaction);
    registry.register(
        StateMachineKind::LockToken,
        Box::new(DurableSet::open(machine_dir.path().join("locks.json"))),
    );
    let applier = CommandApplier::new(
        Arc::clone(&log),
        registry,
        state_dir.path(),
        CoreConfig::default(),
    )
    .unwrap();
    applier.notify_committed(3).unwrap();

    let snapshot = applier.snapshot().unwrap();
    let tx_applied: BTreeSet<u64> =
        serde_json::from_slice(&snapshot.parts[&StateMachineKind::Transaction]).unwrap();
    let lock_applied: BTreeSet<u64> =
        serde_json::from_slice(&snapshot.parts[&StateMachineKind::LockToken]).unwrap();
    assert_eq!(tx_applied, BTreeSet::from([1, 3]));
    assert_eq!(lock_applied, BTreeSet::from([2]));
}

#[test]
fn crash_between_flushes_replays_only_the_unflushed_suffix() {
    let state_dir = tempdir().unwrap();
    let machine_dir = tempdir().unwrap();
    let log = Arc::new(InMemoryLog::new());
    for index in 1..=3 {
        log.append(lock_entry(index, 1, index)).unwrap();
    }
    let config = CoreConfig {
        flush_every: 2,
        ..CoreConfig::default()
    };
    {
        let applier = CommandApplier::new(
            Arc::clone(&log),
            durable_registry(machine_dir.path(), StateMachineKind::LockToken),
            state_dir.path(),
            config.clone(),
        )
        .unwrap();
        applier.notify_committed(3).unwrap();
        assert_eq!(applier.last_applied(), 3);
        assert_eq!(applier.last_flushed(), 2);
    }
    // Entry 3 was applied in memory but never flushed.
    assert_eq!(
        machine_file(machine_dir.path(), StateMachineKind::LockToken),
        BTreeSet::from([1, 2])
    );

    log.append(lock_entry(4, 1, 4)).unwrap();
    let applier = CommandApplier::new(
        Arc::clone(&log),
        durable_registry(machine_dir.path(), StateMachineKind::LockToken),
        state_dir.path(),
        config,
    )
    .unwrap();
    assert_eq!(applier.last_applied(), 2);
    applier.notify_committed(4).unwrap();
    assert_eq!(applier.last_applied(), 4);
    assert_eq!(applier.last_flushed(), 4);
    assert_eq!(
        machine_file(machine_dir.path(), StateMachineKind::LockToken),
        BTreeSet::from([1, 2, 3, 4])
    );
}

#[test]
fn replaying_the_whole_log_over_applied_state_changes_nothing() {
    let machine_dir = tempdir().unwrap();
    let log = Arc::new(InMemoryLog::new());
    for index in 1..=6 {
        log.append(lock_entry(index, (index % 2) + 1, index)).unwrap();
    }
    let config = CoreConfig {
        flush_every: 3,
        ..CoreConfig::default()
    };
    let expected = {
        let state_dir = tempdir().unwrap();
        let applier = CommandApplier::new(
            Arc::clone(&log),
            durable_registry(machine_dir.path(), StateMachineKind::LockToken),
            state_dir.path(),
            config.clone(),
        )
        .unwrap();
        applier.notify_committed(6).unwrap();
        machine_file(machine_dir.path(), StateMachineKind::LockToken)
    };
    assert_eq!(expected, BTreeSet::from([1, 2, 3, 4, 5, 6]));
    // A lost watermark directory forces a full replay over machine state
    // that already absorbed every entry. Index-keyed effects make the
    // second pass a no-op.
    let state_dir = tempdir().unwrap();
    let applier = CommandApplier::new(
        Arc::clone(&log),
        durable_registry(machine_dir.path(), StateMachineKind::LockToken),
        state_dir.path(),
        config,
    )
    .unwrap();
    assert_eq!(applier.last_applied(), 0);
    applier.notify_committed(6).unwrap();
    assert_eq!(applier.last_applied(), 6);
    assert_eq!(
        machine_file(machine_dir.path(), StateMachineKind::LockToken),
        expected
    );
}
