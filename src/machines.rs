use crate::command::{
    CommandOutcome, CommandPayload, CompletionSender, DistributedOperation, StateMachineKind,
};
use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use thiserror::Error;

/// Capability surface of one replicated state machine. The business logic
/// behind `apply_command` is opaque to this layer; the contract is that
/// applying the same command at the same index twice leaves the machine in
/// the same state.
pub trait StateMachine: Send {
    fn apply_command(&mut self, payload: &CommandPayload, index: u64) -> Vec<u8>;

    /// End-of-batch signal: internal buffering must become visible to
    /// readers before the next batch opens. Visibility, not durability.
    fn ensure_visible(&mut self);

    /// Persist internal state to stable storage.
    fn flush(&mut self) -> Result<(), MachineError>;

    fn snapshot(&self) -> Result<Vec<u8>, MachineError>;

    fn install_snapshot(&mut self, part: &[u8]) -> Result<(), MachineError>;
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot part rejected: {0}")]
    InvalidPart(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no state machine registered for {kind:?} (index {index})")]
    UnregisteredKind {
        kind: StateMachineKind,
        index: u64,
    },
}

/// Fan-out of decoded operations to the registered state machines.
///
/// Batch exclusivity is carried by the borrow: `begin_batch` hands out a
/// `BatchDispatcher` that mutably borrows the registry, so `flush`,
/// `snapshot_parts` and `install_parts` cannot be reached while a batch is
/// open, and only one batch can exist at a time.
pub struct StateMachineRegistry {
    machines: BTreeMap<StateMachineKind, Box<dyn StateMachine>>,
}

impl StateMachineRegistry {
    pub fn new() -> Self {
        Self {
            machines: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, kind: StateMachineKind, machine: Box<dyn StateMachine>) {
        self.machines.insert(kind, machine);
    }

    pub fn is_registered(&self, kind: StateMachineKind) -> bool {
        self.machines.contains_key(&kind)
    }

    pub fn begin_batch(&mut self) -> BatchDispatcher<'_> {
        BatchDispatcher {
            registry: self,
            touched: BTreeSet::new(),
        }
    }

    /// Asks every machine to persist its internal state; returns once all
    /// have done so.
    pub fn flush(&mut self) -> Result<(), MachineError> {
        for machine in self.machines.values_mut() {
            machine.flush()?;
        }
        Ok(())
    }

    pub fn snapshot_parts(&self) -> Result<BTreeMap<StateMachineKind, Vec<u8>>, MachineError> {
        let mut parts = BTreeMap::new();
        for (kind, machine) in &self.machines {
            parts.insert(*kind, machine.snapshot()?);
        }
        Ok(parts)
    }

    /// Replaces the state of every registered machine from `parts`.
    /// Each registered machine must have a part and each part a machine.
    pub fn install_parts(
        &mut self,
        parts: &BTreeMap<StateMachineKind, Vec<u8>>,
    ) -> Result<(), MachineError> {
        for kind in parts.keys() {
            if !self.machines.contains_key(kind) {
                return Err(MachineError::InvalidPart(format!(
                    "part for unregistered machine {kind:?}"
                )));
            }
        }
        for (kind, machine) in self.machines.iter_mut() {
            let part = parts.get(kind).ok_or_else(|| {
                MachineError::InvalidPart(format!("missing part for {kind:?}"))
            })?;
            machine.install_snapshot(part)?;
        }
        Ok(())
    }
}

impl Default for StateMachineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One open apply batch. The applier is the sole caller.
pub struct BatchDispatcher<'a> {
    registry: &'a mut StateMachineRegistry,
    touched: BTreeSet<StateMachineKind>,
}

impl BatchDispatcher<'_> {
    pub fn dispatch(
        &mut self,
        operation: &DistributedOperation,
        index: u64,
        completion: Option<CompletionSender>,
    ) -> Result<(), DispatchError> {
        let kind = operation.content.kind();
        let machine = self
            .registry
            .machines
            .get_mut(&kind)
            .ok_or(DispatchError::UnregisteredKind { kind, index })?;
        let response = machine.apply_command(&operation.content, index);
        self.touched.insert(kind);
        if let Some(sender) = completion {
            let outcome = CommandOutcome {
                index,
                kind,
                response,
            };
            if sender.send(outcome).is_err() {
                debug!("event=completion_receiver_gone index={index}");
            }
        }
        Ok(())
    }

    /// Ends the batch: every machine that participated is told to make its
    /// buffered effects visible.
    pub fn finish(self) {
        for kind in &self.touched {
            if let Some(machine) = self.registry.machines.get_mut(kind) {
                machine.ensure_visible();
            }
        }
    }
}
