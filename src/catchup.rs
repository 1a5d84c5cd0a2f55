use crate::apply::{CommandApplier, FatalApplyError};
use crate::config::CoreConfig;
use crate::log::ReplicatedLog;
use crate::snapshot::{InstallOutcome, Snapshot};
use log::{info, warn};
use std::time::Duration;
use thiserror::Error;

/// Asks an up-to-date peer for its latest snapshot.
pub trait SnapshotSource {
    fn fetch_snapshot(&mut self, timeout: Duration) -> Result<Snapshot, SnapshotRequestError>;
}

/// Transfers the bulk store files that back the snapshot. The snapshot
/// carries the small replicated state; the store copy carries everything
/// else.
pub trait StoreCopyClient {
    fn copy_store(&mut self) -> Result<(), StoreCopyError>;
}

/// Pauses and resumes the surrounding database services while local state
/// is being swapped out underneath them.
pub trait ServiceGate {
    fn pause_service(&mut self);
    fn resume_service(&mut self);
}

#[derive(Debug, Error)]
pub enum SnapshotRequestError {
    #[error("no snapshot received within {0:?}")]
    Timeout(Duration),
    #[error("snapshot source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
#[error("store copy failed: {0}")]
pub struct StoreCopyError(pub String);

#[derive(Debug, Error)]
pub enum CatchUpError {
    #[error(transparent)]
    SnapshotRequest(#[from] SnapshotRequestError),
    #[error(transparent)]
    StoreCopy(#[from] StoreCopyError),
    #[error("snapshot install failed: {0}")]
    Install(#[from] FatalApplyError),
}

/// Drives a full catch-up: gate the services, drain the applier, fetch a
/// peer snapshot, copy the store, install, and bring everything back.
///
/// On failure before the install, the applier stays paused and the gate
/// stays down; the caller retries `run` or backs off. Nothing local has
/// been touched at that point, so retrying is always safe.
pub struct CatchUpOrchestrator<'a, L: ReplicatedLog> {
    applier: &'a CommandApplier<L>,
    snapshot_timeout: Duration,
}

impl<'a, L: ReplicatedLog> CatchUpOrchestrator<'a, L> {
    pub fn new(applier: &'a CommandApplier<L>, config: &CoreConfig) -> Self {
        Self {
            applier,
            snapshot_timeout: config.snapshot_request_timeout,
        }
    }

    pub fn run(
        &self,
        source: &mut dyn SnapshotSource,
        store_copy: &mut dyn StoreCopyClient,
        gate: &mut dyn ServiceGate,
    ) -> Result<InstallOutcome, CatchUpError> {
        gate.pause_service();
        self.applier.pause()?;
        let snapshot = match source.fetch_snapshot(self.snapshot_timeout) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("event=catchup_snapshot_request_failed error={err}");
                return Err(err.into());
            }
        };
        if let Err(err) = store_copy.copy_store() {
            // The fetched snapshot is dropped; the next attempt fetches a
            // fresh one matching whatever store it copies.
            warn!("event=catchup_store_copy_failed error={err}");
            return Err(err.into());
        }
        let outcome = self.applier.install_snapshot(&snapshot)?;
        gate.resume_service();
        match outcome {
            InstallOutcome::Installed { prev_index } => {
                info!("event=catchup_complete prev_index={prev_index}");
            }
            InstallOutcome::Stale {
                prev_index,
                last_applied,
            } => {
                info!(
                    "event=catchup_snapshot_stale prev_index={prev_index} last_applied={last_applied}"
                );
            }
        }
        Ok(outcome)
    }
}
