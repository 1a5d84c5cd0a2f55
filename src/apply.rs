use crate::command::{CompletionSender, LogEntry, Operation};
use crate::config::{ConfigError, CoreConfig};
use crate::log::{EntryCache, EntryCursor, LogError, ReplicatedLog};
use crate::machines::{DispatchError, MachineError, StateMachineRegistry};
use crate::session::{SessionTracker, SessionTrackerState};
use crate::snapshot::{InstallOutcome, Snapshot};
use crate::storage::{DurableState, DurableStateStore, StateStoreError};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use thiserror::Error;

/// Durable applied watermark. Its ordinal is the watermark itself, so the
/// dual-file store's recovery picks the newest flush automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedIndexState {
    pub applied: u64,
}

impl DurableState for AppliedIndexState {
    fn ordinal(&self) -> u64 {
        self.applied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierMode {
    /// No apply job running; commit notifications start one inline.
    Idle,
    /// An apply job is draining the committed backlog.
    Applying,
    /// Paused for snapshot capture, install or catch-up; commit
    /// notifications are recorded but not acted on.
    AwaitingSnapshot,
}

/// Watermarks and counters, read in one consistent cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyProgress {
    pub last_applied: u64,
    pub last_flushed: u64,
    pub last_seen_commit: u64,
    pub duplicates_dropped: u64,
    pub flushes: u64,
}

/// Errors that park the applier. Once parked, every entry point returns
/// `Parked` until the process restarts and recovery re-establishes a
/// trustworthy state.
#[derive(Debug, Error)]
pub enum FatalApplyError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("durable state store failure: {0}")]
    StateStore(#[from] StateStoreError),
    #[error("log failure: {0}")]
    Log(#[from] LogError),
    #[error("committed entry {index} is missing from both cache and log")]
    MissingEntry { index: u64 },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("state machine failure: {0}")]
    Machine(#[from] MachineError),
    #[error("applier is parked after a prior fatal failure")]
    Parked,
}

/// Drives committed log entries through the state machine registry, in
/// order and exactly once per entry, and owns the durable watermarks.
///
/// Two locks, always taken core before scheduler. The scheduler lock is
/// held only for mode transitions and watermark reads; the core lock is
/// held for the duration of an apply batch.
pub struct CommandApplier<L: ReplicatedLog> {
    log: Arc<L>,
    flush_every: u64,
    scheduler: Mutex<SchedulerState>,
    drained: Condvar,
    core: Mutex<ApplierCore>,
}

struct SchedulerState {
    mode: ApplierMode,
    last_seen_commit: u64,
    /// Shadow of the core's applied watermark, kept so scheduling
    /// decisions never need the core lock.
    applied: u64,
    pause_requested: bool,
    parked: bool,
}

struct ApplierCore {
    registry: StateMachineRegistry,
    tracker: SessionTracker,
    tracker_store: DurableStateStore<SessionTrackerState>,
    applied_store: DurableStateStore<AppliedIndexState>,
    cache: EntryCache,
    completions: HashMap<u64, CompletionSender>,
    last_applied: u64,
    last_flushed: u64,
    since_flush: u64,
    duplicates_dropped: u64,
    flushes: u64,
}

impl<L: ReplicatedLog> CommandApplier<L> {
    /// Opens the durable stores under `state_dir` and restores the applied
    /// watermark and session tracker from the newest flushed records. The
    /// registry must already hold every machine that committed entries can
    /// route to.
    pub fn new(
        log: Arc<L>,
        registry: StateMachineRegistry,
        state_dir: impl AsRef<Path>,
        config: CoreConfig,
    ) -> Result<Self, FatalApplyError> {
        config.validate()?;
        let state_dir = state_dir.as_ref();
        let tracker_store: DurableStateStore<SessionTrackerState> =
            DurableStateStore::open(state_dir, "session-tracker", config.rotation_bound)?;
        let applied_store: DurableStateStore<AppliedIndexState> =
            DurableStateStore::open(state_dir, "applied-index", config.rotation_bound)?;
        let tracker =
            SessionTracker::from_state(tracker_store.initial_state().cloned().unwrap_or_default());
        let applied = applied_store
            .initial_state()
            .map(|state| state.applied)
            .unwrap_or(0);
        info!(
            "event=applier_recovered last_applied={} tracker_ordinal={}",
            applied,
            tracker.state().ordinal
        );
        Ok(Self {
            log,
            flush_every: config.flush_every,
            scheduler: Mutex::new(SchedulerState {
                mode: ApplierMode::Idle,
                last_seen_commit: applied,
                applied,
                pause_requested: false,
                parked: false,
            }),
            drained: Condvar::new(),
            core: Mutex::new(ApplierCore {
                registry,
                tracker,
                tracker_store,
                applied_store,
                cache: EntryCache::new(config.cache_capacity),
                completions: HashMap::new(),
                last_applied: applied,
                last_flushed: applied,
                since_flush: 0,
                duplicates_dropped: 0,
                flushes: 0,
            }),
        })
    }

    /// Raises the commit watermark. When the applier is idle the backlog is
    /// drained before this returns; when a job is already running or the
    /// applier is paused, the raised watermark is picked up later.
    pub fn notify_committed(&self, commit_index: u64) -> Result<(), FatalApplyError> {
        let should_run = {
            let mut sched = self.lock_scheduler();
            if sched.parked {
                return Err(FatalApplyError::Parked);
            }
            if commit_index <= sched.last_seen_commit {
                return Ok(());
            }
            sched.last_seen_commit = commit_index;
            if sched.mode == ApplierMode::Idle && !sched.pause_requested {
                sched.mode = ApplierMode::Applying;
                true
            } else {
                false
            }
        };
        if should_run {
            self.run_apply_job()
        } else {
            Ok(())
        }
    }

    /// Offers a freshly appended entry to the tail cache so the apply path
    /// can skip the durable log for it.
    pub fn cache_entry(&self, entry: LogEntry) {
        let mut core = self.lock_core();
        if entry.index > core.last_applied {
            core.cache.put(entry);
        }
    }

    /// Registers a channel to resolve once the entry at `index` has been
    /// applied. Late registrations for already-applied entries are dropped;
    /// the caller observes the dropped sender and falls back to a read.
    pub fn register_completion(&self, index: u64, sender: CompletionSender) {
        let mut core = self.lock_core();
        if index <= core.last_applied {
            debug!("event=completion_registered_late index={index}");
            return;
        }
        core.completions.insert(index, sender);
    }

    /// Stops applying and waits for any in-flight job to drain. On return
    /// the applier is in `AwaitingSnapshot` and the applied prefix is a
    /// consistent cut.
    pub fn pause(&self) -> Result<(), FatalApplyError> {
        let mut sched = self.lock_scheduler();
        if sched.parked {
            return Err(FatalApplyError::Parked);
        }
        sched.pause_requested = true;
        while sched.mode == ApplierMode::Applying {
            sched = self.wait_drained(sched);
            if sched.parked {
                return Err(FatalApplyError::Parked);
            }
        }
        sched.mode = ApplierMode::AwaitingSnapshot;
        Ok(())
    }

    /// Leaves the paused state. Commits that arrived while paused are
    /// applied before this returns.
    pub fn resume(&self) -> Result<(), FatalApplyError> {
        let should_run = {
            let mut sched = self.lock_scheduler();
            if sched.parked {
                return Err(FatalApplyError::Parked);
            }
            sched.pause_requested = false;
            if sched.mode == ApplierMode::AwaitingSnapshot {
                if sched.last_seen_commit > sched.applied {
                    sched.mode = ApplierMode::Applying;
                    true
                } else {
                    sched.mode = ApplierMode::Idle;
                    false
                }
            } else {
                false
            }
        };
        if should_run {
            self.run_apply_job()
        } else {
            Ok(())
        }
    }

    /// Captures a consistent snapshot of every machine plus the session
    /// tracker at the current applied watermark. The applier is drained for
    /// the duration and resumed afterwards.
    pub fn snapshot(&self) -> Result<Snapshot, FatalApplyError> {
        self.pause()?;
        match self.capture_locked() {
            Ok(snapshot) => {
                self.resume()?;
                Ok(snapshot)
            }
            Err(err) => {
                self.park("snapshot_capture", &err);
                Err(err)
            }
        }
    }

    /// Replaces all local state from `snapshot` if it is ahead of the
    /// applied watermark. A stale snapshot leaves everything untouched and
    /// reports `Stale`.
    pub fn install_snapshot(&self, snapshot: &Snapshot) -> Result<InstallOutcome, FatalApplyError> {
        self.pause()?;
        match self.install_locked(snapshot) {
            Ok(outcome) => {
                self.resume()?;
                Ok(outcome)
            }
            Err(err) => {
                self.park("snapshot_install", &err);
                Err(err)
            }
        }
    }

    /// Prunes the log and the tail cache up to the flushed watermark. Never
    /// prunes beyond it: entries above `last_flushed` are still needed for
    /// replay after a crash.
    pub fn compact(&self) -> Result<(), FatalApplyError> {
        let mut core = self.lock_core();
        let upto = core.last_flushed;
        if upto > self.log.prev_index() {
            self.log.prune(upto)?;
            info!("event=log_compacted upto={upto}");
        }
        core.cache.prune_below(upto + 1);
        Ok(())
    }

    pub fn mode(&self) -> ApplierMode {
        self.lock_scheduler().mode
    }

    pub fn last_applied(&self) -> u64 {
        self.lock_core().last_applied
    }

    pub fn last_flushed(&self) -> u64 {
        self.lock_core().last_flushed
    }

    pub fn progress(&self) -> ApplyProgress {
        let core = self.lock_core();
        let sched = self.lock_scheduler();
        ApplyProgress {
            last_applied: core.last_applied,
            last_flushed: core.last_flushed,
            last_seen_commit: sched.last_seen_commit,
            duplicates_dropped: core.duplicates_dropped,
            flushes: core.flushes,
        }
    }

    fn run_apply_job(&self) -> Result<(), FatalApplyError> {
        loop {
            let result = self.apply_loop();
            let mut sched = self.lock_scheduler();
            match result {
                Ok(applied) => {
                    sched.applied = applied;
                    if sched.pause_requested {
                        sched.mode = ApplierMode::AwaitingSnapshot;
                    } else if sched.last_seen_commit > sched.applied {
                        // A notification landed after the loop's last
                        // target read and saw us still in Applying; the
                        // commit is ours to drain, so stay in the job.
                        drop(sched);
                        continue;
                    } else {
                        sched.mode = ApplierMode::Idle;
                    }
                    drop(sched);
                    self.drained.notify_all();
                    return Ok(());
                }
                Err(err) => {
                    error!("event=apply_job_fatal error={err}");
                    sched.parked = true;
                    sched.mode = ApplierMode::Idle;
                    drop(sched);
                    self.drained.notify_all();
                    return Err(err);
                }
            }
        }
    }

    /// Drains the committed backlog, re-reading the target after each pass
    /// so commits raised during a batch are not missed.
    fn apply_loop(&self) -> Result<u64, FatalApplyError> {
        let mut core = self.lock_core();
        loop {
            let target = {
                let sched = self.lock_scheduler();
                if sched.pause_requested {
                    return Ok(core.last_applied);
                }
                sched.last_seen_commit
            };
            if core.last_applied >= target {
                return Ok(core.last_applied);
            }
            let stopped = self.apply_up_to(&mut core, target)?;
            if stopped {
                return Ok(core.last_applied);
            }
        }
    }

    /// Applies entries `(last_applied, target]` in flush-bounded batches.
    /// Returns true when a pause request interrupted the range.
    fn apply_up_to(&self, core: &mut ApplierCore, target: u64) -> Result<bool, FatalApplyError> {
        let mut cursor: Option<Box<dyn EntryCursor>> = None;
        while core.last_applied < target {
            if core.since_flush >= self.flush_every {
                self.flush_state(core)?;
            }
            let batch_end = target.min(core.last_applied + (self.flush_every - core.since_flush));
            let stopped = {
                let ApplierCore {
                    registry,
                    tracker,
                    cache,
                    completions,
                    last_applied,
                    since_flush,
                    duplicates_dropped,
                    ..
                } = &mut *core;
                let mut batch = registry.begin_batch();
                let mut stopped = false;
                while *last_applied < batch_end {
                    if self.pause_requested() {
                        stopped = true;
                        break;
                    }
                    let next = *last_applied + 1;
                    let entry = self.fetch_entry(cache, &mut cursor, next)?;
                    match &entry.payload {
                        Operation::Distributed(operation) => {
                            if tracker.validate(operation.session_id, operation.operation_id) {
                                let completion = completions.remove(&entry.index);
                                batch.dispatch(operation, entry.index, completion)?;
                                tracker.update(
                                    operation.session_id,
                                    operation.operation_id,
                                    entry.index,
                                );
                            } else {
                                completions.remove(&entry.index);
                                *duplicates_dropped += 1;
                                debug!(
                                    "event=duplicate_dropped session={} operation={} index={}",
                                    operation.session_id, operation.operation_id, entry.index
                                );
                            }
                        }
                        Operation::LeaderBarrier => {}
                    }
                    *last_applied = entry.index;
                    *since_flush += 1;
                }
                batch.finish();
                stopped
            };
            if core.since_flush >= self.flush_every {
                self.flush_state(core)?;
            }
            if stopped {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Serves `index` from the tail cache when possible, otherwise walks a
    /// durable cursor. A cache hit invalidates the cursor so a later miss
    /// reopens it at the right position.
    fn fetch_entry(
        &self,
        cache: &EntryCache,
        cursor: &mut Option<Box<dyn EntryCursor>>,
        index: u64,
    ) -> Result<LogEntry, FatalApplyError> {
        if let Some(entry) = cache.get(index) {
            *cursor = None;
            return Ok(entry.clone());
        }
        if cursor.is_none() {
            let opened = self.log.cursor_from(index).map_err(|err| match err {
                LogError::OutOfRange(_) => FatalApplyError::MissingEntry { index },
                other => FatalApplyError::Log(other),
            })?;
            *cursor = Some(opened);
        }
        let Some(active) = cursor.as_mut() else {
            return Err(FatalApplyError::MissingEntry { index });
        };
        match active.next_entry()? {
            Some(entry) if entry.index == index => Ok(entry),
            _ => Err(FatalApplyError::MissingEntry { index }),
        }
    }

    /// Durability point. Machines flush before the tracker, the tracker
    /// before the applied watermark, so a crash between steps can only
    /// under-report progress; replay then re-applies a suffix the machines
    /// absorb idempotently.
    fn flush_state(&self, core: &mut ApplierCore) -> Result<(), FatalApplyError> {
        core.registry.flush()?;
        let ApplierCore {
            tracker,
            tracker_store,
            ..
        } = &mut *core;
        tracker_store.persist(tracker.state())?;
        core.applied_store.persist(&AppliedIndexState {
            applied: core.last_applied,
        })?;
        core.last_flushed = core.last_applied;
        core.since_flush = 0;
        core.flushes += 1;
        debug!("event=apply_flush last_flushed={}", core.last_flushed);
        Ok(())
    }

    fn capture_locked(&self) -> Result<Snapshot, FatalApplyError> {
        let core = self.lock_core();
        let prev_index = core.last_applied;
        let prev_term = if prev_index == 0 {
            0
        } else {
            self.log.entry_term(prev_index)?
        };
        let parts = core.registry.snapshot_parts()?;
        info!("event=snapshot_captured prev_index={prev_index} prev_term={prev_term}");
        Ok(Snapshot {
            prev_index,
            prev_term,
            parts,
            sessions: core.tracker.state().clone(),
        })
    }

    fn install_locked(&self, snapshot: &Snapshot) -> Result<InstallOutcome, FatalApplyError> {
        let mut core = self.lock_core();
        if !snapshot.supersedes(core.last_applied) {
            debug!(
                "event=snapshot_install_stale prev_index={} last_applied={}",
                snapshot.prev_index, core.last_applied
            );
            return Ok(InstallOutcome::Stale {
                prev_index: snapshot.prev_index,
                last_applied: core.last_applied,
            });
        }
        core.registry.install_parts(&snapshot.parts)?;
        // Machines must be durable at prev_index before the watermarks
        // claim it; a crash after the persist below may never replay
        // entries at or below prev_index.
        core.registry.flush()?;
        core.tracker
            .install(snapshot.sessions.clone(), snapshot.prev_index);
        {
            let ApplierCore {
                tracker,
                tracker_store,
                applied_store,
                ..
            } = &mut *core;
            tracker_store.persist(tracker.state())?;
            applied_store.persist(&AppliedIndexState {
                applied: snapshot.prev_index,
            })?;
        }
        core.last_applied = snapshot.prev_index;
        core.last_flushed = snapshot.prev_index;
        core.since_flush = 0;
        core.cache.prune_below(snapshot.prev_index + 1);
        core.completions
            .retain(|&index, _| index > snapshot.prev_index);
        if snapshot.prev_index > self.log.prev_index() {
            self.log.skip(snapshot.prev_index, snapshot.prev_term)?;
        }
        {
            let mut sched = self.lock_scheduler();
            sched.applied = snapshot.prev_index;
            if sched.last_seen_commit < snapshot.prev_index {
                sched.last_seen_commit = snapshot.prev_index;
            }
        }
        info!(
            "event=snapshot_installed prev_index={} prev_term={}",
            snapshot.prev_index, snapshot.prev_term
        );
        Ok(InstallOutcome::Installed {
            prev_index: snapshot.prev_index,
        })
    }

    fn park(&self, site: &str, err: &FatalApplyError) {
        error!("event=applier_parked site={site} error={err}");
        let mut sched = self.lock_scheduler();
        sched.parked = true;
        sched.mode = ApplierMode::Idle;
        drop(sched);
        self.drained.notify_all();
    }

    fn pause_requested(&self) -> bool {
        self.lock_scheduler().pause_requested
    }

    fn lock_core(&self) -> MutexGuard<'_, ApplierCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("event=applier_core_poisoned; recovering state");
                poisoned.into_inner()
            }
        }
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, SchedulerState> {
        match self.scheduler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("event=applier_scheduler_poisoned; recovering state");
                poisoned.into_inner()
            }
        }
    }

    fn wait_drained<'a>(
        &self,
        guard: MutexGuard<'a, SchedulerState>,
    ) -> MutexGuard<'a, SchedulerState> {
        match self.drained.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("event=applier_scheduler_poisoned; recovering state");
                poisoned.into_inner()
            }
        }
    }
}
