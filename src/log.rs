use crate::command::LogEntry;
use std::collections::VecDeque;
use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Read interface onto the consensus log. Owned by the consensus layer;
/// the applier only holds a shared handle and never outlives it.
pub trait ReplicatedLog: Send + Sync {
    /// Index of the last appended entry (0 when empty).
    fn append_index(&self) -> u64;

    /// Logical lower bound: entries at or below this index have been
    /// pruned or skipped away.
    fn prev_index(&self) -> u64;

    fn entry_term(&self, index: u64) -> Result<u64, LogError>;

    /// Forward cursor starting at `from_index`.
    fn cursor_from(&self, from_index: u64) -> Result<Box<dyn EntryCursor>, LogError>;

    /// Discards entries at or below `upto_index`.
    fn prune(&self, upto_index: u64) -> Result<(), LogError>;

    /// Forgets everything below `index` and treats `(index, term)` as the
    /// new logical start. Callers must never move the log backward.
    fn skip(&self, index: u64, term: u64) -> Result<(), LogError>;
}

pub trait EntryCursor: Send {
    fn next_entry(&mut self) -> Result<Option<LogEntry>, LogError>;
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("index {0} is outside the log's range")]
    OutOfRange(u64),
    #[error("expected next index {expected}, attempted {attempted}")]
    NonSequentialAppend { expected: u64, attempted: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// In-memory log used by tests and by embedders that keep the durable log
/// elsewhere.
pub struct InMemoryLog {
    inner: Mutex<LogInner>,
}

struct LogInner {
    entries: VecDeque<LogEntry>,
    prev_index: u64,
    prev_term: u64,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogInner {
                entries: VecDeque::new(),
                prev_index: 0,
                prev_term: 0,
            }),
        }
    }

    pub fn append(&self, entry: LogEntry) -> Result<(), LogError> {
        let mut inner = lock_inner(&self.inner);
        let expected = inner
            .entries
            .back()
            .map(|last| last.index + 1)
            .unwrap_or(inner.prev_index + 1);
        if entry.index != expected {
            return Err(LogError::NonSequentialAppend {
                expected,
                attempted: entry.index,
            });
        }
        inner.entries.push_back(entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock_inner(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock_inner(&self.inner).entries.is_empty()
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicatedLog for InMemoryLog {
    fn append_index(&self) -> u64 {
        let inner = lock_inner(&self.inner);
        inner
            .entries
            .back()
            .map(|entry| entry.index)
            .unwrap_or(inner.prev_index)
    }

    fn prev_index(&self) -> u64 {
        lock_inner(&self.inner).prev_index
    }

    fn entry_term(&self, index: u64) -> Result<u64, LogError> {
        let inner = lock_inner(&self.inner);
        if index == inner.prev_index {
            return Ok(inner.prev_term);
        }
        inner
            .entries
            .iter()
            .find(|entry| entry.index == index)
            .map(|entry| entry.term)
            .ok_or(LogError::OutOfRange(index))
    }

    fn cursor_from(&self, from_index: u64) -> Result<Box<dyn EntryCursor>, LogError> {
        let inner = lock_inner(&self.inner);
        if from_index <= inner.prev_index {
            return Err(LogError::OutOfRange(from_index));
        }
        let entries: VecDeque<LogEntry> = inner
            .entries
            .iter()
            .filter(|entry| entry.index >= from_index)
            .cloned()
            .collect();
        Ok(Box::new(VecCursor { entries }))
    }

    fn prune(&self, upto_index: u64) -> Result<(), LogError> {
        let mut inner = lock_inner(&self.inner);
        if upto_index <= inner.prev_index {
            return Ok(());
        }
        let term = inner
            .entries
            .iter()
            .find(|entry| entry.index == upto_index)
            .map(|entry| entry.term);
        inner.entries.retain(|entry| entry.index > upto_index);
        inner.prev_index = upto_index;
        if let Some(term) = term {
            inner.prev_term = term;
        }
        Ok(())
    }

    fn skip(&self, index: u64, term: u64) -> Result<(), LogError> {
        let mut inner = lock_inner(&self.inner);
        if index <= inner.prev_index {
            return Ok(());
        }
        inner.entries.retain(|entry| entry.index > index);
        inner.prev_index = index;
        inner.prev_term = term;
        Ok(())
    }
}

struct VecCursor {
    entries: VecDeque<LogEntry>,
}

impl EntryCursor for VecCursor {
    fn next_entry(&mut self) -> Result<Option<LogEntry>, LogError> {
        Ok(self.entries.pop_front())
    }
}

fn lock_inner(inner: &Mutex<LogInner>) -> MutexGuard<'_, LogInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bounded tail cache of recently appended entries, probed before opening
/// a durable cursor. Holds a contiguous index window; a non-contiguous put
/// resets the window.
#[derive(Debug)]
pub struct EntryCache {
    capacity: usize,
    entries: VecDeque<LogEntry>,
}

impl EntryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn put(&mut self, entry: LogEntry) {
        if let Some(last) = self.entries.back() {
            if entry.index != last.index + 1 {
                self.entries.clear();
            }
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        let first = self.entries.front()?.index;
        if index < first {
            return None;
        }
        self.entries.get((index - first) as usize)
    }

    pub fn prune_below(&mut self, index: u64) {
        while let Some(front) = self.entries.front() {
            if front.index < index {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
