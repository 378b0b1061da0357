//! Master sequence - the ordered list of barcodes a scan session must match
//!
//! Insertion order is the expected scan order. Entries move from `Pending`
//! to `Matched` and never back. `SharedMaster` is the single lock guarding
//! the sequence; every mutation bumps a revision on a watch channel so
//! renderers can redraw from a snapshot.

use crate::domain::types::{clean_data, truncate_chars, RejectReason};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Default maximum stored barcode length in characters
pub const DEFAULT_MAX_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Matched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterEntry {
    pub value: String,
    pub status: EntryStatus,
}

impl MasterEntry {
    fn pending(value: String) -> Self {
        Self { value, status: EntryStatus::Pending }
    }

    pub fn is_matched(&self) -> bool {
        self.status == EntryStatus::Matched
    }
}

/// Result of `MasterSequence::try_append`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendResult {
    Appended { index: usize, value: String },
    Rejected { value: String, reason: RejectReason },
}

impl AppendResult {
    pub fn is_appended(&self) -> bool {
        matches!(self, AppendResult::Appended { .. })
    }
}

/// Summary of a bulk load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub appended: usize,
    pub duplicates: usize,
    pub not_uppercase: usize,
}

/// In-memory ordered master sequence
#[derive(Debug, Clone)]
pub struct MasterSequence {
    entries: Vec<MasterEntry>,
    max_len: usize,
}

impl Default for MasterSequence {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN)
    }
}

impl MasterSequence {
    pub fn new(max_len: usize) -> Self {
        Self { entries: Vec::new(), max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clean and truncate, check case and uniqueness, then append
    ///
    /// Values go through the same cleaning as scanner input so every
    /// stored entry is one a scan can match.
    pub fn try_append(&mut self, raw: &str) -> AppendResult {
        let value = truncate_chars(&clean_data(raw), self.max_len);

        if value.is_empty() {
            return AppendResult::Rejected { value, reason: RejectReason::Empty };
        }
        if value.chars().any(char::is_lowercase) {
            return AppendResult::Rejected { value, reason: RejectReason::NotUppercase };
        }
        if self.entries.iter().any(|e| e.value == value) {
            return AppendResult::Rejected { value, reason: RejectReason::Duplicate };
        }

        self.entries.push(MasterEntry::pending(value.clone()));
        AppendResult::Appended { index: self.entries.len() - 1, value }
    }

    /// Append one barcode per line, skipping lines that clean to nothing
    pub fn load_lines(&mut self, text: &str) -> LoadSummary {
        let mut summary = LoadSummary::default();
        for line in text.lines().map(clean_data).filter(|l| !l.is_empty()) {
            match self.try_append(&line) {
                AppendResult::Appended { .. } => summary.appended += 1,
                AppendResult::Rejected { reason: RejectReason::Duplicate, .. } => {
                    summary.duplicates += 1
                }
                AppendResult::Rejected { .. } => summary.not_uppercase += 1,
            }
        }
        summary
    }

    /// Index of the entry equal to `value`, only if every entry before it is matched
    pub fn find_matchable_index(&self, value: &str) -> Option<usize> {
        let index = self.first_pending_index()?;
        (self.entries[index].value == value).then_some(index)
    }

    /// Index of the leftmost pending entry
    pub fn first_pending_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_matched())
    }

    /// Value of the leftmost pending entry
    pub fn expected(&self) -> Option<&str> {
        self.first_pending_index().map(|i| self.entries[i].value.as_str())
    }

    /// Returns false if the index is out of range
    pub fn mark_matched(&mut self, index: usize) -> bool {
        match self.entries.get_mut(index) {
            Some(entry) => {
                entry.status = EntryStatus::Matched;
                true
            }
            None => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) -> Option<MasterEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Swap an entry with its predecessor
    pub fn move_up(&mut self, index: usize) -> bool {
        if index == 0 || index >= self.entries.len() {
            return false;
        }
        self.entries.swap(index - 1, index);
        true
    }

    /// Swap an entry with its successor
    pub fn move_down(&mut self, index: usize) -> bool {
        if index + 1 >= self.entries.len() {
            return false;
        }
        self.entries.swap(index, index + 1);
        true
    }

    /// True when there is at least one entry and none is pending
    pub fn is_complete(&self) -> bool {
        !self.entries.is_empty() && self.entries.iter().all(MasterEntry::is_matched)
    }

    pub fn entries(&self) -> &[MasterEntry] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<MasterEntry> {
        self.entries.clone()
    }
}

/// Master sequence behind one mutex, shared by the listener and the host
#[derive(Clone)]
pub struct SharedMaster {
    inner: Arc<Mutex<MasterSequence>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for SharedMaster {
    fn default() -> Self {
        Self::new(MasterSequence::default())
    }
}

impl SharedMaster {
    pub fn new(sequence: MasterSequence) -> Self {
        let (revision, _) = watch::channel(0);
        Self { inner: Arc::new(Mutex::new(sequence)), revision: Arc::new(revision) }
    }

    /// Receiver that changes whenever the sequence is mutated
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Run `f` under the lock; the revision is bumped only if `f` reports a change
    pub(crate) fn mutate<T>(&self, f: impl FnOnce(&mut MasterSequence) -> (T, bool)) -> T {
        let (result, changed) = {
            let mut seq = self.inner.lock();
            f(&mut *seq)
        };
        if changed {
            self.revision.send_modify(|r| *r += 1);
        }
        result
    }

    /// Read-only access under the lock
    pub fn read<T>(&self, f: impl FnOnce(&MasterSequence) -> T) -> T {
        f(&*self.inner.lock())
    }

    pub fn try_append(&self, raw: &str) -> AppendResult {
        self.mutate(|seq| {
            let result = seq.try_append(raw);
            let changed = result.is_appended();
            (result, changed)
        })
    }

    pub fn load_lines(&self, text: &str) -> LoadSummary {
        self.mutate(|seq| {
            let summary = seq.load_lines(text);
            (summary, summary.appended > 0)
        })
    }

    pub fn remove_at(&self, index: usize) -> Option<MasterEntry> {
        self.mutate(|seq| {
            let removed = seq.remove_at(index);
            let changed = removed.is_some();
            (removed, changed)
        })
    }

    pub fn clear(&self) {
        self.mutate(|seq| {
            let changed = !seq.is_empty();
            seq.clear();
            ((), changed)
        })
    }

    pub fn move_up(&self, index: usize) -> bool {
        self.mutate(|seq| {
            let moved = seq.move_up(index);
            (moved, moved)
        })
    }

    pub fn move_down(&self, index: usize) -> bool {
        self.mutate(|seq| {
            let moved = seq.move_down(index);
            (moved, moved)
        })
    }

    pub fn snapshot(&self) -> Vec<MasterEntry> {
        self.read(MasterSequence::snapshot)
    }

    pub fn max_len(&self) -> usize {
        self.read(MasterSequence::max_len)
    }

    pub fn len(&self) -> usize {
        self.read(MasterSequence::len)
    }

    pub fn is_empty(&self) -> bool {
        self.read(MasterSequence::is_empty)
    }
}
