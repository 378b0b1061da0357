//! Scan validation against the master sequence
//!
//! Matching is strictly left to right: a scan succeeds only against the
//! leftmost pending entry. A scan equal to a later pending entry is
//! `OutOfOrder`, never an early match.

use crate::domain::master::{MasterEntry, SharedMaster};
use crate::domain::types::{SwitchId, ValidationOutcome};

/// Per validation channel state, mutated only by the listener
#[derive(Debug, Clone)]
pub struct ValidationState {
    last_accepted: Option<String>,
    switch: SwitchId,
}

impl ValidationState {
    pub fn new(switch: SwitchId) -> Self {
        Self { last_accepted: None, switch }
    }

    pub fn switch(&self) -> SwitchId {
        self.switch
    }

    pub fn last_accepted(&self) -> Option<&str> {
        self.last_accepted.as_deref()
    }

    /// True if `scan` repeats the last value that triggered a pulse
    pub fn is_repeat(&self, scan: &str) -> bool {
        self.last_accepted.as_deref() == Some(scan)
    }

    pub fn accept(&mut self, scan: &str) {
        self.last_accepted = Some(scan.to_string());
    }
}

/// Outcome of one scan plus what the host needs to report it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanVerdict {
    pub outcome: ValidationOutcome,
    /// Leftmost pending value, reported on failures
    pub expected: Option<String>,
    /// The scan matched the last pending entry
    pub completed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationEngine {
    remove_matched: bool,
}

impl ValidationEngine {
    pub fn new(remove_matched: bool) -> Self {
        Self { remove_matched }
    }

    /// Classify a scan against an ordered snapshot
    pub fn classify(entries: &[MasterEntry], scan: &str) -> ValidationOutcome {
        if entries.is_empty() {
            return ValidationOutcome::EmptyMaster;
        }

        let mut pending_before = false;
        let mut seen_matched = false;

        for (index, entry) in entries.iter().enumerate() {
            if entry.value == scan {
                if entry.is_matched() {
                    seen_matched = true;
                } else if pending_before {
                    return ValidationOutcome::OutOfOrder;
                } else {
                    return ValidationOutcome::Success { index };
                }
            }
            if !entry.is_matched() {
                pending_before = true;
            }
        }

        // present but already consumed: still not an acceptable scan
        if seen_matched {
            ValidationOutcome::OutOfOrder
        } else {
            ValidationOutcome::NotFound
        }
    }

    /// Classify and, on success, consume the matched entry under one lock
    pub fn validate(&self, master: &SharedMaster, scan: &str) -> ScanVerdict {
        let remove_matched = self.remove_matched;

        master.mutate(|seq| {
            let outcome = Self::classify(seq.entries(), scan);
            match outcome {
                ValidationOutcome::Success { index } => {
                    let completed = if remove_matched {
                        seq.remove_at(index);
                        seq.is_empty()
                    } else {
                        seq.mark_matched(index);
                        seq.is_complete()
                    };
                    (ScanVerdict { outcome, expected: None, completed }, true)
                }
                _ => {
                    let expected = seq.expected().map(str::to_string);
                    (ScanVerdict { outcome, expected, completed: false }, false)
                }
            }
        })
    }
}
