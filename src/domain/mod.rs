//! Domain models - core scan relay types and the master sequence
//!
//! This module contains the canonical data types used throughout the system:
//! - `MasterSequence` - the ordered list of expected barcodes
//! - `SharedMaster` - the master sequence behind its single lock
//! - `ValidationOutcome` - result of checking one scan
//! - `Notification` - events reported to the host

pub mod master;
pub mod types;

// Re-export commonly used types at module level
pub use master::{AppendResult, EntryStatus, LoadSummary, MasterEntry, MasterSequence, SharedMaster};
pub use types::{clean_data, ChannelRole, Notification, RejectReason, SwitchId, ValidationOutcome};
