//! Services - scan handling and listener lifecycle
//!
//! This module contains the core logic:
//! - `validation` - Strict left-to-right matching against the master sequence
//! - `dispatcher` - Relay pulse and fail-safe commands on the output link
//! - `listener` - Polling loop routing scans to ingestion or validation
//! - `lifecycle` - Start/stop state machine owning every serial link
//! - `operator` - Console commands for editing the master sequence

pub mod dispatcher;
pub mod lifecycle;
pub mod listener;
pub mod operator;
pub mod validation;

// Re-export commonly used types
pub use dispatcher::{CommandDispatcher, DispatchAction};
pub use lifecycle::{LifecycleController, ListenerState, StartError, StopError};
pub use listener::{InputChannel, ListenerLoop, ListenerParts, ListenerTiming};
pub use operator::OperatorCommand;
pub use validation::{ScanVerdict, ValidationEngine, ValidationState};
