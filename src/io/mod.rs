//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `serial_link` - line-oriented serial links (tokio-serial)
//! - `memory` - in-process links for tests and dry runs
//! - `printer` - STX/ETX framing for the label printer
//! - `notify` - notification sinks towards the host
//! - `event_log` - notifications to file (JSONL format)

pub mod event_log;
pub mod memory;
pub mod notify;
pub mod printer;
pub mod serial_link;

// Re-export commonly used types
pub use event_log::EventLog;
pub use memory::{MemoryFactory, MemoryLink, MemoryPort};
pub use notify::{create_notification_channel, NotificationSink, NullSink};
pub use printer::PrinterRelay;
pub use serial_link::{
    list_ports, LineBuffer, LinkError, LinkFactory, OpenError, SerialLink, SerialPortFactory,
    SharedLink, TokioSerialLink,
};
