//! Shared types for the scan relay

use serde::{Deserialize, Serialize};

/// Frame start byte some scanners prepend to a barcode
pub const STX: char = '\u{02}';
/// Frame end byte some scanners append to a barcode
pub const ETX: char = '\u{03}';

/// Relay output on the I/O controller targeted by a pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SwitchId {
    One,
    Two,
}

impl SwitchId {
    pub const ALL: [SwitchId; 2] = [SwitchId::One, SwitchId::Two];

    pub fn number(self) -> u8 {
        match self {
            SwitchId::One => 1,
            SwitchId::Two => 2,
        }
    }
}

impl TryFrom<u8> for SwitchId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SwitchId::One),
            2 => Ok(SwitchId::Two),
            other => Err(format!("switch must be 1 or 2, got {}", other)),
        }
    }
}

impl From<SwitchId> for u8 {
    fn from(switch: SwitchId) -> u8 {
        switch.number()
    }
}

impl std::fmt::Display for SwitchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// What an input channel is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    /// Scans populate the master sequence
    Ingest,
    /// Scans are checked against the master sequence
    Validate,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Ingest => "ingest",
            ChannelRole::Validate => "validate",
        }
    }
}

/// Result of validating one scan against the master sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationOutcome {
    Success { index: usize },
    OutOfOrder,
    NotFound,
    EmptyMaster,
}

impl ValidationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ValidationOutcome::Success { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationOutcome::Success { .. } => "success",
            ValidationOutcome::OutOfOrder => "out_of_order",
            ValidationOutcome::NotFound => "not_found",
            ValidationOutcome::EmptyMaster => "empty_master",
        }
    }
}

/// Why an ingestion scan was not appended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Duplicate,
    NotUppercase,
    Empty,
}

/// Events reported to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    Started { session: String, inputs: Vec<String> },
    Stopped { session: String },
    /// A link failed to open at start and its feature is off for this session
    ChannelDisabled { port: String, channel: String, reason: String },
    Ingested { port: String, value: String, index: usize },
    IngestRejected { port: String, value: String, reason: RejectReason },
    Scan {
        port: String,
        value: String,
        outcome: ValidationOutcome,
        /// Leftmost pending entry when the scan did not match
        expected: Option<String>,
        /// Pulse suppressed because the scan repeated the last accepted value
        debounced: bool,
    },
    SequenceComplete,
    RelayCommand { command: String },
    LinkError { port: String, error: String },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Started { .. } => "started",
            Notification::Stopped { .. } => "stopped",
            Notification::ChannelDisabled { .. } => "channel_disabled",
            Notification::Ingested { .. } => "ingested",
            Notification::IngestRejected { .. } => "ingest_rejected",
            Notification::Scan { .. } => "scan",
            Notification::SequenceComplete => "sequence_complete",
            Notification::RelayCommand { .. } => "relay_command",
            Notification::LinkError { .. } => "link_error",
        }
    }
}

/// Strip scanner framing and keep only alphanumeric characters
///
/// A leading STX and a trailing ETX are removed first, then every
/// remaining character that is not alphanumeric is dropped.
pub fn clean_data(raw: &str) -> String {
    let trimmed = raw.strip_prefix(STX).unwrap_or(raw);
    let trimmed = trimmed.strip_suffix(ETX).unwrap_or(trimmed);
    trimmed.chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Keep at most `max_len` characters
pub fn truncate_chars(value: &str, max_len: usize) -> String {
    value.chars().take(max_len).collect()
}
