//! Listener loop - polls every input channel and routes each scan
//!
//! One cycle reads at most one line per channel, ingest channels first,
//! then sleeps for the poll interval. A read error anywhere in the cycle
//! stretches that sleep to the error backoff. Cancellation is checked at
//! the top of every cycle and interrupts the sleep.

use crate::domain::master::{AppendResult, SharedMaster};
use crate::domain::types::{clean_data, truncate_chars, ChannelRole, Notification, RejectReason, SwitchId};
use crate::infra::metrics::Metrics;
use crate::io::notify::NotificationSink;
use crate::io::printer::PrinterRelay;
use crate::io::serial_link::{LinkError, SerialLink};
use crate::services::dispatcher::{CommandDispatcher, DispatchAction};
use crate::services::validation::{ValidationEngine, ValidationState};
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Log a failed read (cold path)
#[cold]
fn log_read_error(port: &str, e: &LinkError) {
    warn!(port = %port, error = %e, "input_read_error");
}

/// One open input link and what its scans are for
pub struct InputChannel {
    link: Box<dyn SerialLink>,
    role: ChannelRole,
    /// Debounce state; present on validate channels only
    validation: Option<ValidationState>,
}

impl InputChannel {
    pub fn ingest(link: Box<dyn SerialLink>) -> Self {
        Self { link, role: ChannelRole::Ingest, validation: None }
    }

    pub fn validate(link: Box<dyn SerialLink>, switch: SwitchId) -> Self {
        Self { link, role: ChannelRole::Validate, validation: Some(ValidationState::new(switch)) }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn port(&self) -> &str {
        self.link.port()
    }

    pub async fn close(&mut self) {
        self.link.close().await;
    }
}

pub type Channels = SmallVec<[InputChannel; 2]>;

/// Links handed back when the loop exits, for the controller to close
pub struct ListenerParts {
    pub inputs: Channels,
    pub printer: PrinterRelay,
}

#[derive(Debug, Clone, Copy)]
pub struct ListenerTiming {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for ListenerTiming {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(50), error_backoff: Duration::from_millis(1000) }
    }
}

/// Everything a scan is routed through once it has been read
struct ScanRouter {
    master: SharedMaster,
    engine: ValidationEngine,
    dispatcher: CommandDispatcher,
    printer: PrinterRelay,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
}

impl ScanRouter {
    async fn ingest(&mut self, port: &str, value: &str) {
        match self.master.try_append(value) {
            AppendResult::Appended { index, value } => {
                self.metrics.record_ingested();
                info!(port = %port, value = %value, index = %index, "master_entry_ingested");
                self.sink.notify(Notification::Ingested {
                    port: port.to_string(),
                    value: value.clone(),
                    index,
                });

                if self.printer.is_attached() && !self.printer.forward(&value).await {
                    self.metrics.record_printer_error();
                }
            }
            AppendResult::Rejected { value, reason } => {
                match reason {
                    RejectReason::Duplicate => self.metrics.record_rejected_duplicate(),
                    RejectReason::NotUppercase => self.metrics.record_rejected_case(),
                    RejectReason::Empty => {}
                }
                info!(port = %port, value = %value, reason = ?reason, "master_entry_rejected");
                self.sink.notify(Notification::IngestRejected { port: port.to_string(), value, reason });
            }
        }
    }

    async fn validate(
        &mut self,
        port: &str,
        value: &str,
        state: &mut ValidationState,
        cancel: &mut watch::Receiver<bool>,
    ) {
        let verdict = self.engine.validate(&self.master, value);
        self.metrics.record_outcome(&verdict.outcome);

        if verdict.outcome.is_success() {
            info!(port = %port, value = %value, outcome = %verdict.outcome.as_str(), "scan_validated");
        } else {
            warn!(
                port = %port,
                value = %value,
                outcome = %verdict.outcome.as_str(),
                expected = ?verdict.expected,
                "scan_rejected"
            );
        }

        let action = self.dispatcher.dispatch(&verdict.outcome, value, state, cancel).await;

        self.sink.notify(Notification::Scan {
            port: port.to_string(),
            value: value.to_string(),
            outcome: verdict.outcome,
            expected: verdict.expected,
            debounced: action == DispatchAction::Debounced,
        });

        if verdict.completed {
            info!("master_sequence_complete");
            self.sink.notify(Notification::SequenceComplete);
        }
    }
}

pub struct ListenerLoop {
    channels: Channels,
    router: ScanRouter,
    timing: ListenerTiming,
}

impl ListenerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut channels: Channels,
        master: SharedMaster,
        engine: ValidationEngine,
        dispatcher: CommandDispatcher,
        printer: PrinterRelay,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
        timing: ListenerTiming,
    ) -> Self {
        // Stable: channels of one role keep their configured order
        channels.sort_by_key(|c| match c.role {
            ChannelRole::Ingest => 0,
            ChannelRole::Validate => 1,
        });

        Self {
            channels,
            router: ScanRouter { master, engine, dispatcher, printer, sink, metrics },
            timing,
        }
    }

    /// Poll until `cancel` is set or its sender is dropped
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> ListenerParts {
        info!(
            channels = %self.channels.len(),
            poll_interval_ms = %self.timing.poll_interval.as_millis(),
            printer = %self.router.printer.is_attached(),
            output = %self.router.dispatcher.has_output(),
            "listener_started"
        );

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            let had_error = self.poll_once(&mut cancel).await;

            let pause = if had_error { self.timing.error_backoff } else { self.timing.poll_interval };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = cancel.wait_for(|stop| *stop) => {}
            }
        }

        info!("listener_stopped");
        ListenerParts { inputs: self.channels, printer: self.router.printer }
    }

    /// One pass over every channel
    /// Returns true if any read failed
    async fn poll_once(&mut self, cancel: &mut watch::Receiver<bool>) -> bool {
        let mut had_error = false;

        for channel in self.channels.iter_mut() {
            let line = match channel.link.try_read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(e) => {
                    log_read_error(channel.link.port(), &e);
                    self.router.metrics.record_read_error();
                    self.router.sink.notify(Notification::LinkError {
                        port: channel.link.port().to_string(),
                        error: e.to_string(),
                    });
                    had_error = true;
                    continue;
                }
            };

            self.router.metrics.record_scan();
            let cleaned = clean_data(&line);
            if cleaned.is_empty() {
                debug!(port = %channel.link.port(), raw = %line.escape_debug(), "empty_scan_skipped");
                continue;
            }

            let port = channel.link.port();
            match (channel.role, channel.validation.as_mut()) {
                (ChannelRole::Ingest, _) => self.router.ingest(port, &cleaned).await,
                (ChannelRole::Validate, Some(state)) => {
                    let value = truncate_chars(&cleaned, self.router.master.max_len());
                    self.router.validate(port, &value, state, cancel).await;
                }
                (ChannelRole::Validate, None) => {
                    warn!(port = %port, "validate_channel_without_state");
                }
            }
        }

        had_error
    }
}

/// Cancelled, or the controller holding the sender is gone
fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}
