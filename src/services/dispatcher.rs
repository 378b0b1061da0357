//! Command dispatcher - turns validation outcomes into relay frames
//!
//! Success pulses the selected switch: `@ON0n$`, hold for the dwell, then
//! `@OFF0n$`. Anything else de-energizes both switches at once. The dwell
//! is spent inside `dispatch`, so a channel handles at most one validated
//! scan per dwell period.

use crate::domain::types::{Notification, SwitchId, ValidationOutcome};
use crate::infra::metrics::Metrics;
use crate::io::notify::NotificationSink;
use crate::io::serial_link::SharedLink;
use crate::services::validation::ValidationState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default time a switch is held on
pub const DEFAULT_DWELL: Duration = Duration::from_millis(2000);

/// Log a failed relay write (cold path)
#[cold]
fn log_relay_write_failed(port: &str, command: &str, e: &dyn std::error::Error) {
    error!(port = %port, command = %command, error = %e, "relay_write_failed");
}

/// Relay frame body without terminator, e.g. `@ON01$`
pub fn relay_command(on: bool, switch: SwitchId) -> String {
    let verb = if on { "ON" } else { "OFF" };
    format!("@{}0{}$", verb, switch.number())
}

/// Relay frame as written to the output link
pub fn relay_frame(on: bool, switch: SwitchId) -> Vec<u8> {
    let mut frame = relay_command(on, switch).into_bytes();
    frame.extend_from_slice(b"\r\n");
    frame
}

/// What `dispatch` did with an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    /// ON, dwell, OFF on the selected switch
    Pulsed,
    /// Success repeating the last accepted scan; nothing written
    Debounced,
    /// Both switches driven OFF
    FailSafe,
    /// No output link attached
    NoOutput,
}

pub struct CommandDispatcher {
    output: Option<SharedLink>,
    dwell: Duration,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
}

impl CommandDispatcher {
    pub fn new(
        output: Option<SharedLink>,
        dwell: Duration,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { output, dwell, sink, metrics }
    }

    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Act on one validation outcome
    ///
    /// A set `cancel` cuts the dwell short; the OFF frame is still written.
    pub async fn dispatch(
        &self,
        outcome: &ValidationOutcome,
        scan: &str,
        state: &mut ValidationState,
        cancel: &mut watch::Receiver<bool>,
    ) -> DispatchAction {
        if !outcome.is_success() {
            return self.fail_safe().await;
        }

        if state.is_repeat(scan) {
            self.metrics.record_debounced();
            debug!(value = %scan, "relay_pulse_debounced");
            return DispatchAction::Debounced;
        }

        let Some(output) = self.output.as_ref() else {
            state.accept(scan);
            return DispatchAction::NoOutput;
        };

        let switch = state.switch();
        let start = Instant::now();

        if !self.send(output, true, switch).await {
            // The switch state is unknown after a failed ON
            self.fail_safe().await;
            return DispatchAction::FailSafe;
        }
        self.metrics.record_pulse(start.elapsed().as_micros() as u64);
        state.accept(scan);

        tokio::select! {
            _ = tokio::time::sleep(self.dwell) => {}
            _ = cancel.wait_for(|stop| *stop) => {
                debug!(switch = %switch, "relay_dwell_interrupted");
            }
        }

        self.send(output, false, switch).await;
        info!(switch = %switch, value = %scan, dwell_ms = %self.dwell.as_millis(), "relay_pulse_complete");
        DispatchAction::Pulsed
    }

    /// Drive both switches OFF immediately
    pub async fn fail_safe(&self) -> DispatchAction {
        let Some(output) = self.output.as_ref() else {
            return DispatchAction::NoOutput;
        };

        self.metrics.record_fail_safe();
        for switch in SwitchId::ALL {
            self.send(output, false, switch).await;
        }
        DispatchAction::FailSafe
    }

    async fn send(&self, output: &SharedLink, on: bool, switch: SwitchId) -> bool {
        send_relay(output, on, switch, &*self.sink, &self.metrics).await
    }
}

/// Write one relay frame and report it
///
/// Returns true if the frame was written.
pub async fn send_relay(
    output: &SharedLink,
    on: bool,
    switch: SwitchId,
    sink: &dyn NotificationSink,
    metrics: &Metrics,
) -> bool {
    let command = relay_command(on, switch);
    match output.write(&relay_frame(on, switch)).await {
        Ok(()) => {
            debug!(port = %output.port(), command = %command, "relay_command_sent");
            sink.notify(Notification::RelayCommand { command });
            true
        }
        Err(e) => {
            log_relay_write_failed(output.port(), &command, &e);
            metrics.record_write_error();
            sink.notify(Notification::LinkError {
                port: output.port().to_string(),
                error: e.to_string(),
            });
            false
        }
    }
}

/// OFF to every switch with `gap` between frames; used on stop
pub async fn fail_safe_with_gap(
    output: &SharedLink,
    gap: Duration,
    sink: &dyn NotificationSink,
    metrics: &Metrics,
) {
    metrics.record_fail_safe();
    for (i, switch) in SwitchId::ALL.into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(gap).await;
        }
        if !send_relay(output, false, switch, sink, metrics).await {
            warn!(port = %output.port(), switch = %switch, "fail_safe_off_not_confirmed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryPort;
    use crate::io::notify::create_notification_channel;
    use crate::io::NullSink;

    fn dispatcher_on(port: &MemoryPort) -> (CommandDispatcher, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let output = SharedLink::new(Box::new(port.connect()));
        let dispatcher =
            CommandDispatcher::new(Some(output), DEFAULT_DWELL, Arc::new(NullSink), metrics.clone());
        (dispatcher, metrics)
    }

    #[test]
    fn test_relay_frames() {
        assert_eq!(relay_frame(true, SwitchId::One), b"@ON01$\r\n".to_vec());
        assert_eq!(relay_frame(false, SwitchId::One), b"@OFF01$\r\n".to_vec());
        assert_eq!(relay_frame(true, SwitchId::Two), b"@ON02$\r\n".to_vec());
        assert_eq!(relay_frame(false, SwitchId::Two), b"@OFF02$\r\n".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_pulses_with_dwell() {
        let port = MemoryPort::new("OUT");
        let (dispatcher, metrics) = dispatcher_on(&port);
        let mut state = ValidationState::new(SwitchId::One);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        let action = dispatcher
            .dispatch(&ValidationOutcome::Success { index: 0 }, "A1", &mut state, &mut cancel)
            .await;

        assert_eq!(action, DispatchAction::Pulsed);
        let writes = port.written_at();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, b"@ON01$\r\n".to_vec());
        assert_eq!(writes[1].1, b"@OFF01$\r\n".to_vec());
        assert!(writes[1].0 - writes[0].0 >= DEFAULT_DWELL);
        assert_eq!(state.last_accepted(), Some("A1"));
        assert_eq!(metrics.pulses_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_two_is_targeted() {
        let port = MemoryPort::new("OUT");
        let (dispatcher, _) = dispatcher_on(&port);
        let mut state = ValidationState::new(SwitchId::Two);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        dispatcher
            .dispatch(&ValidationOutcome::Success { index: 0 }, "A1", &mut state, &mut cancel)
            .await;
        assert_eq!(port.written_text(), vec!["@ON02$\r\n", "@OFF02$\r\n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_success_is_debounced() {
        let port = MemoryPort::new("OUT");
        let (dispatcher, metrics) = dispatcher_on(&port);
        let mut state = ValidationState::new(SwitchId::One);
        state.accept("A1");
        let (_cancel_tx, mut cancel) = watch::channel(false);

        let action = dispatcher
            .dispatch(&ValidationOutcome::Success { index: 0 }, "A1", &mut state, &mut cancel)
            .await;

        assert_eq!(action, DispatchAction::Debounced);
        assert!(port.written().is_empty());
        assert_eq!(metrics.debounced_total(), 1);
    }

    #[tokio::test]
    async fn test_failures_de_energize_both_switches() {
        for outcome in
            [ValidationOutcome::OutOfOrder, ValidationOutcome::NotFound, ValidationOutcome::EmptyMaster]
        {
            let port = MemoryPort::new("OUT");
            let (dispatcher, metrics) = dispatcher_on(&port);
            let mut state = ValidationState::new(SwitchId::One);
            let (_cancel_tx, mut cancel) = watch::channel(false);

            let action = dispatcher.dispatch(&outcome, "Z9", &mut state, &mut cancel).await;

            assert_eq!(action, DispatchAction::FailSafe);
            assert_eq!(port.written_text(), vec!["@OFF01$\r\n", "@OFF02$\r\n"]);
            assert_eq!(metrics.fail_safe_total(), 1);
            assert_eq!(state.last_accepted(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_cuts_dwell_short_but_still_turns_off() {
        let port = MemoryPort::new("OUT");
        let (dispatcher, _) = dispatcher_on(&port);
        let mut state = ValidationState::new(SwitchId::One);
        let (cancel_tx, mut cancel) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = cancel_tx.send(true);
        });

        dispatcher
            .dispatch(&ValidationOutcome::Success { index: 0 }, "A1", &mut state, &mut cancel)
            .await;

        let writes = port.written_at();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].1, b"@OFF01$\r\n".to_vec());
        assert!(writes[1].0 - writes[0].0 < DEFAULT_DWELL);
    }

    #[tokio::test]
    async fn test_failed_on_write_falls_back_to_fail_safe() {
        let port = MemoryPort::new("OUT");
        port.set_fail_writes(true);
        let (dispatcher, metrics) = dispatcher_on(&port);
        let mut state = ValidationState::new(SwitchId::One);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        let action = dispatcher
            .dispatch(&ValidationOutcome::Success { index: 0 }, "A1", &mut state, &mut cancel)
            .await;

        assert_eq!(action, DispatchAction::FailSafe);
        assert_eq!(state.last_accepted(), None);
        assert_eq!(metrics.write_errors_total(), 3);
    }

    #[tokio::test]
    async fn test_without_output_nothing_is_written() {
        let dispatcher =
            CommandDispatcher::new(None, DEFAULT_DWELL, Arc::new(NullSink), Arc::new(Metrics::new()));
        let mut state = ValidationState::new(SwitchId::One);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        let action = dispatcher
            .dispatch(&ValidationOutcome::Success { index: 0 }, "A1", &mut state, &mut cancel)
            .await;
        assert_eq!(action, DispatchAction::NoOutput);
        assert_eq!(state.last_accepted(), Some("A1"));
        assert_eq!(dispatcher.fail_safe().await, DispatchAction::NoOutput);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_safe_with_gap_spaces_frames() {
        let port = MemoryPort::new("OUT");
        let output = SharedLink::new(Box::new(port.connect()));
        let (tx, mut rx) = create_notification_channel(8);
        let metrics = Metrics::new();

        fail_safe_with_gap(&output, Duration::from_millis(100), &tx, &metrics).await;

        let writes = port.written_at();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, b"@OFF01$\r\n".to_vec());
        assert_eq!(writes[1].1, b"@OFF02$\r\n".to_vec());
        assert!(writes[1].0 - writes[0].0 >= Duration::from_millis(100));

        assert_eq!(
            rx.recv().await,
            Some(Notification::RelayCommand { command: "@OFF01$".to_string() })
        );
    }
}
