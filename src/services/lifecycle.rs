//! Lifecycle controller - starts and stops the listener
//!
//! `start` opens every configured link, spawns the listener and moves the
//! state to `Running`. `stop` cancels the listener, waits a bounded time
//! for it to exit, drives every switch OFF and only then closes the links.
//! Both are safe to call in any state.

use crate::domain::master::SharedMaster;
use crate::domain::types::{ChannelRole, Notification, SwitchId};
use crate::infra::config::{is_standard_baud, Config};
use crate::infra::metrics::Metrics;
use crate::io::notify::NotificationSink;
use crate::io::printer::PrinterRelay;
use crate::io::serial_link::{LinkFactory, OpenError, SharedLink};
use crate::services::dispatcher::{fail_safe_with_gap, CommandDispatcher};
use crate::services::listener::{Channels, InputChannel, ListenerLoop, ListenerParts, ListenerTiming};
use crate::services::validation::ValidationEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pause between the OFF frames written on stop
pub const FAIL_SAFE_GAP: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("listener is already running")]
    AlreadyRunning,
    #[error("no input port configured or none could be opened")]
    NoInputConfigured,
    #[error("baud rate {baud} on {port} is not a standard rate")]
    InvalidBaud { port: String, baud: u32 },
    #[error("switch must be 1 or 2, got {0}")]
    InvalidSwitch(u8),
    #[error("output port failed to open: {0}")]
    Output(#[source] OpenError),
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("listener did not exit within {timeout_ms} ms and was aborted")]
    JoinTimeout { timeout_ms: u64 },
    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Running,
    Stopping,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Stopped => "stopped",
            ListenerState::Running => "running",
            ListenerState::Stopping => "stopping",
        }
    }
}

struct Session {
    id: Uuid,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<ListenerParts>,
    output: Option<SharedLink>,
}

pub struct LifecycleController {
    config: Config,
    factory: Arc<dyn LinkFactory>,
    master: SharedMaster,
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<Metrics>,
    state: watch::Sender<ListenerState>,
    session: Option<Session>,
}

impl LifecycleController {
    pub fn new(
        config: Config,
        factory: Arc<dyn LinkFactory>,
        master: SharedMaster,
        sink: Arc<dyn NotificationSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Stopped);
        Self { config, factory, master, sink, metrics, state, session: None }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn master(&self) -> &SharedMaster {
        &self.master
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Replace the configuration used by the next `start`
    pub fn set_config(&mut self, config: Config) {
        self.config = config;
    }

    /// Open links and spawn the listener
    pub async fn start(&mut self) -> Result<Uuid, StartError> {
        if self.session.is_some() {
            return Err(StartError::AlreadyRunning);
        }

        let switch =
            self.config.switch_id().ok_or(StartError::InvalidSwitch(self.config.switch()))?;

        let inputs: Vec<(ChannelRole, &str, u32)> = [
            (ChannelRole::Ingest, self.config.ingest_port(), self.config.ingest_baud()),
            (ChannelRole::Validate, self.config.validate_port(), self.config.validate_baud()),
        ]
        .into_iter()
        .filter(|(_, port, _)| !port.is_empty())
        .collect();

        if inputs.is_empty() {
            return Err(StartError::NoInputConfigured);
        }

        let output_port = self.config.output_port();
        let printer_port = self.config.printer_port();
        let links = inputs
            .iter()
            .map(|(_, port, baud)| (*port, *baud))
            .chain([(output_port, self.config.output_baud())])
            .chain([(printer_port, self.config.printer_baud())])
            .filter(|(port, _)| !port.is_empty());
        for (port, baud) in links {
            if !is_standard_baud(baud) {
                return Err(StartError::InvalidBaud { port: port.to_string(), baud });
            }
        }

        // The output is opened first so a failure leaves nothing to close
        let output = if output_port.is_empty() {
            warn!("output_port_not_configured");
            None
        } else {
            match self.factory.open(output_port, self.config.output_baud()) {
                Ok(link) => Some(SharedLink::new(link)),
                Err(e) => {
                    error!(port = %output_port, error = %e, "output_open_failed");
                    return Err(StartError::Output(e));
                }
            }
        };

        let mut channels = Channels::new();
        for (role, port, baud) in &inputs {
            match self.factory.open(port, *baud) {
                Ok(link) => channels.push(match role {
                    ChannelRole::Ingest => InputChannel::ingest(link),
                    ChannelRole::Validate => InputChannel::validate(link, switch),
                }),
                Err(e) => self.disable_channel(port, role.as_str(), &e),
            }
        }

        if channels.is_empty() {
            if let Some(output) = output.as_ref() {
                output.close().await;
            }
            return Err(StartError::NoInputConfigured);
        }

        let printer = if printer_port.is_empty() {
            PrinterRelay::default()
        } else {
            match self.factory.open(printer_port, self.config.printer_baud()) {
                Ok(link) => PrinterRelay::new(Some(link)),
                Err(e) => {
                    self.disable_channel(printer_port, "printer", &e);
                    PrinterRelay::default()
                }
            }
        };

        let opened: Vec<String> = channels.iter().map(|c| c.port().to_string()).collect();

        let dispatcher = CommandDispatcher::new(
            output.clone(),
            Duration::from_millis(self.config.dwell_ms()),
            self.sink.clone(),
            self.metrics.clone(),
        );
        let listener = ListenerLoop::new(
            channels,
            self.master.clone(),
            ValidationEngine::new(self.config.remove_matched()),
            dispatcher,
            printer,
            self.sink.clone(),
            self.metrics.clone(),
            ListenerTiming {
                poll_interval: Duration::from_millis(self.config.poll_interval_ms()),
                error_backoff: Duration::from_millis(self.config.error_backoff_ms()),
            },
        );

        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(listener.run(cancel_rx));

        let id = Uuid::now_v7();
        self.session = Some(Session { id, cancel, handle, output });
        self.state.send_replace(ListenerState::Running);

        info!(session = %id, inputs = ?opened, switch = %switch, "lifecycle_started");
        self.sink.notify(Notification::Started { session: id.to_string(), inputs: opened });

        Ok(id)
    }

    /// Cancel the listener, fail-safe the output and close every link
    ///
    /// Calling this while stopped does nothing and writes nothing. If the
    /// listener misses the join timeout it is aborted and shutdown still
    /// completes; the error reports that it had to be forced.
    pub async fn stop(&mut self) -> Result<(), StopError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        self.state.send_replace(ListenerState::Stopping);
        info!(session = %session.id, "lifecycle_stopping");

        let _ = session.cancel.send(true);

        let timeout_ms = self.config.stop_timeout_ms();
        let mut result = Ok(());
        let parts = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            &mut session.handle,
        )
        .await
        {
            Ok(Ok(parts)) => Some(parts),
            Ok(Err(e)) => {
                error!(session = %session.id, error = %e, "listener_task_failed");
                result = Err(StopError::Join(e));
                None
            }
            Err(_) => {
                error!(session = %session.id, timeout_ms = %timeout_ms, "listener_join_timeout");
                session.handle.abort();
                // The task must be gone before the fail-safe writes
                let _ = (&mut session.handle).await;
                result = Err(StopError::JoinTimeout { timeout_ms });
                None
            }
        };

        if let Some(output) = session.output.as_ref() {
            fail_safe_with_gap(output, FAIL_SAFE_GAP, &*self.sink, &self.metrics).await;
        }

        if let Some(mut parts) = parts {
            for input in parts.inputs.iter_mut() {
                input.close().await;
            }
            parts.printer.close().await;
        }
        if let Some(output) = session.output.as_ref() {
            output.close().await;
        }

        self.state.send_replace(ListenerState::Stopped);
        info!(session = %session.id, "lifecycle_stopped");
        self.sink.notify(Notification::Stopped { session: session.id.to_string() });

        result
    }

    fn disable_channel(&self, port: &str, channel: &str, e: &OpenError) {
        warn!(port = %port, channel = %channel, error = %e, "channel_disabled");
        self.sink.notify(Notification::ChannelDisabled {
            port: port.to_string(),
            channel: channel.to_string(),
            reason: e.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryFactory;
    use crate::io::notify::create_notification_channel;
    use crate::io::serial_link::{LinkError, SerialLink};
    use crate::io::NullSink;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Input whose reads never complete
    struct StuckLink {
        port: String,
    }

    #[async_trait]
    impl SerialLink for StuckLink {
        fn port(&self) -> &str {
            &self.port
        }

        async fn try_read_line(&mut self) -> Result<Option<String>, LinkError> {
            std::future::pending().await
        }

        async fn write(&mut self, _bytes: &[u8]) -> Result<(), LinkError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Memory ports, except `STUCK` which never yields a line
    struct StuckFactory(MemoryFactory);

    impl LinkFactory for StuckFactory {
        fn open(&self, port: &str, baud: u32) -> Result<Box<dyn SerialLink>, OpenError> {
            if port == "STUCK" {
                return Ok(Box::new(StuckLink { port: port.to_string() }));
            }
            self.0.open(port, baud)
        }
    }

    fn controller(config: Config, factory: &MemoryFactory) -> LifecycleController {
        LifecycleController::new(
            config,
            Arc::new(factory.clone()),
            SharedMaster::default(),
            Arc::new(NullSink),
            Arc::new(Metrics::new()),
        )
    }

    fn full_config() -> Config {
        Config::default()
            .with_ingest("ING", 9600)
            .with_validate("VAL", 9600)
            .with_output("OUT", 9600)
    }

    fn full_factory() -> MemoryFactory {
        let factory = MemoryFactory::new();
        for name in ["ING", "VAL", "OUT"] {
            factory.add_port(name);
        }
        factory
    }

    fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_a_no_op() {
        let factory = full_factory();
        let mut lifecycle = controller(full_config(), &factory);

        assert!(lifecycle.stop().await.is_ok());
        assert!(lifecycle.stop().await.is_ok());
        assert_eq!(lifecycle.state(), ListenerState::Stopped);
        assert!(factory.port("OUT").unwrap().written().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_inputs_fails() {
        let factory = full_factory();
        let mut lifecycle = controller(Config::default().with_output("OUT", 9600), &factory);

        assert!(matches!(lifecycle.start().await, Err(StartError::NoInputConfigured)));
        assert_eq!(lifecycle.state(), ListenerState::Stopped);
        assert!(!factory.port("OUT").unwrap().is_open());
    }

    #[tokio::test]
    async fn test_start_fails_when_no_input_opens() {
        let factory = MemoryFactory::new();
        let output = factory.add_port("OUT");
        let (tx, mut rx) = create_notification_channel(16);
        let mut lifecycle = LifecycleController::new(
            full_config(),
            Arc::new(factory.clone()),
            SharedMaster::default(),
            Arc::new(tx),
            Arc::new(Metrics::new()),
        );

        assert!(matches!(lifecycle.start().await, Err(StartError::NoInputConfigured)));
        assert!(!output.is_open());

        let disabled = drain(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, Notification::ChannelDisabled { .. }))
            .count();
        assert_eq!(disabled, 2);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_settings() {
        let factory = full_factory();

        let mut bad_switch = controller(full_config().with_switch(3), &factory);
        assert!(matches!(bad_switch.start().await, Err(StartError::InvalidSwitch(3))));

        let mut bad_baud = controller(full_config().with_validate("VAL", 1234), &factory);
        assert!(matches!(
            bad_baud.start().await,
            Err(StartError::InvalidBaud { baud: 1234, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_output_fails_start() {
        let factory = MemoryFactory::new();
        let ingest = factory.add_port("ING");
        factory.add_port("VAL");
        let mut lifecycle = controller(full_config(), &factory);

        assert!(matches!(lifecycle.start().await, Err(StartError::Output(OpenError::NotFound { .. }))));
        assert!(!ingest.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_rejected() {
        let factory = full_factory();
        let mut lifecycle = controller(full_config(), &factory);

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), ListenerState::Running);
        assert!(matches!(lifecycle.start().await, Err(StartError::AlreadyRunning)));

        lifecycle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_fail_safes_then_closes_links() {
        let factory = full_factory();
        let mut lifecycle = controller(full_config(), &factory);
        let mut states = lifecycle.subscribe_state();

        lifecycle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        lifecycle.stop().await.unwrap();

        let output = factory.port("OUT").unwrap();
        let writes = output.written_at();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].1, b"@OFF01$\r\n".to_vec());
        assert_eq!(writes[1].1, b"@OFF02$\r\n".to_vec());
        assert!(writes[1].0 - writes[0].0 >= FAIL_SAFE_GAP);

        for name in ["ING", "VAL", "OUT"] {
            assert!(!factory.port(name).unwrap().is_open(), "{} left open", name);
        }
        assert_eq!(*states.borrow_and_update(), ListenerState::Stopped);
        assert!(lifecycle.session_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_opens_fresh_links() {
        let factory = full_factory();
        let mut lifecycle = controller(full_config(), &factory);

        let first = lifecycle.start().await.unwrap();
        lifecycle.stop().await.unwrap();
        let second = lifecycle.start().await.unwrap();
        lifecycle.stop().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(factory.port("VAL").unwrap().opened_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_printer_is_tolerated() {
        let factory = full_factory();
        let (tx, mut rx) = create_notification_channel(16);
        let mut lifecycle = LifecycleController::new(
            full_config().with_printer("PRN", 9600),
            Arc::new(factory.clone()),
            SharedMaster::default(),
            Arc::new(tx),
            Arc::new(Metrics::new()),
        );

        lifecycle.start().await.unwrap();
        let events = drain(&mut rx);
        assert!(events.iter().any(|n| matches!(
            n,
            Notification::ChannelDisabled { channel, .. } if channel == "printer"
        )));
        assert!(matches!(events.last(), Some(Notification::Started { .. })));

        lifecycle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_input_is_enough() {
        let factory = full_factory();
        let mut lifecycle =
            controller(Config::default().with_validate("VAL", 9600).with_output("OUT", 9600), &factory);

        lifecycle.start().await.unwrap();
        assert!(!factory.port("ING").unwrap().is_open());
        assert!(factory.port("VAL").unwrap().is_open());
        lifecycle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_listener_is_aborted_and_shutdown_completes() {
        let factory = MemoryFactory::new();
        let output = factory.add_port("OUT");
        let (tx, mut rx) = create_notification_channel(16);
        let mut lifecycle = LifecycleController::new(
            Config::default()
                .with_validate("STUCK", 9600)
                .with_output("OUT", 9600)
                .with_stop_timeout_ms(300),
            Arc::new(StuckFactory(factory)),
            SharedMaster::default(),
            Arc::new(tx),
            Arc::new(Metrics::new()),
        );

        lifecycle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = lifecycle.stop().await;
        assert!(matches!(result, Err(StopError::JoinTimeout { timeout_ms: 300 })));
        assert_eq!(output.written_text(), vec!["@OFF01$\r\n", "@OFF02$\r\n"]);
        assert!(!output.is_open());
        assert_eq!(lifecycle.state(), ListenerState::Stopped);
        assert!(!lifecycle.is_running());
        assert!(matches!(drain(&mut rx).last(), Some(Notification::Stopped { .. })));
    }

    #[test]
    fn test_stop_error_message() {
        let err = StopError::JoinTimeout { timeout_ms: 1500 };
        assert_eq!(err.to_string(), "listener did not exit within 1500 ms and was aborted");
    }
}
