//! Scan relay - sequential barcode validation host
//!
//! Reads scans from serial inputs, checks them against the master sequence
//! and pulses a relay controller on success.
//!
//! Module structure:
//! - `domain/` - Master sequence, outcomes, notifications
//! - `io/` - Serial links, printer framing, event log
//! - `services/` - Validation, dispatcher, listener, lifecycle
//! - `infra/` - Config, Metrics

use anyhow::Context;
use clap::Parser;
use scan_relay::domain::{AppendResult, MasterSequence, SharedMaster};
use scan_relay::infra::{Config, Metrics};
use scan_relay::io::{
    create_notification_channel, list_ports, EventLog, LinkFactory, MemoryFactory, NotificationSink,
    SerialPortFactory,
};
use scan_relay::services::operator::{render_master, HELP};
use scan_relay::services::{LifecycleController, OperatorCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Scan relay - validates barcode scans in sequence and drives relays
#[derive(Parser, Debug)]
#[command(name = "scan-relay", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Load the master sequence from a file, one barcode per line
    #[arg(short, long)]
    master: Option<String>,

    /// Start listening immediately
    #[arg(long)]
    start: bool,

    /// Use in-process ports instead of serial hardware
    #[arg(long)]
    dry_run: bool,

    /// Print available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

/// Port names used by `--dry-run` when the config leaves a port empty
const DRY_RUN_PORTS: [&str; 3] = ["SIM-INGEST", "SIM-VALIDATE", "SIM-OUTPUT"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    let args = Args::parse();

    if args.list_ports {
        let ports = list_ports().context("Failed to enumerate serial ports")?;
        if ports.is_empty() {
            println!("no serial ports found");
        }
        for port in ports {
            println!("{}", port);
        }
        return Ok(());
    }

    info!(git_hash = %env!("GIT_HASH"), "scan-relay starting");

    let config_path = match args.config.as_deref() {
        Some(path) => path.to_string(),
        None => Config::resolve_config_path(),
    };
    let mut config = Config::load_from_path(&config_path);

    let dry_run = args.dry_run.then(MemoryFactory::new);
    if let Some(factory) = dry_run.as_ref() {
        config = with_dry_run_ports(config, factory);
    }

    info!(
        config_file = %config.config_file(),
        ingest = %config.ingest_port(),
        validate = %config.validate_port(),
        output = %config.output_port(),
        printer = %config.printer_port(),
        switch = %config.switch(),
        dwell_ms = %config.dwell_ms(),
        remove_matched = %config.remove_matched(),
        dry_run = %dry_run.is_some(),
        "config_loaded"
    );

    let master = SharedMaster::new(MasterSequence::new(config.max_len()));
    if let Some(path) = args.master.as_deref() {
        load_master_file(&master, path)?;
    }

    let metrics = Arc::new(Metrics::new());

    // Notification consumer: log and append to the event log
    let (notify_tx, mut notify_rx) = create_notification_channel(1000);
    let event_log = EventLog::from_config(config.event_log_file());
    tokio::spawn(async move {
        while let Some(notification) = notify_rx.recv().await {
            tracing::debug!(event = %notification.name(), "notification");
            if let Some(log) = event_log.as_ref() {
                log.write(&notification);
            }
        }
    });

    // Master renderer: redraw from a snapshot on every change
    let mut revisions = master.subscribe();
    let watched = master.clone();
    tokio::spawn(async move {
        while revisions.changed().await.is_ok() {
            let snapshot = watched.snapshot();
            let matched = snapshot.iter().filter(|e| e.is_matched()).count();
            info!(entries = %snapshot.len(), matched = %matched, "master_changed");
        }
    });

    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        let reporter = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            loop {
                interval.tick().await;
                reporter.report().log();
            }
        });
    }

    let factory: Arc<dyn LinkFactory> = match dry_run.as_ref() {
        Some(memory) => Arc::new(memory.clone()),
        None => Arc::new(SerialPortFactory::new(Duration::from_millis(config.read_timeout_ms()))),
    };
    let sink: Arc<dyn NotificationSink> = Arc::new(notify_tx);
    let mut lifecycle =
        LifecycleController::new(config, factory, master.clone(), sink, metrics.clone());

    if args.start {
        if let Err(e) = lifecycle.start().await {
            warn!(error = %e, "autostart_failed");
        }
    }

    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let keep_going =
                        handle_line(&line, &mut lifecycle, &metrics, dry_run.as_ref()).await;
                    if !keep_going {
                        break;
                    }
                }
                Ok(None) => {
                    // Detached from a terminal: keep running until Ctrl+C
                    info!("console_closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "console_read_failed");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                break;
            }
        }
    }

    if let Err(e) = lifecycle.stop().await {
        warn!(error = %e, "stop_forced");
    }
    metrics.report().log();

    info!("scan-relay shutdown complete");
    Ok(())
}

/// Fill empty ports with in-process ones and register every port
fn with_dry_run_ports(config: Config, factory: &MemoryFactory) -> Config {
    let pick = |configured: &str, fallback: &str| {
        if configured.is_empty() { fallback.to_string() } else { configured.to_string() }
    };
    let ingest = pick(config.ingest_port(), DRY_RUN_PORTS[0]);
    let validate = pick(config.validate_port(), DRY_RUN_PORTS[1]);
    let output = pick(config.output_port(), DRY_RUN_PORTS[2]);

    for port in [ingest.as_str(), validate.as_str(), output.as_str(), config.printer_port()] {
        if !port.is_empty() {
            factory.add_port(port);
        }
    }

    let (ingest_baud, validate_baud, output_baud) =
        (config.ingest_baud(), config.validate_baud(), config.output_baud());
    config
        .with_ingest(&ingest, ingest_baud)
        .with_validate(&validate, validate_baud)
        .with_output(&output, output_baud)
}

fn load_master_file(master: &SharedMaster, path: &str) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read master file {}", path))?;
    let summary = master.load_lines(&text);
    info!(
        file = %path,
        appended = %summary.appended,
        duplicates = %summary.duplicates,
        not_uppercase = %summary.not_uppercase,
        "master_loaded"
    );
    Ok(())
}

/// Run one console line; returns false on quit
async fn handle_line(
    line: &str,
    lifecycle: &mut LifecycleController,
    metrics: &Metrics,
    dry_run: Option<&MemoryFactory>,
) -> bool {
    let command = match OperatorCommand::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return true,
        Err(message) => {
            println!("{}", message);
            return true;
        }
    };

    let master = lifecycle.master().clone();
    match command {
        OperatorCommand::Help => println!("{}", HELP),
        OperatorCommand::List => println!("{}", render_master(&master.snapshot())),
        OperatorCommand::Add(code) => match master.try_append(&code) {
            AppendResult::Appended { index, value } => println!("added {} at {}", value, index + 1),
            AppendResult::Rejected { value, reason } => {
                println!("rejected {}: {:?}", value, reason)
            }
        },
        OperatorCommand::Load(path) => {
            if let Err(e) = load_master_file(&master, &path) {
                println!("{:#}", e);
            }
        }
        OperatorCommand::Remove(index) => match master.remove_at(index) {
            Some(entry) => println!("removed {}", entry.value),
            None => println!("no entry {}", index + 1),
        },
        OperatorCommand::Up(index) => {
            if !master.move_up(index) {
                println!("cannot move entry {} up", index + 1);
            }
        }
        OperatorCommand::Down(index) => {
            if !master.move_down(index) {
                println!("cannot move entry {} down", index + 1);
            }
        }
        OperatorCommand::Clear => master.clear(),
        OperatorCommand::Start => match lifecycle.start().await {
            Ok(session) => println!("listening (session {})", session),
            Err(e) => println!("start failed: {}", e),
        },
        OperatorCommand::Stop => match lifecycle.stop().await {
            Ok(()) => println!("stopped"),
            Err(e) => println!("stopped with error: {}", e),
        },
        OperatorCommand::Status => {
            println!(
                "state={} entries={} scans={} success={} pulses={} fail_safe={}",
                lifecycle.state().as_str(),
                master.len(),
                metrics.scans_total(),
                metrics.success_total(),
                metrics.pulses_total(),
                metrics.fail_safe_total(),
            );
        }
        OperatorCommand::Switch(switch) => {
            let config = lifecycle.config().clone().with_switch(switch.number());
            lifecycle.set_config(config);
            println!("switch {} selected for the next start", switch);
        }
        OperatorCommand::Save(path) => {
            let config = lifecycle.config();
            let Some(path) = path.or_else(|| {
                // "default" means nothing was loaded from disk
                (config.config_file() != "default").then(|| config.config_file().to_string())
            }) else {
                println!("no config file loaded, use `save <path>`");
                return true;
            };
            match config.save(&path) {
                Ok(()) => println!("saved {}", path),
                Err(e) => println!("{:#}", e),
            }
        }
        OperatorCommand::Scan { port, value } => match dry_run.and_then(|f| f.port(&port)) {
            Some(memory_port) => memory_port.push_line(&value),
            None => println!("scan needs --dry-run and a known port"),
        },
        OperatorCommand::Quit => return false,
    }
    true
}
