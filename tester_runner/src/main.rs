use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tester_watch::capture::{CaptureSource, ImageSequenceSource};
use tester_watch::hardware::SimulatedHardware;
use tester_watch::monitor::{LedgerFeed, LedgerUpdate, StageLedger};
use tester_watch::{InMemoryBus, RigConfig, RigSession};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(feature = "camera")]
mod camera;

/// Frame spacing assumed for recorded sequences when no rate is given.
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "tester-runner", version, about = "Watches a tester rig's screen and drives its indicators")]
struct Cli {
    /// JSON rig configuration. Flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rig id used in every topic.
    #[arg(long)]
    id: Option<String>,

    /// Rig type, selecting the built-in detector profile.
    #[arg(long = "type")]
    rig_type: Option<usize>,

    #[arg(long)]
    site: Option<String>,

    #[arg(long)]
    location: Option<String>,

    /// Seconds between status reports.
    #[arg(long)]
    status_period: Option<u64>,

    #[arg(long)]
    namespace: Option<String>,

    /// Directory of recorded frames to replay.
    #[arg(long)]
    source: Option<PathBuf>,

    /// Camera device index to capture from instead of a recording.
    #[cfg(feature = "camera")]
    #[arg(long)]
    camera: Option<i32>,

    /// Replay rate for recorded frames.
    #[arg(long)]
    fps: Option<f64>,

    /// Do not start a new cycle after a reset.
    #[arg(long, default_value_t = false)]
    no_restart: bool,

    /// Exit once the capture source is exhausted.
    #[arg(long, default_value_t = false)]
    exit_at_end: bool,
}

impl Cli {
    fn rig_config(&self) -> anyhow::Result<RigConfig> {
        let mut config = match &self.config {
            Some(path) => RigConfig::load(path)?,
            None => RigConfig::default(),
        };
        if let Some(id) = &self.id {
            config.rig_id = id.clone();
        }
        if let Some(rig_type) = self.rig_type {
            config.rig_type = rig_type;
        }
        if let Some(site) = &self.site {
            config.site = site.clone();
        }
        if let Some(location) = &self.location {
            config.location = location.clone();
        }
        if let Some(period) = self.status_period {
            config.status_period_secs = period;
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(fps) = self.fps {
            if !(fps > 0.0 && fps.is_finite()) {
                bail!("--fps must be positive, got {fps}");
            }
            config.frame_interval_ms = Some((1000.0 / fps).round().max(1.0) as u64);
        }
        if self.no_restart {
            config.auto_restart = false;
        }
        config.validate().context("invalid rig configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.rig_config()?;

    #[cfg(feature = "camera")]
    if let Some(index) = cli.camera {
        return run(&config, camera::CameraSource::new(index), cli.exit_at_end).await;
    }

    let Some(directory) = &cli.source else {
        bail!("no capture source given (use --source <DIR>)");
    };
    let interval = config.frame_interval().unwrap_or(DEFAULT_FRAME_INTERVAL);
    run(&config, ImageSequenceSource::new(directory, interval), cli.exit_at_end).await
}

async fn run<S: CaptureSource>(config: &RigConfig, source: S, exit_at_end: bool) -> anyhow::Result<()> {
    // --- 1. Bus, monitor and session ---
    let bus = Arc::new(InMemoryBus::default());
    let feed = LedgerFeed::subscribe(bus.as_ref(), &config.namespace)?;
    let monitor = tokio::spawn(log_outcomes(feed));

    let session = RigSession::start(config, Arc::clone(&bus), SimulatedHardware::new(), source)
        .context("failed to start rig session")?;
    let handle = session.handle();
    handle.start();
    info!("commands: s = switch, r = start, q = quit");

    // --- 2. Operator loop ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut capture_done = session.capture_done();
    let mut capturing = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = capture_done.changed(), if capturing => {
                if changed.is_err() || *capture_done.borrow() {
                    capturing = false;
                    info!("capture source exhausted");
                    if exit_at_end {
                        break;
                    }
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(command)) => match command.trim() {
                    "s" | "switch" => {
                        handle.press_switch();
                    }
                    "r" | "start" => {
                        handle.start();
                    }
                    "q" | "quit" => break,
                    "" => {}
                    other => warn!(command = other, "unknown command"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin unreadable, operator commands disabled");
                    stdin_open = false;
                }
            },
        }
    }

    // --- 3. Shutdown ---
    session.close().await;
    monitor.abort();
    Ok(())
}

async fn log_outcomes(mut feed: LedgerFeed) {
    let mut ledger = StageLedger::new();
    while let Some(envelope) = feed.next().await {
        match ledger.record(&envelope) {
            Ok(Some(LedgerUpdate::Stage { rig, stage, status })) => info!(%rig, %stage, ?status, "stage outcome"),
            Ok(Some(LedgerUpdate::Status { rig, report })) => {
                info!(%rig, stage = %report.stage, alert = %report.alert, condition = ?report.condition, "rig status")
            }
            Ok(None) => {}
            Err(e) => warn!(topic = %envelope.topic, error = %e, "unrecognised controller output"),
        }
    }
}
