// THEORY:
// A `RigSession` runs one rig. It owns three concurrent activities:
//
// 1.  The frame loop (a blocking thread): pulls frames from the capture source,
//     runs the `PerceptionTracker` and publishes its events. It follows the
//     controller's acknowledgements through its own subscription so it knows
//     when a cycle starts and ends, and stops pulling frames while dormant.
// 2.  The message loop (a task): the single consumer that drives the
//     `StageController`. Bus messages, operator inputs, timer signals, the
//     periodic status report and the auto-restart deadline all arrive here, so
//     the controller sees one ordered stream of inputs.
// 3.  The timer (a task): ticks at the configured interval, reads the alert
//     snapshot the message loop publishes and sends `DwellExpired` back once
//     per arming. It never touches the alert state itself.
//
// The detector side and the controller side share nothing but the bus. A
// watch channel carries the close signal; every loop checks it at least once
// per polling interval.

use crate::alert::AlertState;
use crate::bus::{publish_best_effort, BusError, MessageBus, Subscription};
use crate::capture::{CaptureError, CaptureSource, FrameRead};
use crate::config::{ConfigError, RigConfig};
use crate::controller::{ControllerInput, StageController};
use crate::core_modules::perception::PerceptionTracker;
use crate::hardware::HardwareAdapter;
use crate::protocol::{decode, Inbound, MessageType, RigId, Stage, Topic};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How long a dormant frame loop sleeps between acknowledgement checks.
const DORMANT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Operator-side controls of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inputs: mpsc::UnboundedSender<ControllerInput>,
}

impl SessionHandle {
    /// Starts a test cycle. Returns `false` once the session has closed.
    pub fn start(&self) -> bool {
        self.inputs.send(ControllerInput::Start).is_ok()
    }

    pub fn press_switch(&self) -> bool {
        self.inputs.send(ControllerInput::SwitchPressed).is_ok()
    }
}

pub struct RigSession {
    rig: RigId,
    handle: SessionHandle,
    shutdown: watch::Sender<bool>,
    capture_done: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RigSession {
    /// Opens the capture source and spawns the session's loops. Must be called
    /// from within a Tokio runtime.
    pub fn start<B, H, S>(config: &RigConfig, bus: Arc<B>, hardware: H, mut source: S) -> Result<Self, SessionError>
    where
        B: MessageBus,
        H: HardwareAdapter,
        S: CaptureSource,
    {
        // --- 1. Validate and open everything that can fail ---
        config.validate()?;
        let rig = config.rig()?;
        let profile = config.profile()?;
        source.open()?;

        let pattern = Topic::rig_pattern(&config.namespace, &rig);
        let controller_inbox = bus.subscribe(&pattern)?;
        let tracker_inbox = bus.subscribe(&pattern)?;

        // --- 2. Channels between the loops ---
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (alert_tx, alert_rx) = watch::channel(AlertState::default());
        let (done_tx, done_rx) = watch::channel(false);

        // --- 3. Spawn ---
        let dwell = profile.dwell_window();
        let message_loop = MessageLoop {
            controller: StageController::new(rig.clone(), hardware, dwell),
            bus: Arc::clone(&bus),
            namespace: config.namespace.clone(),
            rig_type: config.rig_type,
            site: config.site.clone(),
            location: config.location.clone(),
            auto_restart: config.auto_restart,
            restart_delay: config.restart_delay(),
            alert_tx,
        };
        let mut tasks = vec![tokio::spawn(message_loop.run(
            controller_inbox,
            input_rx,
            shutdown_rx.clone(),
            config.status_period(),
        ))];

        tasks.push(tokio::spawn(timer_loop(
            alert_rx,
            input_tx.clone(),
            dwell,
            config.tick_interval(),
            shutdown_rx.clone(),
        )));

        let frame_loop = FrameLoop {
            tracker: PerceptionTracker::new(rig.clone(), profile),
            bus,
            namespace: config.namespace.clone(),
            frame_interval: config.frame_interval(),
        };
        tasks.push(tokio::task::spawn_blocking(move || {
            frame_loop.run(source, tracker_inbox, shutdown_rx, done_tx)
        }));

        info!(%rig, namespace = %config.namespace, "rig session started");
        Ok(Self {
            rig,
            handle: SessionHandle { inputs: input_tx },
            shutdown: shutdown_tx,
            capture_done: done_rx,
            tasks,
        })
    }

    pub fn rig(&self) -> &RigId {
        &self.rig
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Flips to `true` when the capture source is exhausted.
    pub fn capture_done(&self) -> watch::Receiver<bool> {
        self.capture_done.clone()
    }

    /// Signals every loop to stop and waits for them.
    pub async fn close(self) {
        self.shutdown.send_replace(true);
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(rig = %self.rig, error = %e, "session task failed");
            }
        }
        info!(rig = %self.rig, "rig session closed");
    }
}

struct MessageLoop<B, H> {
    controller: StageController<H>,
    bus: Arc<B>,
    namespace: String,
    rig_type: usize,
    site: String,
    location: String,
    auto_restart: bool,
    restart_delay: Duration,
    alert_tx: watch::Sender<AlertState>,
}

impl<B: MessageBus, H: HardwareAdapter> MessageLoop<B, H> {
    async fn run(
        mut self,
        mut inbox: Subscription,
        mut inputs: mpsc::UnboundedReceiver<ControllerInput>,
        mut shutdown: watch::Receiver<bool>,
        status_period: Duration,
    ) {
        // The first tick completes immediately, so status is published at start.
        let mut status = interval(status_period);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut restart_at: Option<tokio::time::Instant> = None;

        loop {
            let before = self.controller.stage();
            tokio::select! {
                _ = shutdown.changed() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => self.on_message(&envelope.topic, &envelope.payload),
                    None => {
                        warn!(rig = %self.controller.rig(), "bus closed");
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.apply(input),
                _ = status.tick() => self.publish_status(),
                _ = sleep_until(restart_at.unwrap_or_else(tokio::time::Instant::now)), if restart_at.is_some() => {
                    restart_at = None;
                    info!(rig = %self.controller.rig(), "restarting test cycle");
                    self.apply(ControllerInput::Start);
                }
            }

            let after = self.controller.stage();
            if self.auto_restart && after == Stage::Reset && before != Stage::Reset {
                restart_at = Some(tokio::time::Instant::now() + self.restart_delay);
            }
        }
    }

    fn on_message(&mut self, topic: &str, payload: &str) {
        match decode(topic, payload) {
            Ok((_, Inbound::Perception(kind))) => self.apply(ControllerInput::Perception(kind)),
            Ok(_) => {}
            Err(e) => warn!(rig = %self.controller.rig(), %topic, error = %e, "protocol error, message dropped"),
        }
    }

    fn apply(&mut self, input: ControllerInput) {
        for publication in self.controller.handle(input, Instant::now()) {
            let topic = Topic::new(self.namespace.as_str(), self.controller.rig().clone(), publication.kind);
            publish_best_effort(self.bus.as_ref(), &topic.to_string(), publication.message.encode());
        }
        self.alert_tx.send_replace(self.controller.alert_state());
    }

    fn publish_status(&self) {
        let report = self.controller.status_report(self.rig_type, &self.site, &self.location);
        let topic = Topic::new(
            self.namespace.as_str(),
            self.controller.rig().clone(),
            MessageType::Status,
        );
        match serde_json::to_string(&report) {
            Ok(payload) => publish_best_effort(self.bus.as_ref(), &topic.to_string(), payload),
            Err(e) => warn!(%topic, error = %e, "failed to encode status"),
        }
    }
}

async fn timer_loop(
    alert: watch::Receiver<AlertState>,
    inputs: mpsc::UnboundedSender<ControllerInput>,
    dwell: Duration,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut signalled: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let state = *alert.borrow();
                if state.is_dwell_due(Instant::now(), dwell) && signalled != state.armed_at {
                    signalled = state.armed_at;
                    debug!("dwell window expired");
                    if inputs.send(ControllerInput::DwellExpired).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

struct FrameLoop<B> {
    tracker: PerceptionTracker,
    bus: Arc<B>,
    namespace: String,
    frame_interval: Option<Duration>,
}

impl<B: MessageBus> FrameLoop<B> {
    fn run<S: CaptureSource>(
        mut self,
        mut source: S,
        mut acks: Subscription,
        shutdown: watch::Receiver<bool>,
        done: watch::Sender<bool>,
    ) {
        let mut skipped = 0u64;
        while !*shutdown.borrow() {
            while let Some(envelope) = acks.try_recv() {
                match decode(&envelope.topic, &envelope.payload) {
                    Ok((_, Inbound::Ack(ack))) => self.tracker.on_ack(ack),
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "ignoring undecodable message"),
                }
            }

            if self.tracker.is_dormant() {
                std::thread::sleep(DORMANT_POLL);
                continue;
            }

            match source.next_frame() {
                FrameRead::Frame(frame) => {
                    if let Some(event) = self.tracker.on_frame(&frame) {
                        let (kind, message) = event.to_message();
                        info!(rig = %event.rig, kind = ?event.kind, ratio = event.confidence.changed_ratio, "perception");
                        let topic = Topic::new(self.namespace.as_str(), event.rig.clone(), kind);
                        publish_best_effort(self.bus.as_ref(), &topic.to_string(), message.encode());
                    }
                }
                FrameRead::Unreadable(reason) => {
                    skipped += 1;
                    warn!(%reason, skipped, "skipping unreadable frame");
                }
                FrameRead::EndOfStream => {
                    info!("capture source exhausted");
                    break;
                }
            }

            if let Some(pace) = self.frame_interval {
                std::thread::sleep(pace);
            }
        }
        done.send_replace(true);
    }
}
