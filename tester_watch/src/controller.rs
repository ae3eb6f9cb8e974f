// THEORY:
// The `StageController` is the finite-state machine at the heart of a rig
// session. It is a pure, synchronous value: the message loop feeds it one
// `ControllerInput` at a time, together with the current instant, and
// publishes whatever `Publication`s come back. Nothing else mutates the stage
// or the alert state, which is what makes per-rig ordering trivial.
//
// Dispatch is a single `match` on `(input, stage)`. Every row that moves the
// rig forward goes through `run`, which drives the outputs, reads them back
// and publishes the verified outcome. A stage only advances on a verified
// success. A failed verification publishes `failed`, holds the stage and puts
// the controller into a fault in which automatic inputs are ignored; only an
// operator action (start or switch) leaves it.
//
// Sequence:
//   idle -start-> init -verified-> beginCapture -ready-> testScreen -ready->
//   popUpPending -popup-> popUp -arm-> preAlert -+-interaction/switch-> reset
//                                                 +-dwell-> alert -reset-> reset
//
// Both reset triggers share one routine. The first to arrive disarms the alert
// and publishes `alert-reset`; the second finds nothing to reset.

use crate::alert::{AlertManager, AlertPhase, AlertState, ResetSource};
use crate::hardware::{execute_commands, Channel, CommandResult, HardwareAdapter, Level};
use crate::protocol::{
    now_millis, BusMessage, Condition, MessageType, PerceptionKind, ReadyScreen, RigId, Stage,
    StatusReport, WireStage,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const INIT: &[(Channel, Level)] = &[(Channel::Power, Level::Low)];
const BEGIN_CAPTURE: &[(Channel, Level)] = &[
    (Channel::Red, Level::Low),
    (Channel::Amber, Level::Low),
    (Channel::Green, Level::Low),
];
const TEST_SCREEN: &[(Channel, Level)] = &[(Channel::Red, Level::High)];
const POP_UP: &[(Channel, Level)] = &[(Channel::Green, Level::High)];
const ALERT_ON: &[(Channel, Level)] = &[(Channel::Amber, Level::High), (Channel::Escalation, Level::High)];
const ALERT_OFF: &[(Channel, Level)] = &[(Channel::Amber, Level::Low), (Channel::Escalation, Level::Low)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerInput {
    /// Begin (or restart) a test cycle.
    Start,
    /// A detector observation received over the bus.
    Perception(PerceptionKind),
    /// The timer saw the dwell window run out.
    DwellExpired,
    /// The physical switch was pressed.
    SwitchPressed,
}

/// A message the controller wants published for its rig.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub kind: MessageType,
    pub message: BusMessage,
}

impl Publication {
    fn from_result(result: &CommandResult) -> Self {
        let mut message = BusMessage::new(result.stage, result.status);
        message.timestamp_ms = Some(now_millis());
        Self {
            kind: result.stage.response_kind(),
            message,
        }
    }
}

pub struct StageController<H> {
    rig: RigId,
    stage: Stage,
    alert: AlertManager,
    hardware: H,
    dwell: Duration,
    /// The command whose verification failed, while the controller holds.
    fault: Option<WireStage>,
}

impl<H: HardwareAdapter> StageController<H> {
    pub fn new(rig: RigId, hardware: H, dwell: Duration) -> Self {
        Self {
            rig,
            stage: Stage::Idle,
            alert: AlertManager::new(),
            hardware,
            dwell,
            fault: None,
        }
    }

    pub fn rig(&self) -> &RigId {
        &self.rig
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn alert_state(&self) -> AlertState {
        self.alert.snapshot()
    }

    pub fn alert_phase(&self) -> AlertPhase {
        self.alert.phase()
    }

    pub fn fault(&self) -> Option<WireStage> {
        self.fault
    }

    pub fn dwell(&self) -> Duration {
        self.dwell
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn handle(&mut self, input: ControllerInput, now: Instant) -> Vec<Publication> {
        let mut out = Vec::new();
        match (input, self.stage) {
            (ControllerInput::Start, Stage::Idle | Stage::Reset) => self.start(&mut out),
            (ControllerInput::Start, _) if self.fault.is_some() => self.start(&mut out),
            (ControllerInput::SwitchPressed, _) => self.switch(now, &mut out),
            (_, stage) if self.fault.is_some() => {
                warn!(rig = %self.rig, %stage, fault = ?self.fault, ?input, "holding after failed verification");
            }
            (ControllerInput::Perception(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), Stage::BeginCapture) => {
                if self.run(WireStage::BeginCapture, BEGIN_CAPTURE, &mut out) {
                    self.advance(Stage::TestScreen);
                }
            }
            (ControllerInput::Perception(PerceptionKind::StageReady(ReadyScreen::TestScreen)), Stage::TestScreen) => {
                if self.run(WireStage::TestScreen, TEST_SCREEN, &mut out) {
                    self.advance(Stage::PopUpPending);
                }
            }
            (ControllerInput::Perception(PerceptionKind::PopupSeen), Stage::PopUpPending) => {
                self.popup(now, &mut out);
            }
            (ControllerInput::Perception(PerceptionKind::PopupSeen), Stage::TestScreen) => {
                // The popup proves the test screen is up even if its own report was lost.
                info!(rig = %self.rig, "popup seen before test screen, catching up");
                if self.run(WireStage::TestScreen, TEST_SCREEN, &mut out) {
                    self.advance(Stage::PopUpPending);
                    self.popup(now, &mut out);
                }
            }
            (ControllerInput::Perception(PerceptionKind::InteractionSeen), Stage::PreAlert | Stage::Alert) => {
                self.reset(ResetSource::Detector, &mut out);
            }
            (ControllerInput::DwellExpired, Stage::PreAlert) if self.alert.is_dwell_due(now, self.dwell) => {
                self.escalate(now, &mut out);
            }
            (ControllerInput::Perception(PerceptionKind::AlertDue), Stage::PreAlert)
                if self.alert.phase() == AlertPhase::Armed =>
            {
                self.escalate(now, &mut out);
            }
            (input, stage) => {
                debug!(rig = %self.rig, %stage, ?input, "input ignored in this stage");
            }
        }
        out
    }

    /// Snapshot for the periodic `status` message.
    pub fn status_report(&self, rig_type: usize, site: &str, location: &str) -> StatusReport {
        let outputs: BTreeMap<String, String> = Channel::ALL
            .iter()
            .map(|channel| {
                let state = match self.hardware.read_output(*channel) {
                    Ok(level) => level.as_switch(),
                    Err(_) => "unknown",
                };
                (channel.as_str().to_string(), state.to_string())
            })
            .collect();
        StatusReport {
            rig: self.rig.to_string(),
            rig_type,
            site: site.to_string(),
            location: location.to_string(),
            timestamp: now_millis(),
            condition: if self.fault.is_some() {
                Condition::Fault
            } else {
                Condition::Normal
            },
            stage: self.stage,
            alert: self.alert.phase().to_string(),
            outputs,
        }
    }

    fn start(&mut self, out: &mut Vec<Publication>) {
        if self.fault.take().is_some() {
            info!(rig = %self.rig, "fault cleared by restart");
        }
        // An alert left over from the held cycle is switched off like any other.
        if self.alert.phase() != AlertPhase::Disarmed && !self.reset(ResetSource::Switch, out) {
            return;
        }
        self.advance(Stage::Init);
        if self.run(WireStage::Init, INIT, out) {
            self.advance(Stage::BeginCapture);
        }
    }

    fn popup(&mut self, now: Instant, out: &mut Vec<Publication>) {
        if !self.run(WireStage::PopUp, POP_UP, out) {
            return;
        }
        self.advance(Stage::PopUp);
        self.alert.arm(now);
        self.advance(Stage::PreAlert);
    }

    fn escalate(&mut self, now: Instant, out: &mut Vec<Publication>) {
        if self.run(WireStage::AlertMsg, ALERT_ON, out) {
            self.alert.activate(now);
            self.advance(Stage::Alert);
        }
    }

    fn switch(&mut self, now: Instant, out: &mut Vec<Publication>) {
        if self.alert.phase() != AlertPhase::Disarmed || matches!(self.stage, Stage::PreAlert | Stage::Alert) {
            self.reset(ResetSource::Switch, out);
        } else if self.stage.is_mid_test() {
            if self.run(WireStage::AlertSwitch, ALERT_ON, out) {
                self.alert.force_activate(now);
            }
        } else {
            debug!(rig = %self.rig, stage = %self.stage, "switch ignored");
        }
    }

    /// Shared by both reset sources. Publishes at most one `alert-reset` per alert window.
    /// The alert is only disarmed once amber and escalation read back low.
    fn reset(&mut self, source: ResetSource, out: &mut Vec<Publication>) -> bool {
        if self.alert.phase() == AlertPhase::Disarmed && !matches!(self.stage, Stage::PreAlert | Stage::Alert) {
            debug!(rig = %self.rig, ?source, "nothing to reset");
            return false;
        }
        if !self.run(WireStage::AlertReset, ALERT_OFF, out) {
            return false;
        }
        self.alert.reset(source);
        self.fault = None;
        self.advance(Stage::Reset);
        true
    }

    /// Drives and verifies one command batch and queues its outcome.
    fn run(&mut self, stage: WireStage, commands: &[(Channel, Level)], out: &mut Vec<Publication>) -> bool {
        let result = execute_commands(&mut self.hardware, stage, commands);
        out.push(Publication::from_result(&result));
        if !result.is_success() {
            warn!(rig = %self.rig, %stage, current = %self.stage, "verification failed, holding stage");
            self.fault = Some(stage);
        }
        result.is_success()
    }

    fn advance(&mut self, next: Stage) {
        info!(rig = %self.rig, from = %self.stage, to = %next, "stage transition");
        self.stage = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::SimulatedHardware;
    use crate::protocol::WireStatus;

    const DWELL: Duration = Duration::from_secs(30);

    fn controller(hardware: SimulatedHardware) -> StageController<SimulatedHardware> {
        StageController::new(RigId::new("vid1").expect("valid id"), hardware, DWELL)
    }

    fn perceive(kind: PerceptionKind) -> ControllerInput {
        ControllerInput::Perception(kind)
    }

    fn summary(publications: &[Publication]) -> Vec<(MessageType, WireStage, WireStatus)> {
        publications
            .iter()
            .map(|p| (p.kind, p.message.stage, p.message.status))
            .collect()
    }

    /// Runs a healthy controller up to `PreAlert`, armed at `t0`.
    fn armed_at(t0: Instant) -> StageController<SimulatedHardware> {
        let mut c = controller(SimulatedHardware::new());
        c.handle(ControllerInput::Start, t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0);
        c.handle(perceive(PerceptionKind::PopupSeen), t0);
        assert_eq!(c.stage(), Stage::PreAlert);
        c
    }

    #[test]
    fn start_verifies_power_and_enters_begin_capture() {
        let mut c = controller(SimulatedHardware::new());

        let out = c.handle(ControllerInput::Start, Instant::now());

        assert_eq!(summary(&out), vec![(MessageType::Response, WireStage::Init, WireStatus::Success)]);
        assert_eq!(c.stage(), Stage::BeginCapture);
    }

    #[test]
    fn full_cycle_publishes_each_stage_and_sets_leds() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new());
        c.handle(ControllerInput::Start, t0);

        let begin = c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), t0);
        let test = c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0);
        let popup = c.handle(perceive(PerceptionKind::PopupSeen), t0);

        assert_eq!(summary(&begin)[0].1, WireStage::BeginCapture);
        assert_eq!(summary(&test)[0].1, WireStage::TestScreen);
        assert_eq!(summary(&popup)[0].1, WireStage::PopUp);
        assert_eq!(c.stage(), Stage::PreAlert);
        assert_eq!(c.alert_phase(), AlertPhase::Armed);
        let levels = c.hardware().levels();
        assert_eq!(levels[&Channel::Red], Level::High);
        assert_eq!(levels[&Channel::Green], Level::High);
        assert_eq!(levels[&Channel::Amber], Level::Low);
    }

    #[test]
    fn popup_during_test_screen_catches_up() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new());
        c.handle(ControllerInput::Start, t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), t0);

        let out = c.handle(perceive(PerceptionKind::PopupSeen), t0);

        assert_eq!(
            summary(&out),
            vec![
                (MessageType::Response, WireStage::TestScreen, WireStatus::Success),
                (MessageType::Response, WireStage::PopUp, WireStatus::Success),
            ]
        );
        assert_eq!(c.stage(), Stage::PreAlert);
    }

    #[test]
    fn failed_verification_holds_the_stage() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new().with_stuck(Channel::Red, Level::Low));
        c.handle(ControllerInput::Start, t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), t0);

        let out = c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0);

        assert_eq!(summary(&out), vec![(MessageType::Response, WireStage::TestScreen, WireStatus::Failed)]);
        assert_eq!(c.stage(), Stage::TestScreen);
        assert_eq!(c.fault(), Some(WireStage::TestScreen));
        // No automatic retry.
        assert!(c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0).is_empty());
        assert!(c.handle(perceive(PerceptionKind::PopupSeen), t0).is_empty());
    }

    #[test]
    fn start_clears_a_fault() {
        let mut c = controller(SimulatedHardware::new().with_stuck(Channel::Power, Level::High));

        let out = c.handle(ControllerInput::Start, Instant::now());

        assert_eq!(out[0].message.status, WireStatus::Failed);
        assert_eq!(c.stage(), Stage::Init);
        assert_eq!(c.status_report(2, "lab", "bench").condition, Condition::Fault);
        // Still stuck: a restart tries again, publishes again and holds again.
        assert_eq!(c.handle(ControllerInput::Start, Instant::now()).len(), 1);
        assert_eq!(c.stage(), Stage::Init);
    }

    #[test]
    fn interaction_within_dwell_never_activates() {
        let t0 = Instant::now();
        let mut c = armed_at(t0);

        let out = c.handle(perceive(PerceptionKind::InteractionSeen), t0 + Duration::from_secs(10));
        assert_eq!(summary(&out), vec![(MessageType::AlertResponse, WireStage::AlertReset, WireStatus::Success)]);

        assert!(c.handle(ControllerInput::DwellExpired, t0 + Duration::from_secs(31)).is_empty());
        assert_eq!(c.alert_phase(), AlertPhase::Disarmed);
        assert_eq!(c.stage(), Stage::Reset);
    }

    #[test]
    fn dwell_expiry_activates_after_amber_is_verified() {
        let t0 = Instant::now();
        let mut c = armed_at(t0);

        assert!(c.handle(ControllerInput::DwellExpired, t0 + Duration::from_secs(29)).is_empty());
        let out = c.handle(ControllerInput::DwellExpired, t0 + Duration::from_secs(31));

        assert_eq!(summary(&out), vec![(MessageType::AlertResponse, WireStage::AlertMsg, WireStatus::Success)]);
        assert_eq!(c.alert_phase(), AlertPhase::Activated);
        assert_eq!(c.stage(), Stage::Alert);
        assert_eq!(c.hardware().levels()[&Channel::Amber], Level::High);
        assert_eq!(c.hardware().levels()[&Channel::Escalation], Level::High);
    }

    #[test]
    fn unverified_amber_does_not_activate() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new().with_stuck(Channel::Amber, Level::Low));
        c.handle(ControllerInput::Start, t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0);
        c.handle(perceive(PerceptionKind::PopupSeen), t0);

        let out = c.handle(ControllerInput::DwellExpired, t0 + Duration::from_secs(31));

        assert_eq!(summary(&out), vec![(MessageType::AlertResponse, WireStage::AlertMsg, WireStatus::Failed)]);
        assert_eq!(c.alert_phase(), AlertPhase::Armed);
        assert_eq!(c.stage(), Stage::PreAlert);
    }

    #[test]
    fn detector_alert_due_escalates_once() {
        let t0 = Instant::now();
        let mut c = armed_at(t0);

        assert_eq!(c.handle(perceive(PerceptionKind::AlertDue), t0).len(), 1);
        assert!(c.handle(perceive(PerceptionKind::AlertDue), t0).is_empty());
        assert!(c.handle(ControllerInput::DwellExpired, t0 + Duration::from_secs(31)).is_empty());
    }

    #[test]
    fn reset_race_publishes_exactly_once_in_either_order() {
        let orders = [
            [ControllerInput::SwitchPressed, perceive(PerceptionKind::InteractionSeen)],
            [perceive(PerceptionKind::InteractionSeen), ControllerInput::SwitchPressed],
        ];
        for order in orders {
            let t0 = Instant::now();
            let mut c = armed_at(t0);
            c.handle(ControllerInput::DwellExpired, t0 + Duration::from_secs(31));
            assert_eq!(c.alert_phase(), AlertPhase::Activated);

            let resets: Vec<_> = order
                .iter()
                .flat_map(|input| c.handle(*input, t0 + Duration::from_secs(32)))
                .filter(|p| p.message.stage == WireStage::AlertReset)
                .collect();

            assert_eq!(resets.len(), 1);
            assert_eq!(c.alert_state(), AlertState::default());
            assert_eq!(c.stage(), Stage::Reset);
            assert_eq!(c.hardware().levels()[&Channel::Amber], Level::Low);
        }
    }

    #[test]
    fn switch_mid_test_raises_operator_alert() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new());
        c.handle(ControllerInput::Start, t0);

        let raised = c.handle(ControllerInput::SwitchPressed, t0);
        assert_eq!(summary(&raised), vec![(MessageType::AlertResponse, WireStage::AlertSwitch, WireStatus::Success)]);
        assert_eq!(c.stage(), Stage::BeginCapture);
        assert_eq!(c.alert_phase(), AlertPhase::Activated);

        let cleared = c.handle(ControllerInput::SwitchPressed, t0);
        assert_eq!(summary(&cleared)[0].1, WireStage::AlertReset);
        assert_eq!(c.stage(), Stage::Reset);
    }

    #[test]
    fn unverified_reset_keeps_the_alert_active() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new().with_stuck(Channel::Escalation, Level::High));
        c.handle(ControllerInput::Start, t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0);
        c.handle(perceive(PerceptionKind::PopupSeen), t0);
        c.handle(ControllerInput::DwellExpired, t0 + Duration::from_secs(31));
        assert_eq!(c.stage(), Stage::Alert);

        let out = c.handle(ControllerInput::SwitchPressed, t0 + Duration::from_secs(32));

        assert_eq!(summary(&out), vec![(MessageType::AlertResponse, WireStage::AlertReset, WireStatus::Failed)]);
        assert_eq!(c.stage(), Stage::Alert);
        assert_eq!(c.alert_phase(), AlertPhase::Activated);
        assert_eq!(c.fault(), Some(WireStage::AlertReset));
        // The detector cannot reset it either while the outputs disagree.
        assert!(c.handle(perceive(PerceptionKind::InteractionSeen), t0).is_empty());
        assert_eq!(c.alert_phase(), AlertPhase::Activated);
    }

    #[test]
    fn restart_switches_off_a_leftover_alert() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new().with_stuck(Channel::Red, Level::Low));
        c.handle(ControllerInput::Start, t0);
        c.handle(ControllerInput::SwitchPressed, t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::BeginCapture)), t0);
        c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0);
        assert_eq!(c.fault(), Some(WireStage::TestScreen));
        assert_eq!(c.alert_phase(), AlertPhase::Activated);

        let out = c.handle(ControllerInput::Start, t0);

        assert_eq!(
            summary(&out),
            vec![
                (MessageType::AlertResponse, WireStage::AlertReset, WireStatus::Success),
                (MessageType::Response, WireStage::Init, WireStatus::Success),
            ]
        );
        assert_eq!(c.stage(), Stage::BeginCapture);
        assert_eq!(c.alert_phase(), AlertPhase::Disarmed);
        let levels = c.hardware().levels();
        assert_eq!(levels[&Channel::Amber], Level::Low);
        assert_eq!(levels[&Channel::Escalation], Level::Low);
    }

    #[test]
    fn switch_is_ignored_when_idle() {
        let mut c = controller(SimulatedHardware::new());

        assert!(c.handle(ControllerInput::SwitchPressed, Instant::now()).is_empty());
        assert_eq!(c.stage(), Stage::Idle);
    }

    #[test]
    fn out_of_order_perceptions_are_ignored() {
        let t0 = Instant::now();
        let mut c = controller(SimulatedHardware::new());

        assert!(c.handle(perceive(PerceptionKind::PopupSeen), t0).is_empty());
        c.handle(ControllerInput::Start, t0);
        assert!(c.handle(perceive(PerceptionKind::StageReady(ReadyScreen::TestScreen)), t0).is_empty());
        assert!(c.handle(perceive(PerceptionKind::InteractionSeen), t0).is_empty());
        assert_eq!(c.stage(), Stage::BeginCapture);
    }

    #[test]
    fn status_report_lists_every_output() {
        let c = armed_at(Instant::now());

        let report = c.status_report(1, "lab", "bench 3");

        assert_eq!(report.outputs.len(), 5);
        assert_eq!(report.outputs["green"], "on");
        assert_eq!(report.outputs["amber"], "off");
        assert_eq!(report.alert, "armed");
        assert_eq!(report.stage, Stage::PreAlert);
    }
}
