// THEORY:
// The `AlertManager` is the part of the controller that deals with "nobody
// answered the popup". It is armed when the popup is confirmed, activated when
// the dwell window runs out, and reset from either of two independent
// sources: the detector seeing the operator re-engage, or the operator
// pressing the physical switch. Whichever reset arrives first wins; the second
// finds the manager already disarmed and does nothing.
//
// The state is a plain `Copy` value so the message loop can publish snapshots
// for the timer task without sharing the manager itself.

use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertPhase {
    Disarmed,
    Armed,
    Activated,
}

impl AlertPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertPhase::Disarmed => "disarmed",
            AlertPhase::Armed => "armed",
            AlertPhase::Activated => "activated",
        }
    }
}

impl fmt::Display for AlertPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a reset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetSource {
    Switch,
    Detector,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertState {
    pub armed: bool,
    pub armed_at: Option<Instant>,
    /// Only ever set while `armed`.
    pub activated_at: Option<Instant>,
}

impl AlertState {
    pub fn phase(&self) -> AlertPhase {
        match (self.armed, self.activated_at) {
            (false, _) => AlertPhase::Disarmed,
            (true, None) => AlertPhase::Armed,
            (true, Some(_)) => AlertPhase::Activated,
        }
    }

    /// Armed, not yet activated, and more than `dwell` has passed since arming.
    pub fn is_dwell_due(&self, now: Instant, dwell: Duration) -> bool {
        match (self.phase(), self.armed_at) {
            (AlertPhase::Armed, Some(armed_at)) => now.saturating_duration_since(armed_at) > dwell,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct AlertManager {
    state: AlertState,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AlertState {
        self.state
    }

    pub fn phase(&self) -> AlertPhase {
        self.state.phase()
    }

    /// Starts the dwell window. No effect unless disarmed.
    pub fn arm(&mut self, now: Instant) -> bool {
        if self.state.armed {
            return false;
        }
        self.state = AlertState {
            armed: true,
            armed_at: Some(now),
            activated_at: None,
        };
        info!("alert armed");
        true
    }

    pub fn is_dwell_due(&self, now: Instant, dwell: Duration) -> bool {
        self.state.is_dwell_due(now, dwell)
    }

    /// Activates if the dwell window has run out. Returns whether it did.
    pub fn dwell_expired(&mut self, now: Instant, dwell: Duration) -> bool {
        if !self.is_dwell_due(now, dwell) {
            return false;
        }
        self.activate(now)
    }

    /// Marks an armed alert as activated. No effect when disarmed or already active.
    pub fn activate(&mut self, now: Instant) -> bool {
        if self.state.phase() != AlertPhase::Armed {
            return false;
        }
        self.state.activated_at = Some(now);
        info!("alert activated");
        true
    }

    /// Arms and activates in one step (operator-raised alert).
    pub fn force_activate(&mut self, now: Instant) -> bool {
        if self.state.phase() == AlertPhase::Activated {
            return false;
        }
        self.state = AlertState {
            armed: true,
            armed_at: self.state.armed_at.or(Some(now)),
            activated_at: Some(now),
        };
        info!("alert raised by operator");
        true
    }

    /// The operator re-engaged before anyone had to press the switch.
    pub fn interaction_observed(&mut self) -> bool {
        self.reset(ResetSource::Detector)
    }

    /// Clears all alert state. Returns `false` if there was nothing to clear.
    pub fn reset(&mut self, source: ResetSource) -> bool {
        if !self.state.armed {
            return false;
        }
        let was = self.state.phase();
        self.state = AlertState::default();
        info!(?source, from = %was, "alert reset");
        true
    }
}
