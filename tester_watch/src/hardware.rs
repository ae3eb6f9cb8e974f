// THEORY:
// The controller drives a handful of digital outputs: the rig's power relay,
// three indicator LEDs and the escalation output that sounds the alert. Every
// command is verified by reading the output back, because a relay that did not
// switch must never be reported as a passed stage.
//
// `HardwareAdapter` is the seam to the real GPIO. `SimulatedHardware` keeps the
// levels in memory and can pin a channel to a level to reproduce a wiring
// fault in tests.

use crate::protocol::{WireStage, WireStatus};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Power,
    Red,
    Amber,
    Green,
    Escalation,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Power,
        Channel::Red,
        Channel::Amber,
        Channel::Green,
        Channel::Escalation,
    ];

    /// BCM pin number the channel is wired to.
    pub fn bcm_pin(self) -> u8 {
        match self {
            Channel::Power => 26,
            Channel::Red => 23,
            Channel::Amber => 24,
            Channel::Green => 25,
            Channel::Escalation => 18,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Power => "power",
            Channel::Red => "red",
            Channel::Amber => "amber",
            Channel::Green => "green",
            Channel::Escalation => "escalation",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// How status reports spell the level.
    pub fn as_switch(self) -> &'static str {
        match self {
            Level::Low => "off",
            Level::High => "on",
        }
    }
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("failed to drive {channel} (pin {pin}): {reason}")]
    Write { channel: Channel, pin: u8, reason: String },
    #[error("failed to read {channel} (pin {pin}): {reason}")]
    Read { channel: Channel, pin: u8, reason: String },
}

pub trait HardwareAdapter: Send + 'static {
    fn set_output(&mut self, channel: Channel, level: Level) -> Result<(), HardwareError>;
    fn read_output(&self, channel: Channel) -> Result<Level, HardwareError>;
}

/// In-memory outputs. All channels start low.
#[derive(Debug, Clone)]
pub struct SimulatedHardware {
    levels: BTreeMap<Channel, Level>,
    stuck: BTreeMap<Channel, Level>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self {
            levels: Channel::ALL.iter().map(|c| (*c, Level::Low)).collect(),
            stuck: BTreeMap::new(),
        }
    }

    /// Pins `channel` to `level`; writes to it are accepted but have no effect.
    pub fn with_stuck(mut self, channel: Channel, level: Level) -> Self {
        self.stuck.insert(channel, level);
        self.levels.insert(channel, level);
        self
    }

    pub fn levels(&self) -> &BTreeMap<Channel, Level> {
        &self.levels
    }
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareAdapter for SimulatedHardware {
    fn set_output(&mut self, channel: Channel, level: Level) -> Result<(), HardwareError> {
        if !self.stuck.contains_key(&channel) {
            self.levels.insert(channel, level);
        }
        Ok(())
    }

    fn read_output(&self, channel: Channel) -> Result<Level, HardwareError> {
        Ok(self.levels.get(&channel).copied().unwrap_or(Level::Low))
    }
}

/// Outcome of one verified command batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stage: WireStage,
    pub status: WireStatus,
    /// What each commanded channel read back as; `None` when the read failed.
    pub verified_state: Vec<(Channel, Option<Level>)>,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.status == WireStatus::Success
    }
}

/// Drives every command, then reads every commanded channel back. Success only
/// if all read-backs match. A failed write does not stop the remaining commands.
pub fn execute_commands<H: HardwareAdapter + ?Sized>(
    hardware: &mut H,
    stage: WireStage,
    commands: &[(Channel, Level)],
) -> CommandResult {
    for &(channel, level) in commands {
        if let Err(error) = hardware.set_output(channel, level) {
            warn!(%stage, %error, "output write failed");
        }
    }

    let mut all_match = true;
    let verified_state = commands
        .iter()
        .map(|&(channel, expected)| {
            let actual = match hardware.read_output(channel) {
                Ok(level) => Some(level),
                Err(error) => {
                    warn!(%stage, %error, "output read-back failed");
                    None
                }
            };
            if actual != Some(expected) {
                all_match = false;
                warn!(%stage, %channel, ?expected, ?actual, "output verification failed");
            }
            (channel, actual)
        })
        .collect();

    let status = if all_match {
        WireStatus::Success
    } else {
        WireStatus::Failed
    };
    debug!(%stage, ?status, "command batch executed");
    CommandResult {
        stage,
        status,
        verified_state,
    }
}
