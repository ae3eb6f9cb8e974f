// THEORY:
// Everything that crosses the bus is defined here: rig identities, topics,
// the stage vocabulary and the JSON payloads. Components never build topic
// strings or payloads by hand; they go through these types so the detector
// side and the controller side cannot drift apart.
//
// Topics have the form `<namespace>.<rigId>.<messageType>`. Inbound traffic is
// routed by `decode`, a single table keyed by `(message type, stage)`. Any pair
// outside the table is a protocol error, which callers log and drop.

use crate::core_modules::visual_detector::FrameMeasure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed topic `{0}`")]
    MalformedTopic(String),
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("invalid rig id `{0}`")]
    InvalidRigId(String),
    #[error("undecodable payload on `{topic}`: {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected stage `{stage}` for `{kind}` message")]
    UnexpectedStage { kind: MessageType, stage: WireStage },
    #[error("detector reported failure for `{stage}`")]
    DetectorFailure { stage: WireStage },
}

/// Opaque identifier of one tester rig. Never empty and never contains a topic
/// separator or wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RigId(String);

impl RigId {
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.is_empty() || id.contains(['.', '*']) || id.chars().any(char::is_whitespace) {
            return Err(ProtocolError::InvalidRigId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RigId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Detector → controller: a stage was observed.
    Result,
    /// Detector → controller: the dwell window ran out.
    Alert,
    /// Controller → consumers: outcome of a stage command.
    Response,
    /// Controller → consumers: outcome of an alert command.
    AlertResponse,
    /// Controller → consumers: periodic rig status.
    Status,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Result => "result",
            MessageType::Alert => "alert",
            MessageType::Response => "response",
            MessageType::AlertResponse => "alert-response",
            MessageType::Status => "status",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "result" => Ok(MessageType::Result),
            "alert" => Ok(MessageType::Alert),
            "response" => Ok(MessageType::Response),
            "alert-response" => Ok(MessageType::AlertResponse),
            "status" => Ok(MessageType::Status),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

/// A fully qualified topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub namespace: String,
    pub rig: RigId,
    pub kind: MessageType,
}

impl Topic {
    pub fn new(namespace: impl Into<String>, rig: RigId, kind: MessageType) -> Self {
        Self {
            namespace: namespace.into(),
            rig,
            kind,
        }
    }

    pub fn parse(topic: &str) -> Result<Self, ProtocolError> {
        let mut parts = topic.split('.');
        let (Some(namespace), Some(rig), Some(kind), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::MalformedTopic(topic.to_string()));
        };
        if namespace.is_empty() {
            return Err(ProtocolError::MalformedTopic(topic.to_string()));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            rig: rig.parse()?,
            kind: kind.parse()?,
        })
    }

    /// Every message type for one rig: `<ns>.<rig>.*`.
    pub fn rig_pattern(namespace: &str, rig: &RigId) -> String {
        format!("{namespace}.{rig}.*")
    }

    /// One message type across all rigs: `<ns>.*.<type>`.
    pub fn kind_pattern(namespace: &str, kind: MessageType) -> String {
        format!("{namespace}.*.{kind}")
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.rig, self.kind)
    }
}

/// The controller's current position in a test cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Idle,
    Init,
    BeginCapture,
    TestScreen,
    PopUpPending,
    PopUp,
    PreAlert,
    Alert,
    Reset,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Init => "init",
            Stage::BeginCapture => "beginCapture",
            Stage::TestScreen => "testScreen",
            Stage::PopUpPending => "popUpPending",
            Stage::PopUp => "popUp",
            Stage::PreAlert => "preAlert",
            Stage::Alert => "alert",
            Stage::Reset => "reset",
        }
    }

    /// Stages between a started cycle and the popup being handled.
    pub fn is_mid_test(self) -> bool {
        matches!(
            self,
            Stage::BeginCapture | Stage::TestScreen | Stage::PopUpPending | Stage::PopUp
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `stage` field of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WireStage {
    #[serde(rename = "init")]
    Init,
    #[serde(rename = "beginCapture")]
    BeginCapture,
    #[serde(rename = "testScreen")]
    TestScreen,
    #[serde(rename = "popUp")]
    PopUp,
    #[serde(rename = "alert")]
    Alert,
    #[serde(rename = "alert-reset")]
    AlertReset,
    #[serde(rename = "alert-msg")]
    AlertMsg,
    #[serde(rename = "alert-switch")]
    AlertSwitch,
}

impl WireStage {
    pub fn as_str(self) -> &'static str {
        match self {
            WireStage::Init => "init",
            WireStage::BeginCapture => "beginCapture",
            WireStage::TestScreen => "testScreen",
            WireStage::PopUp => "popUp",
            WireStage::Alert => "alert",
            WireStage::AlertReset => "alert-reset",
            WireStage::AlertMsg => "alert-msg",
            WireStage::AlertSwitch => "alert-switch",
        }
    }

    /// Alert outcomes travel on `alert-response`, everything else on `response`.
    pub fn response_kind(self) -> MessageType {
        match self {
            WireStage::AlertReset | WireStage::AlertMsg | WireStage::AlertSwitch => {
                MessageType::AlertResponse
            }
            _ => MessageType::Response,
        }
    }
}

impl fmt::Display for WireStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    Success,
    Failed,
    Activated,
}

/// The `{stage, status}` payload shared by every stage-tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub stage: WireStage,
    pub status: WireStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub largest_region: Option<usize>,
}

impl BusMessage {
    pub fn new(stage: WireStage, status: WireStatus) -> Self {
        Self {
            stage,
            status,
            timestamp_ms: None,
            changed_ratio: None,
            largest_region: None,
        }
    }

    pub fn encode(&self) -> String {
        // A struct of enums and numbers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Screens the detector reports as settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyScreen {
    BeginCapture,
    TestScreen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerceptionKind {
    StageReady(ReadyScreen),
    PopupSeen,
    InteractionSeen,
    AlertDue,
}

impl PerceptionKind {
    /// The message type and payload a perception of this kind travels as.
    pub fn wire(self) -> (MessageType, BusMessage) {
        let (kind, stage, status) = match self {
            PerceptionKind::StageReady(ReadyScreen::BeginCapture) => {
                (MessageType::Result, WireStage::BeginCapture, WireStatus::Success)
            }
            PerceptionKind::StageReady(ReadyScreen::TestScreen) => {
                (MessageType::Result, WireStage::TestScreen, WireStatus::Success)
            }
            PerceptionKind::PopupSeen => (MessageType::Result, WireStage::PopUp, WireStatus::Success),
            PerceptionKind::InteractionSeen => {
                (MessageType::Result, WireStage::AlertReset, WireStatus::Success)
            }
            PerceptionKind::AlertDue => (MessageType::Alert, WireStage::Alert, WireStatus::Activated),
        };
        (kind, BusMessage::new(stage, status))
    }
}

/// One discrete observation made by the detector side.
#[derive(Debug, Clone, PartialEq)]
pub struct PerceptionEvent {
    pub kind: PerceptionKind,
    pub rig: RigId,
    /// Frame time the observation was made at.
    pub timestamp: Duration,
    /// Measurements the decision was based on.
    pub confidence: FrameMeasure,
}

impl PerceptionEvent {
    pub fn to_message(&self) -> (MessageType, BusMessage) {
        let (kind, mut message) = self.kind.wire();
        message.timestamp_ms = Some(self.timestamp.as_millis() as u64);
        message.changed_ratio = Some(self.confidence.changed_ratio);
        message.largest_region = Some(self.confidence.largest_region);
        (kind, message)
    }
}

/// A controller outcome as seen by the detector side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerAck {
    pub stage: WireStage,
    pub status: WireStatus,
}

impl ControllerAck {
    pub fn is_success(&self, stage: WireStage) -> bool {
        self.stage == stage && self.status == WireStatus::Success
    }
}

/// What an inbound message means to the receiving rig.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Perception(PerceptionKind),
    Ack(ControllerAck),
    Ignored,
}

/// Routes one bus message through the `(message type, stage)` table.
pub fn decode(topic: &str, payload: &str) -> Result<(Topic, Inbound), ProtocolError> {
    let parsed = Topic::parse(topic)?;
    if parsed.kind == MessageType::Status {
        return Ok((parsed, Inbound::Ignored));
    }

    let message: BusMessage = serde_json::from_str(payload).map_err(|source| ProtocolError::Payload {
        topic: topic.to_string(),
        source,
    })?;

    let inbound = match (parsed.kind, message.stage, message.status) {
        (MessageType::Result, stage, WireStatus::Failed) => {
            return Err(ProtocolError::DetectorFailure { stage });
        }
        (MessageType::Result, WireStage::BeginCapture, _) => {
            Inbound::Perception(PerceptionKind::StageReady(ReadyScreen::BeginCapture))
        }
        (MessageType::Result, WireStage::TestScreen, _) => {
            Inbound::Perception(PerceptionKind::StageReady(ReadyScreen::TestScreen))
        }
        (MessageType::Result, WireStage::PopUp, _) => Inbound::Perception(PerceptionKind::PopupSeen),
        (MessageType::Result, WireStage::AlertReset, _) => {
            Inbound::Perception(PerceptionKind::InteractionSeen)
        }
        (MessageType::Alert, WireStage::Alert, WireStatus::Activated) => {
            Inbound::Perception(PerceptionKind::AlertDue)
        }
        (MessageType::Response | MessageType::AlertResponse, stage, status)
            if stage.response_kind() == parsed.kind =>
        {
            Inbound::Ack(ControllerAck { stage, status })
        }
        (kind, stage, _) => return Err(ProtocolError::UnexpectedStage { kind, stage }),
    };
    Ok((parsed, inbound))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Normal,
    Fault,
}

/// The periodic `status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub rig: String,
    #[serde(rename = "type")]
    pub rig_type: usize,
    pub site: String,
    pub location: String,
    pub timestamp: u64,
    pub condition: Condition,
    pub stage: Stage,
    pub alert: String,
    /// Channel name → `on` / `off`.
    pub outputs: BTreeMap<String, String>,
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
