// THEORY:
// The `StageLedger` is a passive consumer of controller output. It subscribes
// with wildcards to every rig's `response`, `alert-response` and `status`
// topics in a namespace and keeps, per rig, the latest outcome of every stage
// plus the last status report. It holds everything in memory and never
// publishes.

use crate::bus::{BusError, Envelope, MessageBus, Subscription};
use crate::protocol::{BusMessage, MessageType, ProtocolError, RigId, StatusReport, Topic, WireStage, WireStatus};
use std::collections::BTreeMap;

/// What one recorded message changed.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerUpdate {
    Stage {
        rig: RigId,
        stage: WireStage,
        status: WireStatus,
    },
    Status {
        rig: RigId,
        report: Box<StatusReport>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RigRecord {
    pub stages: BTreeMap<WireStage, WireStatus>,
    pub last_status: Option<StatusReport>,
    /// Responses reported `failed` over the ledger's lifetime.
    pub failures: u64,
}

#[derive(Debug, Default)]
pub struct StageLedger {
    records: BTreeMap<RigId, RigRecord>,
}

impl StageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, envelope: &Envelope) -> Result<Option<LedgerUpdate>, ProtocolError> {
        let topic = Topic::parse(&envelope.topic)?;
        let payload_error = |source| ProtocolError::Payload {
            topic: envelope.topic.clone(),
            source,
        };
        let record = self.records.entry(topic.rig.clone()).or_default();

        match topic.kind {
            MessageType::Response | MessageType::AlertResponse => {
                let message: BusMessage = serde_json::from_str(&envelope.payload).map_err(payload_error)?;
                record.stages.insert(message.stage, message.status);
                if message.status == WireStatus::Failed {
                    record.failures += 1;
                }
                Ok(Some(LedgerUpdate::Stage {
                    rig: topic.rig,
                    stage: message.stage,
                    status: message.status,
                }))
            }
            MessageType::Status => {
                let report: StatusReport = serde_json::from_str(&envelope.payload).map_err(payload_error)?;
                record.last_status = Some(report.clone());
                Ok(Some(LedgerUpdate::Status {
                    rig: topic.rig,
                    report: Box::new(report),
                }))
            }
            MessageType::Result | MessageType::Alert => Ok(None),
        }
    }

    pub fn rig(&self, rig: &RigId) -> Option<&RigRecord> {
        self.records.get(rig)
    }

    pub fn outcome(&self, rig: &RigId, stage: WireStage) -> Option<WireStatus> {
        self.records.get(rig)?.stages.get(&stage).copied()
    }

    pub fn rigs(&self) -> impl Iterator<Item = &RigId> {
        self.records.keys()
    }
}

/// The three wildcard subscriptions a ledger reads from.
pub struct LedgerFeed {
    responses: Subscription,
    alert_responses: Subscription,
    status: Subscription,
}

impl LedgerFeed {
    pub fn subscribe<B: MessageBus + ?Sized>(bus: &B, namespace: &str) -> Result<Self, BusError> {
        Ok(Self {
            responses: bus.subscribe(&Topic::kind_pattern(namespace, MessageType::Response))?,
            alert_responses: bus.subscribe(&Topic::kind_pattern(namespace, MessageType::AlertResponse))?,
            status: bus.subscribe(&Topic::kind_pattern(namespace, MessageType::Status))?,
        })
    }

    /// Next message from any of the subscriptions; `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Envelope> {
        tokio::select! {
            Some(envelope) = self.responses.recv() => Some(envelope),
            Some(envelope) = self.alert_responses.recv() => Some(envelope),
            Some(envelope) = self.status.recv() => Some(envelope),
            else => None,
        }
    }
}
