// THEORY:
// `tester_watch` watches a tester rig's screen through a camera and drives the
// rig's indicator hardware through a stage machine. The two halves never call
// each other; they exchange stage-tagged messages over a pub/sub bus.
//
// - `core_modules`: frames, change detection, the `VisualDetector` and the
//   `PerceptionTracker` that turns its answers into perception events.
// - `protocol`: topics, stages and payloads shared by both halves.
// - `bus`: the `MessageBus` interface and the in-process `InMemoryBus`.
// - `controller` and `alert`: the `StageController` FSM and its embedded
//   `AlertManager`.
// - `hardware`: verified output control behind `HardwareAdapter`.
// - `capture`: frame sources.
// - `session`: wires one rig's frame loop, message loop and timer together.
// - `monitor`: the `StageLedger` consumer of controller outcomes.
// - `config`: `RigConfig`.

pub mod alert;
pub mod bus;
pub mod capture;
pub mod config;
pub mod controller;
pub mod core_modules;
pub mod hardware;
pub mod monitor;
pub mod protocol;
pub mod session;

pub use bus::{InMemoryBus, MessageBus};
pub use config::RigConfig;
pub use controller::{ControllerInput, StageController};
pub use core_modules::frame::Frame;
pub use core_modules::visual_detector::{DetectorProfile, VisualDetector};
pub use session::{RigSession, SessionHandle};
