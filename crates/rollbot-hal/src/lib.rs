//! `rollbot-hal` – Hardware Abstraction Layer
//!
//! Everything that talks to the robot's microcontrollers lives here.
//!
//! # Modules
//!
//! - [`channel`] – [`RegisterChannel`][channel::RegisterChannel]: serialized
//!   register transactions against one device over a pluggable
//!   [`RegisterBus`][channel::RegisterBus], plus the little-endian payload
//!   codec.  A channel without a bus runs in simulate mode.
//! - [`gate`] – [`CommandGate`][gate::CommandGate]: blocking and
//!   emergency-stop interlock policies applied to every device command.
//! - [`motion`] – [`MotionController`][motion::MotionController]: the
//!   motion-control board (moves, odometry, PID, speed profiles).
//! - [`pid`] – PID/telemetry/profile channel tables addressed by
//!   [`ChannelId`][pid::ChannelId].
//! - [`lidar`] – [`RangeSensor`][lidar::RangeSensor] trait for range finders.
//! - [`sim`] – recording and kinematic buses and simulated sensors for
//!   tests and headless runs.

pub mod channel;
pub mod gate;
pub mod lidar;
pub mod motion;
pub mod pid;
pub mod sim;

pub use channel::{RegisterBus, RegisterChannel};
pub use gate::{CommandGate, CommandPolicy, GateConfig, Interlock, SafetyAction};
pub use lidar::RangeSensor;
pub use motion::{ControllerState, MotionController, MoveCommand, normalize_angle};
pub use pid::{ChannelId, PidParameters, ProfileAxis};
