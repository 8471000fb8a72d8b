use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A point in the world frame (same units as the device odometry, usually mm).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point2) -> f32 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

/// Polar odometry as reported by the motion controller: distance travelled
/// (`rho`) and heading (`theta`, radians).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PolarPose {
    pub rho: f32,
    pub theta: f32,
}

/// Trapezoidal speed profile limits for one motion axis.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedProfile {
    pub vmax: f32,
    pub amax: f32,
}

/// Snapshot of a device's command-execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandState {
    /// Last running state written to the device.
    pub running: bool,
    /// Default blocking policy applied when a call does not override it.
    pub blocking: bool,
    /// True while an emergency stop interlock is in effect.
    pub interlocked: bool,
}

/// One range reading: bearing relative to the robot heading (radians) and
/// measured distance. A distance of `0.0` means "no return".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub angle: f32,
    pub distance: f32,
}

/// A full range-sensor sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSweep {
    pub timestamp: DateTime<Utc>,
    pub samples: Vec<SensorSample>,
}

impl SensorSweep {
    /// Build a sweep stamped with the current time.
    pub fn now(samples: Vec<SensorSample>) -> Self {
        Self {
            timestamp: Utc::now(),
            samples,
        }
    }
}

/// A strategic navigation target in the world frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: Uuid,
    pub target: Point2,
}

impl Objective {
    pub fn new(target: Point2) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
        }
    }
}

/// Workspace-wide error type.
///
/// A missing route is not an error: planners report it as an outcome.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RobotError {
    /// A bus transaction failed. Never retried locally.
    #[error("Communication error with device 0x{address:02x}: {details}")]
    Communication { address: u8, details: String },

    /// Input rejected before any bus transaction was attempted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An optional polling timeout elapsed.
    #[error("Timed out after {waited_ms} ms waiting for {operation}")]
    Timeout { operation: String, waited_ms: u64 },

    #[error("Sensor fault on {sensor}: {details}")]
    Sensor { sensor: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// A wait was abandoned because the device was shut down.  The command
    /// it guarded was not executed.
    #[error("Interrupted while waiting for {operation}")]
    Interrupted { operation: String },
}

impl RobotError {
    /// Shorthand for [`RobotError::Validation`].
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
