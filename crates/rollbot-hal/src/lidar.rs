//! Generic `RangeSensor` trait for scanning range finders.

use rollbot_types::{RobotError, SensorSweep};

/// A scanning range finder (2D lidar, sonar ring, …).
///
/// Sample angles are relative to the robot heading; a distance of `0.0`
/// means the beam had no return.
pub trait RangeSensor: Send {
    /// Stable identifier for this sensor, e.g. `"front_lidar"`.
    fn id(&self) -> &str;

    /// Acquire the next full sweep.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Sensor`] if no sweep could be acquired.
    fn sweep(&mut self) -> Result<SensorSweep, RobotError>;
}

impl<S: RangeSensor + ?Sized> RangeSensor for Box<S> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn sweep(&mut self) -> Result<SensorSweep, RobotError> {
        (**self).sweep()
    }
}
