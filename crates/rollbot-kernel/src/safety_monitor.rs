//! [`SafetyMonitor`] – proximity interlock and obstacle mapping.
//!
//! Polls a [`RangeSensor`] at a fixed rate.  For every sweep:
//!
//! 1. Any sample with a return closer than `min_distance` inside the field
//!    of view asserts the motion controller's interlock (the emergency stop
//!    fires once per clear → set edge); a sweep without such samples clears
//!    it.
//! 2. Every return within `mapping_range` is projected into the world using
//!    the current odometry and folded into the grid's sensed layer, which
//!    bumps the grid revision when the obstacle picture changed.
//!
//! A sweep that cannot be acquired is treated as unsafe: the interlock is
//! asserted and polling continues.  Communication errors with the motion
//! controller end [`SafetyMonitor::run`].

use std::f32::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use rollbot_hal::{MotionController, RangeSensor, normalize_angle};
use rollbot_perception::{Cell, Pose2, SharedGrid};
use rollbot_types::{RobotError, SensorSweep};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Returns closer than this stop the robot.
    pub min_distance: f32,
    pub poll_ms: u64,
    /// Full angular width of the stop zone, centred on the heading.
    pub field_of_view: f32,
    /// Returns further than this are not mapped.
    pub mapping_range: f32,
    /// Sensor pose in the robot frame.
    pub sensor_mount: Pose2,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_distance: 250.0,
            poll_ms: 50,
            field_of_view: TAU,
            mapping_range: 1500.0,
            sensor_mount: Pose2::identity(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    /// Samples inside the stop zone.
    pub close_samples: usize,
    /// This sweep performed the clear → set transition.
    pub stop_edge: bool,
    /// This sweep released an asserted interlock.
    pub released: bool,
    /// Cells written to the sensed layer.
    pub mapped_cells: usize,
    pub grid_changed: bool,
    pub sensor_fault: bool,
}

pub struct SafetyMonitor<S> {
    sensor: S,
    controller: Arc<MotionController>,
    grid: Arc<SharedGrid>,
    config: SafetyConfig,
}

impl<S: RangeSensor> SafetyMonitor<S> {
    pub fn new(
        sensor: S,
        controller: Arc<MotionController>,
        grid: Arc<SharedGrid>,
        config: SafetyConfig,
    ) -> Self {
        Self {
            sensor,
            controller,
            grid,
            config,
        }
    }

    fn in_stop_zone(&self, angle: f32, distance: f32) -> bool {
        distance > 0.0
            && distance < self.config.min_distance
            && normalize_angle(angle).abs() <= self.config.field_of_view / 2.0
    }

    /// Apply one sweep: interlock first, then mapping.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Communication`] when the emergency stop or the
    /// pose queries fail.  The interlock stays asserted in that case.
    pub fn step(&self, sweep: &SensorSweep) -> Result<SweepReport, RobotError> {
        let mut report = SweepReport {
            close_samples: sweep
                .samples
                .iter()
                .filter(|s| self.in_stop_zone(s.angle, s.distance))
                .count(),
            ..SweepReport::default()
        };

        if report.close_samples > 0 {
            report.stop_edge = self.controller.assert_stop()?;
            if report.stop_edge {
                warn!(
                    sensor = self.sensor.id(),
                    close = report.close_samples,
                    "obstacle inside safety distance"
                );
            }
        } else {
            report.released = self.controller.clear_stop();
        }

        let theta = self.controller.pose()?.theta;
        let here = self.controller.pose_xy()?;
        let sensor_pose = Pose2::from_point(here, theta).compose(self.config.sensor_mount);

        let cells: Vec<Cell> = self.grid.read(|grid| {
            sweep
                .samples
                .iter()
                .filter(|s| s.distance > 0.0 && s.distance <= self.config.mapping_range)
                .filter_map(|s| grid.project(sensor_pose.project_polar(s.angle, s.distance)))
                .filter(|cell| grid.in_bounds(*cell))
                .collect()
        });
        report.mapped_cells = cells.len();
        report.grid_changed = self.grid.replace_sensed(cells);
        if report.grid_changed {
            debug!(
                cells = report.mapped_cells,
                revision = self.grid.revision(),
                "sensed obstacles updated"
            );
        }
        Ok(report)
    }

    /// Acquire one sweep and apply it.  A sensor failure asserts the
    /// interlock instead.
    pub fn poll(&mut self) -> Result<SweepReport, RobotError> {
        match self.sensor.sweep() {
            Ok(sweep) => self.step(&sweep),
            Err(err) => {
                warn!(sensor = self.sensor.id(), error = %err, "sweep failed, holding robot");
                Ok(SweepReport {
                    stop_edge: self.controller.assert_stop()?,
                    sensor_fault: true,
                    ..SweepReport::default()
                })
            }
        }
    }

    /// Poll until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), RobotError> {
        info!(sensor = self.sensor.id(), poll_ms = self.config.poll_ms, "safety monitor started");
        let interval = Duration::from_millis(self.config.poll_ms.max(1));
        while !shutdown.load(Ordering::SeqCst) {
            self.poll()?;
            thread::sleep(interval);
        }
        info!("safety monitor stopped");
        Ok(())
    }
}
