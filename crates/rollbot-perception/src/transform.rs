//! Planar rigid-body transforms between the world, robot and sensor frames.
//!
//! A [`Pose2`] is the position and heading of frame B expressed in frame A.
//! To convert a point from B into A, rotate it by `heading` then add the
//! translation.  Chaining robot-in-world with sensor-on-robot gives the
//! sensor's world pose, which turns a polar range sample into a world point.
//!
//! # Example
//!
//! ```rust
//! use rollbot_perception::transform::Pose2;
//! use rollbot_types::Point2;
//!
//! // Robot at (100, 0) facing +y; lidar mounted 10 units ahead of centre.
//! let robot = Pose2::new(100.0, 0.0, std::f32::consts::FRAC_PI_2);
//! let lidar = Pose2::new(10.0, 0.0, 0.0);
//!
//! let hit = robot.compose(lidar).project_polar(0.0, 50.0);
//! assert!((hit.x - 100.0).abs() < 1e-3);
//! assert!((hit.y - 60.0).abs() < 1e-3);
//! ```

use rollbot_types::Point2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Pose2 {
    pub x: f32,
    pub y: f32,
    /// Radians, counter-clockwise from +x.
    pub heading: f32,
}

impl Pose2 {
    pub fn new(x: f32, y: f32, heading: f32) -> Self {
        Self { x, y, heading }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn from_point(position: Point2, heading: f32) -> Self {
        Self::new(position.x, position.y, heading)
    }

    pub fn position(&self) -> Point2 {
        Point2::new(self.x, self.y)
    }

    /// Express a point given in this pose's frame in the parent frame.
    pub fn apply(&self, p: Point2) -> Point2 {
        let (sin, cos) = self.heading.sin_cos();
        Point2::new(
            self.x + p.x * cos - p.y * sin,
            self.y + p.x * sin + p.y * cos,
        )
    }

    /// If `self` = T_A_B and `other` = T_B_C, returns T_A_C.
    pub fn compose(&self, other: Pose2) -> Pose2 {
        let origin = self.apply(other.position());
        Pose2::new(origin.x, origin.y, self.heading + other.heading)
    }

    /// T_B_A for `self` = T_A_B.
    pub fn inverse(&self) -> Pose2 {
        let (sin, cos) = self.heading.sin_cos();
        Pose2::new(
            -(self.x * cos + self.y * sin),
            self.x * sin - self.y * cos,
            -self.heading,
        )
    }

    /// World point of a range return at `angle` (relative to this pose's
    /// heading) and `distance`.
    pub fn project_polar(&self, angle: f32, distance: f32) -> Point2 {
        let (sin, cos) = angle.sin_cos();
        self.apply(Point2::new(distance * cos, distance * sin))
    }
}
