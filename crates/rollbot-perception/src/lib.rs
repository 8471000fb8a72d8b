//! `rollbot-perception` – the robot's model of the world.
//!
//! Turns range-sensor returns into an occupancy grid and searches that grid
//! for collision-free routes.
//!
//! # Modules
//!
//! - [`grid`] – [`OccupancyGrid`][grid::OccupancyGrid]: static and sensed
//!   obstacle layers with a revision counter, and
//!   [`SharedGrid`][grid::SharedGrid] for concurrent readers and writers.
//! - [`planner`] – [`PathPlanner`][planner::PathPlanner]: A* search,
//!   collinear simplification and line-of-sight shortcutting.
//! - [`transform`] – [`Pose2`][transform::Pose2]: planar frame transforms
//!   used to project sensor samples into the world.

pub mod grid;
pub mod planner;
pub mod transform;

pub use grid::{Cell, GridConfig, OccupancyGrid, SharedGrid};
pub use planner::{Path, PathPlanner, PlanOutcome, PlannerConfig};
pub use transform::Pose2;
