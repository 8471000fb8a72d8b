//! `rollbot-kernel` – Safety
//!
//! The robot's brainstem. It does not plan; it watches the surroundings and
//! halts motion when something gets too close.
//!
//! # Modules
//!
//! - [`safety_monitor`] – [`SafetyMonitor`][safety_monitor::SafetyMonitor]:
//!   polls a range sensor, asserts or clears the motion controller's
//!   emergency-stop interlock from proximity, and folds obstacle returns into
//!   the shared occupancy grid.

pub mod safety_monitor;

pub use safety_monitor::{SafetyConfig, SafetyMonitor, SweepReport};
