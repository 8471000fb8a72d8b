//! `rollbot-runtime` – Navigation
//!
//! The execution engine that turns a list of destinations into motion.
//!
//! # Modules
//!
//! - [`navigation`] – [`NavigationLoop`][navigation::NavigationLoop]:
//!   consumes the objective queue, plans over a snapshot of the shared grid,
//!   drives the motion controller waypoint by waypoint and replans whenever
//!   the grid revision moves on.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   installs the global `tracing` subscriber (compact or JSON console
//!   output, optional OTLP span export).

pub mod navigation;
pub mod telemetry;

pub use navigation::{NavigationConfig, NavigationLoop, NavigationReport, ShutdownHandle};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
