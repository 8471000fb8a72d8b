//! `rollbot-cli` – process assembly for the rollbot navigation stack.
//!
//! This binary:
//!
//! 1. Initialises tracing and loads `~/.rollbot/config.toml` (or the path
//!    given as the first argument), applying `ROLLBOT_*` overrides.
//! 2. Builds the device channel for the configured backend, the motion
//!    controller, the shared occupancy grid and the range sensor.
//! 3. Runs the [`SafetyMonitor`] and the [`NavigationLoop`] on their own
//!    threads until the objective queue drains.
//! 4. Intercepts **Ctrl-C** to fire an emergency stop, then shuts down both
//!    loops and aborts any command waiting on the interlock.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use rollbot_hal::sim::{KinematicBus, ScriptedSensor, SimBase, SimLidar};
use rollbot_hal::{MotionController, RangeSensor, RegisterChannel};
use rollbot_kernel::SafetyMonitor;
use rollbot_perception::{OccupancyGrid, PathPlanner, SharedGrid};
use rollbot_runtime::{NavigationLoop, NavigationReport, init_tracing};
use rollbot_types::RobotError;
use tracing::{error, info, warn};

use crate::config::{Backend, Config};

fn main() -> ExitCode {
    let _guard = init_tracing("rollbot");

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);

    let cfg = match config::load_or_default(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = %path.display(), error = %e, "configuration rejected");
            return ExitCode::FAILURE;
        }
    };
    info!(
        path = %path.display(),
        backend = %cfg.device.backend,
        address = cfg.device.address,
        objectives = cfg.navigation.objectives.len(),
        "configuration loaded"
    );

    match run(cfg) {
        Ok(report) => {
            info!(
                reached = report.reached,
                aborted = report.aborted,
                skipped = report.skipped,
                replans = report.replans,
                interrupted = report.interrupted,
                "navigation finished"
            );
            if report.interrupted {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %e, "rollbot stopped on error");
            ExitCode::FAILURE
        }
    }
}

/// Build the device side: channel plus the range sensor watching it.
fn build_device(cfg: &Config) -> (RegisterChannel, Box<dyn RangeSensor>) {
    let address = cfg.device.address;
    match cfg.device.backend {
        Backend::Simulate => {
            // No transport means no sweeps either; the monitor sees an empty
            // world and never holds the robot.
            (
                RegisterChannel::simulated(address),
                Box::new(ScriptedSensor::new("none")),
            )
        }
        Backend::KinematicSim => {
            let base = SimBase::default();
            base.place(cfg.sim.start, cfg.sim.start_heading);
            let lidar = SimLidar::new(base.clone(), cfg.sim.obstacles.clone(), cfg.sim.lidar_range);
            (
                RegisterChannel::new(address, Box::new(KinematicBus::with_base(base))),
                Box::new(lidar),
            )
        }
    }
}

fn run(cfg: Config) -> Result<NavigationReport, RobotError> {
    let (channel, sensor) = build_device(&cfg);
    let controller = Arc::new(MotionController::new(Arc::new(channel), cfg.gate)?);
    let grid = Arc::new(SharedGrid::new(OccupancyGrid::from_config(&cfg.grid)?));
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut monitor = SafetyMonitor::new(sensor, controller.clone(), grid.clone(), cfg.safety);
    let mut navigation = NavigationLoop::new(
        controller.clone(),
        grid,
        PathPlanner::new(&cfg.planner),
        cfg.navigation,
        shutdown.clone(),
    );
    let handle = navigation.shutdown_handle();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    {
        let controller = controller.clone();
        let handle = handle.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("Ctrl-C received, emergency stop");
            if let Err(e) = controller.emergency_stop() {
                error!(error = %e, "emergency stop failed");
            }
            // Releases a navigation thread parked on the interlock.
            handle.trigger();
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler; Ctrl-C will not stop the robot");
        }
    }

    controller.start()?;

    let safety = {
        let shutdown = shutdown.clone();
        thread::spawn(move || monitor.run(&shutdown))
    };
    let navigation = thread::spawn(move || navigation.run());

    let result = navigation
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));

    if result.is_err()
        && let Err(e) = controller.set_running(false, Some(false))
    {
        warn!(error = %e, "could not stop the robot after a navigation failure");
    }
    handle.trigger();

    match safety.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "safety monitor failed"),
        Err(panic) => std::panic::resume_unwind(panic),
    }
    result
}
