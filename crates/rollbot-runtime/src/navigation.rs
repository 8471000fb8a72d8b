//! [`NavigationLoop`] – drives the robot through a queue of objectives.
//!
//! For each objective the loop takes a revision-stamped snapshot of the
//! shared grid and the current pose, plans a route, then walks it waypoint
//! by waypoint:
//!
//! ```text
//!            ┌──────────── grid revision advanced ────────────┐
//!            ▼                                                 │
//!  snapshot + plan ──Found──► next waypoint ──► move_abs ──► wait arrival
//!            │                     │
//!      PathNotFound           none left ──► objective reached
//!            │
//!  wait for a grid change (abort after blocked_timeout)
//! ```
//!
//! Intermediate waypoints are driven to their cell centres; the final one
//! uses the objective's exact world point.  When the queue is empty the
//! robot is stopped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rollbot_hal::MotionController;
use rollbot_perception::{PathPlanner, PlanOutcome, SharedGrid};
use rollbot_types::{Objective, Point2, RobotError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// A waypoint counts as reached within this distance.
    pub arrival_distance: f32,
    pub poll_ms: u64,
    /// Fail a waypoint that is not reached in time.  `None` waits forever.
    pub arrival_timeout_ms: Option<u64>,
    /// Abandon an objective with no route for this long.  `None` waits for
    /// the map to change indefinitely.
    pub blocked_timeout_ms: Option<u64>,
    /// Initial objective queue, in world coordinates.
    pub objectives: Vec<Point2>,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            arrival_distance: 20.0,
            poll_ms: 20,
            arrival_timeout_ms: None,
            blocked_timeout_ms: None,
            objectives: Vec::new(),
        }
    }
}

/// Summary of a [`NavigationLoop::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NavigationReport {
    pub reached: usize,
    /// No route appeared before `blocked_timeout`, or the robot left the grid.
    pub aborted: usize,
    /// Objective outside the grid.
    pub skipped: usize,
    pub replans: usize,
    /// Shutdown was requested before the queue drained.
    pub interrupted: bool,
}

/// Stops a [`NavigationLoop`] from another thread, including while it is
/// parked on the emergency-stop interlock.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    controller: Arc<MotionController>,
}

impl ShutdownHandle {
    /// Set the shutdown flag and abort the controller's command gate.  The
    /// robot is not moved; pair with an emergency stop to halt it.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.controller.abort();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a leg towards one waypoint ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Arrived,
    MapChanged,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Reached,
    Aborted,
    Skipped,
    Interrupted,
}

pub struct NavigationLoop {
    controller: Arc<MotionController>,
    grid: Arc<SharedGrid>,
    planner: PathPlanner,
    config: NavigationConfig,
    objectives: VecDeque<Objective>,
    shutdown: Arc<AtomicBool>,
}

impl NavigationLoop {
    pub fn new(
        controller: Arc<MotionController>,
        grid: Arc<SharedGrid>,
        planner: PathPlanner,
        config: NavigationConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let objectives = config.objectives.iter().copied().map(Objective::new).collect();
        Self {
            controller,
            grid,
            planner,
            config,
            objectives,
            shutdown,
        }
    }

    /// Queue another objective.
    pub fn push(&mut self, target: Point2) -> Uuid {
        let objective = Objective::new(target);
        let id = objective.id;
        self.objectives.push_back(objective);
        id
    }

    pub fn pending(&self) -> usize {
        self.objectives.len()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            controller: self.controller.clone(),
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_ms.max(1))
    }

    /// Work through the queue, then stop the robot.
    ///
    /// # Errors
    ///
    /// Communication errors abort the run; the robot is not stopped in that
    /// case since the bus is the thing that failed.  An `arrival_timeout`
    /// that elapses surfaces as [`RobotError::Timeout`].
    pub fn run(&mut self) -> Result<NavigationReport, RobotError> {
        let mut report = NavigationReport::default();
        info!(objectives = self.objectives.len(), "navigation started");

        while let Some(objective) = self.objectives.pop_front() {
            let outcome = match self.pursue(&objective, &mut report) {
                Ok(outcome) => outcome,
                Err(RobotError::Interrupted { .. }) => Outcome::Interrupted,
                Err(err) => return Err(err),
            };
            match outcome {
                Outcome::Reached => report.reached += 1,
                Outcome::Aborted => report.aborted += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Interrupted => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        // Fire-and-forget: nothing is left to wait for, and an aborted gate
        // refuses readiness waits.
        self.controller.set_running(false, Some(false))?;
        info!(
            reached = report.reached,
            aborted = report.aborted,
            skipped = report.skipped,
            replans = report.replans,
            interrupted = report.interrupted,
            "navigation finished"
        );
        Ok(report)
    }

    #[instrument(
        skip_all,
        fields(objective = %objective.id, x = objective.target.x, y = objective.target.y)
    )]
    fn pursue(
        &self,
        objective: &Objective,
        report: &mut NavigationReport,
    ) -> Result<Outcome, RobotError> {
        let goal = match self.grid.read(|grid| grid.world_to_cell(objective.target)) {
            Ok(cell) => cell,
            Err(err) => {
                warn!(error = %err, "objective outside the grid, skipping");
                return Ok(Outcome::Skipped);
            }
        };
        let mut blocked_since: Option<Instant> = None;

        'plan: loop {
            if self.shutting_down() {
                return Ok(Outcome::Interrupted);
            }

            let (grid, revision) = self.grid.snapshot();
            let here = self.controller.pose_xy()?;
            let start = match grid.world_to_cell(here) {
                Ok(cell) => cell,
                Err(err) => {
                    warn!(error = %err, "robot is off the grid, abandoning objective");
                    return Ok(Outcome::Aborted);
                }
            };

            let path = match self.planner.plan(&grid, start, goal)? {
                PlanOutcome::Found(path) => path,
                PlanOutcome::PathNotFound => {
                    let since = *blocked_since.get_or_insert_with(Instant::now);
                    debug!(revision, %start, %goal, "no route, waiting for the map to change");
                    loop {
                        if self.shutting_down() {
                            return Ok(Outcome::Interrupted);
                        }
                        if self.grid.revision() != revision {
                            continue 'plan;
                        }
                        if let Some(limit) = self.config.blocked_timeout_ms.map(Duration::from_millis)
                            && since.elapsed() >= limit
                        {
                            warn!(waited_ms = limit.as_millis() as u64, "no route, abandoning objective");
                            return Ok(Outcome::Aborted);
                        }
                        thread::sleep(self.poll_interval());
                    }
                }
            };
            blocked_since = None;
            debug!(revision, waypoints = path.len(), "following plan");

            let mut targets: Vec<Point2> = path.waypoints()[1..]
                .iter()
                .map(|cell| grid.cell_center(*cell))
                .collect();
            match targets.last_mut() {
                Some(last) => *last = objective.target,
                None => targets.push(objective.target),
            }

            for target in targets {
                if self.grid.revision() != revision {
                    report.replans += 1;
                    debug!(
                        planned_at = revision,
                        now = self.grid.revision(),
                        "map changed, replanning"
                    );
                    continue 'plan;
                }
                match self.drive_to(target, revision)? {
                    Leg::Arrived => {}
                    Leg::MapChanged => {
                        report.replans += 1;
                        debug!(
                            planned_at = revision,
                            now = self.grid.revision(),
                            "map changed under way, replanning"
                        );
                        continue 'plan;
                    }
                    Leg::Interrupted => return Ok(Outcome::Interrupted),
                }
            }

            info!("objective reached");
            return Ok(Outcome::Reached);
        }
    }

    /// Move to `target` and poll the pose until within `arrival_distance`.
    ///
    /// The order is issued again whenever the controller is idle short of
    /// the target: it reports ready for order, or an emergency stop fired
    /// since the order went out.  The leg ends early when the grid moves
    /// past `revision` or on shutdown.
    fn drive_to(&self, target: Point2, revision: u64) -> Result<Leg, RobotError> {
        let started = Instant::now();
        // Stop generation observed when the current order was issued.
        let mut issued: Option<u64> = None;

        loop {
            if self.shutting_down() {
                return Ok(Leg::Interrupted);
            }
            if self.controller.pose_xy()?.distance(&target) <= self.config.arrival_distance {
                return Ok(Leg::Arrived);
            }
            if self.grid.revision() != revision {
                return Ok(Leg::MapChanged);
            }

            let idle = match issued {
                None => true,
                Some(generation) => {
                    self.controller.stop_generation() != generation
                        || self.controller.ready_for_order()?
                }
            };
            if idle {
                if issued.is_some() {
                    debug!(x = target.x, y = target.y, "order ended short of the waypoint, reissuing");
                }
                let generation = self.controller.stop_generation();
                let cmd = self.controller.move_abs(target, None)?;
                debug!(x = target.x, y = target.y, distance = cmd.distance, angle = cmd.angle, "waypoint");
                issued = Some(generation);

                // Nothing on the other end reports progress.
                if self.controller.gate().channel().is_simulated() {
                    return Ok(Leg::Arrived);
                }
            }

            if let Some(limit) = self.config.arrival_timeout_ms.map(Duration::from_millis)
                && started.elapsed() >= limit
            {
                return Err(RobotError::Timeout {
                    operation: format!("arrival at ({}, {})", target.x, target.y),
                    waited_ms: limit.as_millis() as u64,
                });
            }
            thread::sleep(self.poll_interval());
        }
    }
}
