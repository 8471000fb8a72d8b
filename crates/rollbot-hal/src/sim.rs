//! In-process simulation of the robot's buses and sensors, for tests and
//! headless runs without hardware.
//!
//! * [`RecordingBus`] – logs every transaction and answers reads from a
//!   scripted response table.
//! * [`KinematicBus`] – decodes the motion-controller register map and
//!   integrates moves into an ideal pose, so navigation can run end to end.
//! * [`ScriptedSensor`] – replays a fixed list of sweeps or failures.
//! * [`SimLidar`] – ranges a set of point obstacles from the kinematic pose.
//!
//! # Example
//!
//! ```rust
//! use rollbot_hal::channel::{register, RegisterChannel};
//! use rollbot_hal::sim::KinematicBus;
//!
//! let (bus, base) = KinematicBus::new();
//! let channel = RegisterChannel::new(0x42, Box::new(bus));
//!
//! channel.write_bool(0, true).unwrap();
//! channel.write_f32s(1, &[100.0, 0.0]).unwrap();
//!
//! let [x, _y] = channel.read_f32s::<2>(register(3, 1).unwrap()).unwrap();
//! assert!((x - 100.0).abs() < 1e-3);
//! assert_eq!(base.snapshot().moves, 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rollbot_types::{Point2, RobotError, SensorSample, SensorSweep};

use crate::channel::{RegisterBus, decode_f32s, encode_f32s};
use crate::gate::REG_READY;
use crate::lidar::RangeSensor;
use crate::motion::normalize_angle;

// ────────────────────────────────────────────────────────────────────────────
// Recording bus
// ────────────────────────────────────────────────────────────────────────────

/// One bus transaction as seen by a [`RecordingBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Write { register: u8, data: Vec<u8> },
    Read { register: u8, len: usize },
}

#[derive(Debug, Default)]
struct LogState {
    transactions: Vec<Transaction>,
    responses: HashMap<u8, Vec<u8>>,
    fail_next: Option<String>,
}

/// Shared view of a [`RecordingBus`], kept by the test after the bus itself
/// has been moved into a channel.
#[derive(Debug, Clone, Default)]
pub struct BusLog(Arc<Mutex<LogState>>);

impl BusLog {
    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.clone()
    }

    /// Payloads written to `register`, oldest first.
    pub fn writes_to(&self, register: u8) -> Vec<Vec<u8>> {
        self.lock()
            .transactions
            .iter()
            .filter_map(|t| match t {
                Transaction::Write { register: r, data } if *r == register => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn reads_of(&self, register: u8) -> usize {
        self.lock()
            .transactions
            .iter()
            .filter(|t| matches!(t, Transaction::Read { register: r, .. } if *r == register))
            .count()
    }

    /// Answer future reads of `register` with `bytes` (truncated or
    /// zero-padded to the requested length).
    pub fn set_response(&self, register: u8, bytes: Vec<u8>) {
        self.lock().responses.insert(register, bytes);
    }

    /// Fail the next transaction with an I/O error.
    pub fn fail_next(&self, message: &str) {
        self.lock().fail_next = Some(message.to_string());
    }

    /// Forget recorded transactions; responses are kept.
    pub fn clear(&self) {
        self.lock().transactions.clear();
    }
}

/// A [`RegisterBus`] that records traffic.  Unscripted reads are
/// zero-filled, except ready-for-order which reports `true`.
#[derive(Debug, Clone)]
pub struct RecordingBus {
    log: BusLog,
}

impl RecordingBus {
    pub fn new() -> Self {
        let log = BusLog::default();
        log.set_response(REG_READY, vec![1]);
        Self { log }
    }

    pub fn log(&self) -> BusLog {
        self.log.clone()
    }
}

impl Default for RecordingBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBus for RecordingBus {
    fn write_block(&mut self, _address: u8, register: u8, data: &[u8]) -> io::Result<()> {
        let mut state = self.log.lock();
        if let Some(msg) = state.fail_next.take() {
            return Err(io::Error::other(msg));
        }
        state.transactions.push(Transaction::Write {
            register,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn read_block(&mut self, _address: u8, register: u8, buf: &mut [u8]) -> io::Result<()> {
        let mut state = self.log.lock();
        if let Some(msg) = state.fail_next.take() {
            return Err(io::Error::other(msg));
        }
        state.transactions.push(Transaction::Read {
            register,
            len: buf.len(),
        });
        buf.fill(0);
        if let Some(bytes) = state.responses.get(&register) {
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Kinematic base
// ────────────────────────────────────────────────────────────────────────────

/// State of the simulated differential base.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimBaseState {
    pub running: bool,
    pub position: Point2,
    pub heading: f32,
    /// Total distance driven.
    pub rho: f32,
    pub moves: usize,
    /// Position before the first move and after every move.
    pub trail: Vec<Point2>,
    pub emergency_stops: usize,
    pub motors_enabled: bool,
    /// Signed distance still to drive on the current order.
    remaining: f32,
    pid_gains: HashMap<u8, [f32; 3]>,
    profiles: HashMap<u8, [f32; 2]>,
}

/// Handle on the simulated base shared by the bus and the [`SimLidar`].
#[derive(Debug, Clone, Default)]
pub struct SimBase(Arc<Mutex<SimBaseState>>);

impl SimBase {
    fn lock(&self) -> MutexGuard<'_, SimBaseState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SimBaseState {
        self.lock().clone()
    }

    /// Teleport the base.  Cancels any order in progress.
    pub fn place(&self, position: Point2, heading: f32) {
        let mut state = self.lock();
        state.position = position;
        state.heading = normalize_angle(heading);
        state.remaining = 0.0;
    }
}

impl SimBaseState {
    /// An order is still being driven.
    pub fn is_moving(&self) -> bool {
        self.remaining != 0.0
    }

    fn advance(&mut self, distance: f32) {
        let (sin, cos) = self.heading.sin_cos();
        self.position.x += distance * cos;
        self.position.y += distance * sin;
        self.rho += distance;
    }

    /// Drive up to `step` of the current order.
    fn tick(&mut self, step: f32) {
        if !self.is_moving() {
            return;
        }
        let leg = self.remaining.signum() * step.min(self.remaining.abs());
        self.advance(leg);
        self.remaining -= leg;
        if self.remaining.abs() <= f32::EPSILON {
            self.finish_order();
        }
    }

    fn finish_order(&mut self) {
        self.remaining = 0.0;
        let here = self.position;
        self.trail.push(here);
    }

    /// Halt wherever the base is.
    fn halt(&mut self) {
        if self.is_moving() {
            self.finish_order();
        }
    }
}

/// A [`RegisterBus`] implementing the motion-controller register map over
/// a kinematic model of a differential base.
///
/// By default every accepted move completes instantly, so ready-for-order
/// always reads `true`.  With [`KinematicBus::stepped`] an order is driven
/// `step` units per bus read instead: ready-for-order reads `false` until it
/// completes, and an emergency stop or a stop order halts the base where it
/// is.  A move is only accepted while the base is running.
#[derive(Debug, Clone)]
pub struct KinematicBus {
    base: SimBase,
    step: Option<f32>,
}

impl KinematicBus {
    pub fn new() -> (Self, SimBase) {
        let base = SimBase::default();
        (Self::with_base(base.clone()), base)
    }

    pub fn with_base(base: SimBase) -> Self {
        Self { base, step: None }
    }

    /// Drive orders `step` units per bus read rather than instantly.
    pub fn stepped(mut self, step: f32) -> Self {
        self.step = Some(step.abs());
        self
    }
}

fn split(register: u8) -> (u8, u8) {
    (register & 0x0f, register >> 4)
}

fn invalid(what: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, what.into())
}

impl RegisterBus for KinematicBus {
    fn write_block(&mut self, _address: u8, register: u8, data: &[u8]) -> io::Result<()> {
        let mut state = self.base.lock();
        match split(register) {
            (0, 0) => {
                state.running = data.first() == Some(&1);
                if !state.running {
                    state.halt();
                }
            }
            (0, 1) => {
                state.emergency_stops += 1;
                state.halt();
            }
            (1, 0) => {
                let [distance, angle] =
                    decode_f32s::<2>(data).map_err(|e| invalid(e.to_string()))?;
                if state.running {
                    state.halt();
                    if state.trail.is_empty() {
                        let start = state.position;
                        state.trail.push(start);
                    }
                    state.heading = normalize_angle(state.heading + angle);
                    state.moves += 1;
                    match self.step {
                        Some(_) if distance != 0.0 => state.remaining = distance,
                        _ => {
                            state.advance(distance);
                            state.finish_order();
                        }
                    }
                }
            }
            (5, idx) => {
                let gains = decode_f32s::<3>(data).map_err(|e| invalid(e.to_string()))?;
                state.pid_gains.insert(idx, gains);
            }
            (6, _) => {}
            (11, 3) => state.motors_enabled = data.first() == Some(&1),
            (13, axis) => {
                let profile = decode_f32s::<2>(data).map_err(|e| invalid(e.to_string()))?;
                state.profiles.insert(axis, profile);
            }
            _ => return Err(invalid(format!("register 0x{register:02x} is not writable"))),
        }
        Ok(())
    }

    fn read_block(&mut self, _address: u8, register: u8, buf: &mut [u8]) -> io::Result<()> {
        let mut state = self.base.lock();
        if let Some(step) = self.step {
            state.tick(step);
        }
        let bytes = match split(register) {
            (2, idx) => encode_f32s(&state.pid_gains.get(&idx).copied().unwrap_or_default()),
            (3, 0) => encode_f32s(&[state.rho, state.heading]),
            (3, 1) => encode_f32s(&[state.position.x, state.position.y]),
            (10, 0) => vec![u8::from(!state.is_moving())],
            (11, 0) => vec![0; 8],
            // Reaching distance / reached target.
            (11, 4) => vec![if state.is_moving() { 1 } else { 2 }],
            (12, axis) => encode_f32s(&state.profiles.get(&axis).copied().unwrap_or_default()),
            _ => return Err(invalid(format!("register 0x{register:02x} is not readable"))),
        };
        if bytes.len() != buf.len() {
            return Err(invalid(format!(
                "register 0x{register:02x} holds {} bytes, {} requested",
                bytes.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&bytes);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sensors
// ────────────────────────────────────────────────────────────────────────────

/// Replays scripted sweeps in order.  Once the script is exhausted every
/// further sweep is empty.
#[derive(Debug, Default)]
pub struct ScriptedSensor {
    id: String,
    script: VecDeque<Result<Vec<SensorSample>, RobotError>>,
}

impl ScriptedSensor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: VecDeque::new(),
        }
    }

    pub fn then_sweep(mut self, samples: Vec<SensorSample>) -> Self {
        self.script.push_back(Ok(samples));
        self
    }

    pub fn then_fail(mut self, details: &str) -> Self {
        self.script.push_back(Err(RobotError::Sensor {
            sensor: self.id.clone(),
            details: details.to_string(),
        }));
        self
    }
}

impl RangeSensor for ScriptedSensor {
    fn id(&self) -> &str {
        &self.id
    }

    fn sweep(&mut self) -> Result<SensorSweep, RobotError> {
        let samples = self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))?;
        Ok(SensorSweep::now(samples))
    }
}

/// Ranges point obstacles from the pose of a [`SimBase`]: one sample per
/// obstacle within `max_range`, bearing relative to the base heading.
#[derive(Debug, Clone)]
pub struct SimLidar {
    base: SimBase,
    obstacles: Arc<Mutex<Vec<Point2>>>,
    max_range: f32,
}

impl SimLidar {
    pub fn new(base: SimBase, obstacles: Vec<Point2>, max_range: f32) -> Self {
        Self {
            base,
            obstacles: Arc::new(Mutex::new(obstacles)),
            max_range,
        }
    }

    /// Drop an obstacle into the world while the simulation runs.
    pub fn add_obstacle(&self, obstacle: Point2) {
        self.obstacles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(obstacle);
    }

    /// Take every obstacle at `obstacle` out of the world.
    pub fn remove_obstacle(&self, obstacle: Point2) {
        self.obstacles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|o| *o != obstacle);
    }
}

impl RangeSensor for SimLidar {
    fn id(&self) -> &str {
        "sim_lidar"
    }

    fn sweep(&mut self) -> Result<SensorSweep, RobotError> {
        let pose = self.base.snapshot();
        let obstacles = self.obstacles.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = obstacles
            .iter()
            .filter_map(|o| {
                let distance = pose.position.distance(o);
                (distance > 0.0 && distance <= self.max_range).then(|| SensorSample {
                    angle: normalize_angle(
                        (o.y - pose.position.y).atan2(o.x - pose.position.x) - pose.heading,
                    ),
                    distance,
                })
            })
            .collect();
        Ok(SensorSweep::now(samples))
    }
}
