//! [`MotionController`] – domain operations of the motion-control
//! microcontroller, expressed as gated register transactions.
//!
//! | Operation | Register | Policy |
//! |---|---|---|
//! | [`set_running`](MotionController::set_running) | W `0` | always permitted, default blocking |
//! | [`emergency_stop`](MotionController::emergency_stop) | W `0 \| 1<<4` | direct |
//! | [`move_by`](MotionController::move_by) | W `1` | stoppable, default blocking |
//! | [`read_pid`](MotionController::read_pid) / [`set_pid`](MotionController::set_pid) | R `2 \| idx<<4` / W `5 \| idx<<4` | direct |
//! | [`pose`](MotionController::pose) / [`pose_xy`](MotionController::pose_xy) | R `3 \| 0<<4` / R `3 \| 1<<4` | direct |
//! | [`set_telemetry`](MotionController::set_telemetry) | W `6 \| idx<<4` | direct |
//! | [`speed_profile`](MotionController::speed_profile) / [`set_speed_profile`](MotionController::set_speed_profile) | R `12 \| axis<<4` / W `13 \| axis<<4` | direct |
//!
//! The controller is `Sync`: wrap it in an `Arc` and share it between the
//! navigation and safety threads.

use std::f32::consts::{PI, TAU};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rollbot_types::{CommandState, Point2, PolarPose, RobotError, SpeedProfile};
use tracing::{debug, info};

use crate::channel::{RegisterChannel, register};
use crate::gate::{CommandGate, CommandPolicy, GateConfig, SafetyAction};
use crate::pid::{
    ChannelId, PidParameters, ProfileAxis, TelemetryChannel, default_pid_table, lookup,
    telemetry_for,
};

const REG_RUNNING: u8 = 0;
const REG_MOVE: u8 = 1;
const REG_PID_GET: u8 = 2;
const REG_POSE: u8 = 3;
const REG_PID_SET: u8 = 5;
const REG_TELEMETRY: u8 = 6;
const REG_DEBUG: u8 = 11;
const REG_PROFILE_GET: u8 = 12;
const REG_PROFILE_SET: u8 = 13;

/// Position-loop phase reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    ReachingTheta,
    ReachingDistance,
    ReachedTarget,
}

impl TryFrom<u8> for ControllerState {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ControllerState::ReachingTheta),
            1 => Ok(ControllerState::ReachingDistance),
            2 => Ok(ControllerState::ReachedTarget),
            other => Err(other),
        }
    }
}

/// A relative move as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveCommand {
    pub distance: f32,
    /// Turn performed before driving, in `(-π, π]`.
    pub angle: f32,
}

/// Wrap `angle` into `(-π, π]`.
pub fn normalize_angle(angle: f32) -> f32 {
    let wrapped = angle.rem_euclid(TAU);
    if wrapped > PI { wrapped - TAU } else { wrapped }
}

/// Writes the emergency-stop register.  Installed as the gate's safety
/// action so the interlock edge halts the motors.
struct EmergencyStop;

impl SafetyAction for EmergencyStop {
    fn engage(&self, channel: &RegisterChannel) -> Result<(), RobotError> {
        channel.write_command(register(REG_RUNNING, 1)?)
    }
}

fn ensure_finite(what: &str, values: &[f32]) -> Result<(), RobotError> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(RobotError::validation(format!("{what}: arguments must be finite, got {values:?}")))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MotionController
// ────────────────────────────────────────────────────────────────────────────

pub struct MotionController {
    gate: CommandGate,
    running: AtomicBool,
    pids: Mutex<Vec<PidParameters>>,
    telemetry: Vec<TelemetryChannel>,
}

impl MotionController {
    /// Bring up the controller: stop the device, read back every PID loop
    /// and silence every telemetry stream.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Communication`] if the device does not answer.
    pub fn new(channel: Arc<RegisterChannel>, config: GateConfig) -> Result<Self, RobotError> {
        let pids = default_pid_table();
        let controller = Self {
            gate: CommandGate::new(channel, config, Box::new(EmergencyStop)),
            running: AtomicBool::new(false),
            telemetry: telemetry_for(&pids),
            pids: Mutex::new(pids),
        };

        controller.set_running(false, None)?;
        for idx in controller.pid_indices() {
            controller.read_pid(&ChannelId::Index(idx))?;
        }
        for telem in &controller.telemetry {
            controller.set_telemetry(&ChannelId::Index(telem.index), false)?;
        }
        info!(
            address = controller.gate.channel().address(),
            simulated = controller.gate.channel().is_simulated(),
            "motion controller initialised"
        );
        Ok(controller)
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    pub fn command_state(&self) -> CommandState {
        CommandState {
            running: self.is_running(),
            blocking: self.gate.is_blocking(),
            interlocked: self.gate.is_interlocked(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_blocking(&self) -> bool {
        self.gate.is_blocking()
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.gate.set_blocking(blocking);
    }

    // ── Interlock ──────────────────────────────────────────────────────────

    /// Assert the emergency-stop interlock.  Only the first assertion after
    /// a clear writes the emergency-stop register.
    pub fn assert_stop(&self) -> Result<bool, RobotError> {
        self.gate.assert_stop()
    }

    pub fn clear_stop(&self) -> bool {
        self.gate.clear_stop()
    }

    pub fn is_interlocked(&self) -> bool {
        self.gate.is_interlocked()
    }

    /// See [`CommandGate::stop_generation`].
    pub fn stop_generation(&self) -> u64 {
        self.gate.stop_generation()
    }

    /// Shut the gate: parked and future motion commands fail with
    /// [`RobotError::Interrupted`].  Does not move the robot.
    pub fn abort(&self) {
        self.gate.abort();
    }

    // ── Orders ─────────────────────────────────────────────────────────────

    pub fn set_running(&self, state: bool, blocking: Option<bool>) -> Result<(), RobotError> {
        self.gate.run(
            CommandPolicy::unconditional().with_blocking(blocking),
            |ch| ch.write_bool(REG_RUNNING, state),
        )?;
        self.running.store(state, Ordering::SeqCst);
        debug!(state, "running state written");
        Ok(())
    }

    pub fn start(&self) -> Result<(), RobotError> {
        self.set_running(true, None)
    }

    pub fn stop(&self) -> Result<(), RobotError> {
        self.set_running(false, None)
    }

    /// Turn by `angle` radians then drive `distance`.  Held back while the
    /// interlock is asserted.
    pub fn move_by(
        &self,
        distance: f32,
        angle: f32,
        blocking: Option<bool>,
    ) -> Result<(), RobotError> {
        ensure_finite("move", &[distance, angle])?;
        self.gate.run(CommandPolicy::stoppable().with_blocking(blocking), |ch| {
            debug!(distance, angle, "move");
            ch.write_f32s(REG_MOVE, &[distance, angle])
        })
    }

    /// Drive in a straight line to `target` (world frame).
    ///
    /// The turn is derived from the current heading and Cartesian pose,
    /// which are two separate reads.
    pub fn move_abs(&self, target: Point2, blocking: Option<bool>) -> Result<MoveCommand, RobotError> {
        ensure_finite("move_abs", &[target.x, target.y])?;
        let polar = self.pose()?;
        let here = self.pose_xy()?;
        let cmd = relative_move(polar.theta, here, target);
        self.move_by(cmd.distance, cmd.angle, blocking)?;
        Ok(cmd)
    }

    /// Halt immediately, bypassing the gate.
    pub fn emergency_stop(&self) -> Result<(), RobotError> {
        EmergencyStop.engage(self.gate.channel())
    }

    pub fn ready_for_order(&self) -> Result<bool, RobotError> {
        self.gate.ready_for_order()
    }

    pub fn wait_completed(&self) -> Result<(), RobotError> {
        self.gate.wait_completed()
    }

    // ── Odometry ───────────────────────────────────────────────────────────

    pub fn pose(&self) -> Result<PolarPose, RobotError> {
        let [rho, theta] = self.gate.channel().read_f32s::<2>(register(REG_POSE, 0)?)?;
        Ok(PolarPose { rho, theta })
    }

    pub fn pose_xy(&self) -> Result<Point2, RobotError> {
        let [x, y] = self.gate.channel().read_f32s::<2>(register(REG_POSE, 1)?)?;
        Ok(Point2 { x, y })
    }

    // ── PID ────────────────────────────────────────────────────────────────

    /// Resolve `id` against the local PID table.
    pub fn lookup_pid(&self, id: &ChannelId) -> Option<PidParameters> {
        let pids = self.pids.lock().unwrap_or_else(PoisonError::into_inner);
        lookup(&pids, id).cloned()
    }

    pub fn pids(&self) -> Vec<PidParameters> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Read the gains of one loop from the device and cache them.
    pub fn read_pid(&self, id: &ChannelId) -> Result<PidParameters, RobotError> {
        let mut pid = self.resolve_pid(id)?;
        let bytes = self
            .gate
            .channel()
            .read(register(REG_PID_GET, pid.index)?, PidParameters::WIRE_LEN)?;
        pid.from_bytes(&bytes)?;
        self.store_pid(&pid);
        Ok(pid)
    }

    pub fn set_pid(&self, id: &ChannelId, kp: f32, ki: f32, kd: f32) -> Result<PidParameters, RobotError> {
        ensure_finite("set_pid", &[kp, ki, kd])?;
        let mut pid = self.resolve_pid(id)?;
        pid.set(kp, ki, kd);
        self.gate
            .channel()
            .write(register(REG_PID_SET, pid.index)?, &pid.to_bytes())?;
        self.store_pid(&pid);
        info!(%pid, "pid updated");
        Ok(pid)
    }

    fn resolve_pid(&self, id: &ChannelId) -> Result<PidParameters, RobotError> {
        self.lookup_pid(id)
            .ok_or_else(|| RobotError::validation(format!("unknown PID channel {id}")))
    }

    fn store_pid(&self, pid: &PidParameters) {
        let mut pids = self.pids.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = pids.iter_mut().find(|p| p.index == pid.index) {
            *slot = pid.clone();
        }
    }

    fn pid_indices(&self) -> Vec<u8> {
        self.pids().iter().map(|p| p.index).collect()
    }

    // ── Telemetry ──────────────────────────────────────────────────────────

    pub fn set_telemetry(&self, id: &ChannelId, enabled: bool) -> Result<(), RobotError> {
        let telem = lookup(&self.telemetry, id)
            .ok_or_else(|| RobotError::validation(format!("unknown telemetry channel {id}")))?;
        self.gate
            .channel()
            .write_bool(register(REG_TELEMETRY, telem.index)?, enabled)
    }

    // ── Speed profiles ─────────────────────────────────────────────────────

    pub fn speed_profile(&self, axis: ProfileAxis) -> Result<SpeedProfile, RobotError> {
        let [vmax, amax] = self
            .gate
            .channel()
            .read_f32s::<2>(register(REG_PROFILE_GET, axis.index())?)?;
        Ok(SpeedProfile { vmax, amax })
    }

    pub fn set_speed_profile(&self, axis: ProfileAxis, vmax: f32, amax: f32) -> Result<(), RobotError> {
        ensure_finite("set_speed_profile", &[vmax, amax])?;
        if vmax <= 0.0 || amax <= 0.0 {
            return Err(RobotError::validation(format!(
                "speed profile limits must be positive, got vmax={vmax} amax={amax}"
            )));
        }
        self.gate
            .channel()
            .write_f32s(register(REG_PROFILE_SET, axis.index())?, &[vmax, amax])
    }

    // ── Diagnostics ────────────────────────────────────────────────────────

    /// Raw left/right encoder ticks.
    pub fn encoder_ticks(&self) -> Result<(i32, i32), RobotError> {
        let [left, right] = self.gate.channel().read_i32s::<2>(register(REG_DEBUG, 0)?)?;
        Ok((left, right))
    }

    pub fn set_motors_enabled(&self, enabled: bool) -> Result<(), RobotError> {
        self.gate.channel().write_bool(register(REG_DEBUG, 3)?, enabled)
    }

    pub fn controller_state(&self) -> Result<ControllerState, RobotError> {
        let raw = self.gate.channel().read_u8(register(REG_DEBUG, 4)?)?;
        ControllerState::try_from(raw).map_err(|raw| RobotError::Communication {
            address: self.gate.channel().address(),
            details: format!("unexpected controller state {raw}"),
        })
    }
}

/// Planar turn-then-drive from `here` with heading `theta` to `target`.
pub fn relative_move(theta: f32, here: Point2, target: Point2) -> MoveCommand {
    let dx = target.x - here.x;
    let dy = target.y - here.y;
    MoveCommand {
        distance: dx.hypot(dy),
        angle: normalize_angle(dy.atan2(dx) - theta),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::REG_READY;
    use crate::sim::{KinematicBus, RecordingBus, Transaction};
    use std::f32::consts::FRAC_PI_2;
    use std::thread;
    use std::time::Duration;

    fn fast() -> GateConfig {
        GateConfig {
            polling_rate_hz: 1000,
            ..GateConfig::default()
        }
    }

    fn recorded() -> (Arc<MotionController>, crate::sim::BusLog) {
        let bus = RecordingBus::new();
        let log = bus.log();
        let channel = Arc::new(RegisterChannel::new(0x42, Box::new(bus)));
        let controller = MotionController::new(channel, fast()).unwrap();
        log.clear();
        (Arc::new(controller), log)
    }

    #[test]
    fn normalize_angle_range() {
        assert!((normalize_angle(3.0 * PI / 2.0) + FRAC_PI_2).abs() < 1e-5);
        assert!((normalize_angle(-3.0 * PI / 2.0) - FRAC_PI_2).abs() < 1e-5);
        assert!((normalize_angle(PI) - PI).abs() < 1e-5);
        assert!((normalize_angle(-PI) - PI).abs() < 1e-5);
        assert!((normalize_angle(0.25) - 0.25).abs() < 1e-6);
        for k in -8..8 {
            let a = normalize_angle(0.3 + k as f32 * TAU);
            assert!(a > -PI && a <= PI);
            assert!((a - 0.3).abs() < 1e-3);
        }
    }

    #[test]
    fn relative_move_turns_shortest_way() {
        // Facing +x, target straight behind-left.
        let cmd = relative_move(0.0, Point2::new(0.0, 0.0), Point2::new(0.0, -10.0));
        assert!((cmd.distance - 10.0).abs() < 1e-5);
        assert!((cmd.angle + FRAC_PI_2).abs() < 1e-5);

        // Heading almost π, target at bearing almost -π: small turn.
        let cmd = relative_move(3.0, Point2::new(0.0, 0.0), Point2::new(-1.0, -0.2));
        assert!(cmd.angle.abs() < 0.5, "turn {} should be small", cmd.angle);
    }

    #[test]
    fn init_reads_pids_and_disables_telemetry() {
        let bus = RecordingBus::new();
        let log = bus.log();
        log.set_response(register(REG_PID_GET, 1).unwrap(), encode(&[2.0, 0.5, 0.1]));
        let channel = Arc::new(RegisterChannel::new(0x42, Box::new(bus)));
        let controller = MotionController::new(channel, fast()).unwrap();

        assert_eq!(log.writes_to(REG_RUNNING), vec![vec![0]]);
        for idx in 0..4 {
            assert_eq!(log.writes_to(register(REG_TELEMETRY, idx).unwrap()), vec![vec![0]]);
        }
        let rho = controller.lookup_pid(&"rho".into()).unwrap();
        assert_eq!((rho.kp, rho.ki, rho.kd), (2.0, 0.5, 0.1));
        assert!(!controller.is_running());
    }

    fn encode(values: &[f32]) -> Vec<u8> {
        crate::channel::encode_f32s(values)
    }

    #[test]
    fn move_writes_distance_and_angle() {
        let (controller, log) = recorded();
        controller.move_by(250.0, -0.5, None).unwrap();
        assert_eq!(log.writes_to(REG_MOVE), vec![encode(&[250.0, -0.5])]);
        // Blocking by default: readiness was polled.
        assert!(log.reads_of(REG_READY) >= 1);
    }

    #[test]
    fn move_rejects_non_finite_without_bus_traffic() {
        let (controller, log) = recorded();
        let err = controller.move_by(f32::NAN, 0.0, None).unwrap_err();
        assert!(matches!(err, RobotError::Validation(_)));
        assert!(log.transactions().is_empty());
    }

    #[test]
    fn move_blocked_until_interlock_clears() {
        let (controller, log) = recorded();
        assert!(controller.assert_stop().unwrap());
        assert_eq!(log.writes_to(register(REG_RUNNING, 1).unwrap()), vec![Vec::<u8>::new()]);

        let worker = {
            let controller = controller.clone();
            thread::spawn(move || controller.move_by(100.0, 0.0, Some(false)))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(log.writes_to(REG_MOVE).is_empty());

        // Further asserts from later sweeps do not re-send the stop.
        assert!(!controller.assert_stop().unwrap());
        assert_eq!(log.writes_to(register(REG_RUNNING, 1).unwrap()).len(), 1);

        controller.clear_stop();
        worker.join().unwrap().unwrap();
        assert_eq!(log.writes_to(REG_MOVE).len(), 1);
    }

    #[test]
    fn stop_is_permitted_while_interlocked() {
        let (controller, log) = recorded();
        controller.start().unwrap();
        controller.assert_stop().unwrap();
        controller.stop().unwrap();
        assert_eq!(log.writes_to(REG_RUNNING), vec![vec![1], vec![0]]);
        let state = controller.command_state();
        assert!(!state.running);
        assert!(state.interlocked);
    }

    #[test]
    fn unknown_pid_is_rejected_before_bus() {
        let (controller, log) = recorded();
        assert!(controller.lookup_pid(&"yaw".into()).is_none());
        let err = controller.set_pid(&"yaw".into(), 1.0, 0.0, 0.0).unwrap_err();
        assert!(matches!(err, RobotError::Validation(_)));
        let err = controller.read_pid(&ChannelId::Index(7)).unwrap_err();
        assert!(matches!(err, RobotError::Validation(_)));
        assert!(log.transactions().is_empty());
    }

    #[test]
    fn set_pid_writes_gains_to_set_register() {
        let (controller, log) = recorded();
        let pid = controller.set_pid(&"left_vel".into(), 1.0, 2.0, 3.0).unwrap();
        assert_eq!(pid.index, 2);
        assert_eq!(
            log.transactions(),
            vec![Transaction::Write {
                register: register(REG_PID_SET, 2).unwrap(),
                data: encode(&[1.0, 2.0, 3.0]),
            }]
        );
        assert_eq!(controller.lookup_pid(&ChannelId::Index(2)).unwrap().kd, 3.0);
    }

    #[test]
    fn speed_profiles_use_axis_sub_address() {
        let (controller, log) = recorded();
        log.set_response(register(REG_PROFILE_GET, 1).unwrap(), encode(&[3.0, 6.0]));
        controller.set_speed_profile(ProfileAxis::Distance, 500.0, 1000.0).unwrap();
        let angle = controller.speed_profile(ProfileAxis::Angle).unwrap();

        assert_eq!(
            log.writes_to(register(REG_PROFILE_SET, 0).unwrap()),
            vec![encode(&[500.0, 1000.0])]
        );
        assert_eq!(angle, SpeedProfile { vmax: 3.0, amax: 6.0 });
        assert!(controller.set_speed_profile(ProfileAxis::Angle, -1.0, 1.0).is_err());
    }

    #[test]
    fn telemetry_and_debug_registers() {
        let (controller, log) = recorded();
        controller.set_telemetry(&ChannelId::from(2u8), true).unwrap();
        assert_eq!(log.writes_to(register(REG_TELEMETRY, 2).unwrap()), vec![vec![1]]);
        assert!(controller.set_telemetry(&ChannelId::from(7u8), true).is_err());

        controller.set_motors_enabled(false).unwrap();
        assert_eq!(log.writes_to(register(REG_DEBUG, 3).unwrap()), vec![vec![0]]);

        let mut ticks = 1200i32.to_le_bytes().to_vec();
        ticks.extend_from_slice(&(-35i32).to_le_bytes());
        log.set_response(REG_DEBUG, ticks);
        assert_eq!(controller.encoder_ticks().unwrap(), (1200, -35));
    }

    #[test]
    fn controller_state_decodes() {
        let (controller, log) = recorded();
        log.set_response(register(REG_DEBUG, 4).unwrap(), vec![1]);
        assert_eq!(controller.controller_state().unwrap(), ControllerState::ReachingDistance);
        log.set_response(register(REG_DEBUG, 4).unwrap(), vec![9]);
        assert!(matches!(
            controller.controller_state(),
            Err(RobotError::Communication { .. })
        ));
    }

    #[test]
    fn simulated_controller_reads_zero_pose() {
        let channel = Arc::new(RegisterChannel::simulated(0x42));
        let controller = MotionController::new(channel, fast()).unwrap();
        controller.start().unwrap();
        controller.move_by(100.0, 1.0, None).unwrap();
        assert_eq!(controller.pose_xy().unwrap(), Point2::new(0.0, 0.0));
        assert_eq!(controller.pose().unwrap(), PolarPose::default());
    }

    #[test]
    fn move_abs_reaches_target_on_kinematic_base() {
        let (bus, base) = KinematicBus::new();
        let channel = Arc::new(RegisterChannel::new(0x42, Box::new(bus)));
        let controller = MotionController::new(channel, fast()).unwrap();
        controller.start().unwrap();

        controller.move_abs(Point2::new(100.0, 0.0), None).unwrap();
        let cmd = controller.move_abs(Point2::new(100.0, 100.0), None).unwrap();
        assert!((cmd.angle - FRAC_PI_2).abs() < 1e-4);

        let here = controller.pose_xy().unwrap();
        assert!(here.distance(&Point2::new(100.0, 100.0)) < 1e-2);
        assert!((controller.pose().unwrap().rho - 200.0).abs() < 1e-2);
        assert_eq!(base.snapshot().emergency_stops, 0);
    }
}
