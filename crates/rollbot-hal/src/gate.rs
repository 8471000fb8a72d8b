//! [`CommandGate`] – per-device execution policy.
//!
//! The gate layers two orthogonal policies on top of a [`RegisterChannel`]:
//!
//! 1. **Blocking** – after a command is issued the caller is held until the
//!    device's ready-for-order register reports `true`.  Each device has a
//!    default policy that any single call may override.
//! 2. **Stoppable / interlock** – commands marked stoppable may only *start*
//!    while the [`Interlock`] is clear, and are held again after issuing
//!    until it is clear.  Asserting the interlock is edge-triggered: only the
//!    clear → set transition fires the device's [`SafetyAction`].
//!
//! ```text
//! CLEAR        --assert_stop--> INTERLOCKED  (fires safety action once)
//! INTERLOCKED  --assert_stop--> INTERLOCKED  (no-op)
//! INTERLOCKED  --clear_stop-->  CLEAR        (releases waiters)
//! CLEAR        --clear_stop-->  CLEAR        (no-op)
//! ```
//!
//! In simulate mode the readiness wait is skipped (there is no hardware to
//! observe) but interlock gating still applies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rollbot_types::RobotError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::RegisterChannel;

/// Ready-for-order flag register (1×bool, read).
pub const REG_READY: u8 = 10;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Execution-policy settings for one device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Default blocking policy for commands that do not override it.
    pub default_blocking: bool,
    /// Readiness polling rate.
    pub polling_rate_hz: u32,
    /// Give up waiting for readiness after this long.  `None` waits forever.
    pub completion_timeout_ms: Option<u64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_blocking: true,
            polling_rate_hz: 50,
            completion_timeout_ms: None,
        }
    }
}

impl GateConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.polling_rate_hz.max(1)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Policy
// ────────────────────────────────────────────────────────────────────────────

/// How a single command is executed by [`CommandGate::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandPolicy {
    /// Subject to the interlock.
    pub stoppable: bool,
    /// Per-call override of the device's default blocking policy.
    pub blocking: Option<bool>,
}

impl CommandPolicy {
    /// A command that is always permitted (start, stop, …).
    pub const fn unconditional() -> Self {
        Self {
            stoppable: false,
            blocking: None,
        }
    }

    /// A command held back while the interlock is asserted (motion).
    pub const fn stoppable() -> Self {
        Self {
            stoppable: true,
            blocking: None,
        }
    }

    pub const fn with_blocking(mut self, blocking: Option<bool>) -> Self {
        self.blocking = blocking;
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Interlock
// ────────────────────────────────────────────────────────────────────────────

/// Edge-triggered set/clear gate with any number of waiters.
///
/// Aborting is terminal: every current and future wait returns
/// [`RobotError::Interrupted`], engaged or not.
#[derive(Debug, Default)]
pub struct Interlock {
    state: Mutex<InterlockState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct InterlockState {
    engaged: bool,
    aborted: bool,
    /// Number of clear → set edges so far.
    generation: u64,
}

impl Interlock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InterlockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_engaged(&self) -> bool {
        self.lock().engaged
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Count of clear → set edges since construction.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Engage the interlock.  Returns `true` only for the caller that
    /// performed the clear → set transition.
    pub fn engage(&self) -> bool {
        let mut state = self.lock();
        let edge = !state.engaged;
        state.engaged = true;
        if edge {
            state.generation += 1;
        }
        edge
    }

    /// Release the interlock and wake every waiter.  Returns `true` when it
    /// was engaged.
    pub fn release(&self) -> bool {
        let mut state = self.lock();
        let was_engaged = state.engaged;
        state.engaged = false;
        drop(state);
        if was_engaged {
            self.changed.notify_all();
        }
        was_engaged
    }

    /// Wake every waiter with [`RobotError::Interrupted`] and refuse all
    /// later waits.
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.changed.notify_all();
    }

    /// Block until the interlock is clear.  Returns immediately when it
    /// already is.
    ///
    /// # Errors
    ///
    /// [`RobotError::Interrupted`] once [`Interlock::abort`] was called.
    pub fn wait_released(&self) -> Result<(), RobotError> {
        let state = self
            .changed
            .wait_while(self.lock(), |s| s.engaged && !s.aborted)
            .unwrap_or_else(PoisonError::into_inner);
        if state.aborted {
            return Err(RobotError::Interrupted {
                operation: "interlock release".to_string(),
            });
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Safety action
// ────────────────────────────────────────────────────────────────────────────

/// Device-specific action fired on the interlock's clear → set edge.
pub trait SafetyAction: Send + Sync {
    fn engage(&self, channel: &RegisterChannel) -> Result<(), RobotError>;
}

// ────────────────────────────────────────────────────────────────────────────
// CommandGate
// ────────────────────────────────────────────────────────────────────────────

/// Applies the blocking and interlock policies to register operations on one
/// device.
pub struct CommandGate {
    channel: Arc<RegisterChannel>,
    interlock: Interlock,
    blocking: AtomicBool,
    poll_interval: Duration,
    completion_timeout: Option<Duration>,
    safety_action: Box<dyn SafetyAction>,
}

impl CommandGate {
    pub fn new(
        channel: Arc<RegisterChannel>,
        config: GateConfig,
        safety_action: Box<dyn SafetyAction>,
    ) -> Self {
        Self {
            channel,
            interlock: Interlock::new(),
            blocking: AtomicBool::new(config.default_blocking),
            poll_interval: config.poll_interval(),
            completion_timeout: config.completion_timeout_ms.map(Duration::from_millis),
            safety_action,
        }
    }

    pub fn channel(&self) -> &RegisterChannel {
        &self.channel
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    /// Change the default blocking policy.
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn is_interlocked(&self) -> bool {
        self.interlock.is_engaged()
    }

    /// Number of emergency-stop edges so far.  A change between two reads
    /// means any order issued in between may have been cut short.
    pub fn stop_generation(&self) -> u64 {
        self.interlock.generation()
    }

    /// Abandon every current and future wait with
    /// [`RobotError::Interrupted`].  Used on shutdown; commands still parked
    /// on the interlock are never issued.
    pub fn abort(&self) {
        warn!(address = self.channel.address(), "command gate aborted");
        self.interlock.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.interlock.is_aborted()
    }

    /// Execute `op` under `policy`.
    ///
    /// # Errors
    ///
    /// Propagates any error from `op`, and [`RobotError::Timeout`] when a
    /// completion timeout is configured and the device never reports ready.
    /// After [`CommandGate::abort`], stoppable commands and readiness waits
    /// fail with [`RobotError::Interrupted`].
    pub fn run<T>(
        &self,
        policy: CommandPolicy,
        op: impl FnOnce(&RegisterChannel) -> Result<T, RobotError>,
    ) -> Result<T, RobotError> {
        let blocking = policy.blocking.unwrap_or_else(|| self.is_blocking());

        if policy.stoppable {
            self.interlock.wait_released()?;
        }

        let out = op(&self.channel)?;

        if self.channel.is_simulated() {
            return Ok(out);
        }

        if blocking {
            self.wait_completed()?;
        }

        // An emergency stop completes the current order, which ends the
        // blocking wait early; keep the caller parked until motion may resume.
        if policy.stoppable {
            self.interlock.wait_released()?;
        }

        Ok(out)
    }

    pub fn ready_for_order(&self) -> Result<bool, RobotError> {
        self.channel.read_bool(REG_READY)
    }

    /// Poll the ready-for-order register until it reports `true`, the
    /// completion timeout elapses, or the gate is aborted.
    pub fn wait_completed(&self) -> Result<(), RobotError> {
        let started = Instant::now();
        while !self.ready_for_order()? {
            if self.interlock.is_aborted() {
                return Err(RobotError::Interrupted {
                    operation: "ready_for_order".to_string(),
                });
            }
            if let Some(limit) = self.completion_timeout
                && started.elapsed() >= limit
            {
                return Err(RobotError::Timeout {
                    operation: "ready_for_order".to_string(),
                    waited_ms: limit.as_millis() as u64,
                });
            }
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Assert the interlock.  Fires the safety action on the clear → set
    /// edge and returns whether it did.
    ///
    /// # Errors
    ///
    /// Returns the safety action's error.  The interlock stays asserted.
    pub fn assert_stop(&self) -> Result<bool, RobotError> {
        if !self.interlock.engage() {
            return Ok(false);
        }
        warn!(address = self.channel.address(), "interlock asserted, engaging safety action");
        self.safety_action.engage(&self.channel)?;
        Ok(true)
    }

    /// Clear the interlock, releasing all current and future waiters.
    /// Returns `true` when it was asserted.
    pub fn clear_stop(&self) -> bool {
        let released = self.interlock.release();
        if released {
            info!(address = self.channel.address(), "interlock cleared");
        } else {
            debug!(address = self.channel.address(), "interlock already clear");
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingBus;
    use std::sync::atomic::AtomicUsize;

    struct CountingAction(Arc<AtomicUsize>);

    impl SafetyAction for CountingAction {
        fn engage(&self, _channel: &RegisterChannel) -> Result<(), RobotError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> GateConfig {
        GateConfig {
            polling_rate_hz: 1000,
            ..GateConfig::default()
        }
    }

    fn counting_gate(channel: RegisterChannel) -> (Arc<CommandGate>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let gate = CommandGate::new(
            Arc::new(channel),
            fast_config(),
            Box::new(CountingAction(count.clone())),
        );
        (Arc::new(gate), count)
    }

    #[test]
    fn repeated_asserts_fire_action_once() {
        let (gate, count) = counting_gate(RegisterChannel::simulated(1));

        assert!(gate.assert_stop().unwrap());
        for _ in 0..5 {
            assert!(!gate.assert_stop().unwrap());
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(gate.is_interlocked());

        // A fresh edge after clearing fires again.
        assert!(gate.clear_stop());
        assert!(gate.assert_stop().unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_while_clear_is_noop() {
        let (gate, count) = counting_gate(RegisterChannel::simulated(1));
        assert!(!gate.clear_stop());
        assert!(!gate.is_interlocked());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_asserts_fire_action_once() {
        let (gate, count) = counting_gate(RegisterChannel::simulated(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.assert_stop().unwrap())
            })
            .collect();
        let edges = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|edge| *edge)
            .count();
        assert_eq!(edges, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stoppable_command_waits_for_clear() {
        let bus = RecordingBus::new();
        let log = bus.log();
        let (gate, _) = counting_gate(RegisterChannel::new(0x20, Box::new(bus)));
        gate.assert_stop().unwrap();

        let worker = {
            let gate = gate.clone();
            thread::spawn(move || {
                gate.run(CommandPolicy::stoppable().with_blocking(Some(false)), |ch| {
                    ch.write_f32s(1, &[10.0, 0.0])
                })
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(log.writes_to(1).is_empty(), "move issued while interlocked");

        gate.clear_stop();
        worker.join().unwrap().unwrap();
        assert_eq!(log.writes_to(1).len(), 1);
    }

    #[test]
    fn unconditional_command_ignores_interlock() {
        let bus = RecordingBus::new();
        let log = bus.log();
        let (gate, _) = counting_gate(RegisterChannel::new(0x20, Box::new(bus)));
        gate.assert_stop().unwrap();

        gate.run(CommandPolicy::unconditional(), |ch| ch.write_bool(0, false))
            .unwrap();
        assert_eq!(log.writes_to(0), vec![vec![0]]);
    }

    #[test]
    fn simulated_stoppable_still_gated() {
        let (gate, _) = counting_gate(RegisterChannel::simulated(1));
        gate.assert_stop().unwrap();

        let issued = Arc::new(AtomicBool::new(false));
        let worker = {
            let gate = gate.clone();
            let issued = issued.clone();
            thread::spawn(move || {
                gate.run(CommandPolicy::stoppable(), |_| {
                    issued.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!issued.load(Ordering::SeqCst));
        gate.clear_stop();
        worker.join().unwrap().unwrap();
        assert!(issued.load(Ordering::SeqCst));
    }

    #[test]
    fn blocking_polls_until_ready() {
        let bus = RecordingBus::new();
        let log = bus.log();
        log.set_response(REG_READY, vec![0]);
        let (gate, _) = counting_gate(RegisterChannel::new(0x20, Box::new(bus)));

        let worker = {
            let gate = gate.clone();
            thread::spawn(move || gate.run(CommandPolicy::unconditional(), |_| Ok(())))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());

        log.set_response(REG_READY, vec![1]);
        worker.join().unwrap().unwrap();
        assert!(log.reads_of(REG_READY) >= 2);
    }

    #[test]
    fn completion_timeout_is_reported() {
        let bus = RecordingBus::new();
        bus.log().set_response(REG_READY, vec![0]);
        let gate = CommandGate::new(
            Arc::new(RegisterChannel::new(0x20, Box::new(bus))),
            GateConfig {
                polling_rate_hz: 1000,
                completion_timeout_ms: Some(20),
                ..GateConfig::default()
            },
            Box::new(CountingAction(Arc::new(AtomicUsize::new(0)))),
        );

        let err = gate.run(CommandPolicy::unconditional(), |_| Ok(())).unwrap_err();
        assert!(matches!(err, RobotError::Timeout { .. }));
    }

    #[test]
    fn blocking_override_skips_wait() {
        let bus = RecordingBus::new();
        let log = bus.log();
        log.set_response(REG_READY, vec![0]);
        let (gate, _) = counting_gate(RegisterChannel::new(0x20, Box::new(bus)));

        gate.run(CommandPolicy::unconditional().with_blocking(Some(false)), |_| Ok(()))
            .unwrap();
        assert_eq!(log.reads_of(REG_READY), 0);
    }

    #[test]
    fn stop_generation_counts_edges_only() {
        let (gate, _) = counting_gate(RegisterChannel::simulated(1));
        assert_eq!(gate.stop_generation(), 0);
        gate.assert_stop().unwrap();
        gate.assert_stop().unwrap();
        assert_eq!(gate.stop_generation(), 1);
        gate.clear_stop();
        assert_eq!(gate.stop_generation(), 1);
        gate.assert_stop().unwrap();
        assert_eq!(gate.stop_generation(), 2);
    }

    #[test]
    fn abort_releases_parked_command_without_issuing_it() {
        let bus = RecordingBus::new();
        let log = bus.log();
        let (gate, _) = counting_gate(RegisterChannel::new(0x20, Box::new(bus)));
        gate.assert_stop().unwrap();

        let worker = {
            let gate = gate.clone();
            thread::spawn(move || {
                gate.run(CommandPolicy::stoppable(), |ch| ch.write_f32s(1, &[10.0, 0.0]))
            })
        };
        thread::sleep(Duration::from_millis(30));
        gate.abort();

        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, RobotError::Interrupted { .. }));
        assert!(log.writes_to(1).is_empty());
        assert!(gate.is_interlocked());

        // Later stoppable commands are refused outright.
        gate.clear_stop();
        assert!(gate.run(CommandPolicy::stoppable(), |_| Ok(())).is_err());
        assert!(log.writes_to(1).is_empty());
    }

    #[test]
    fn abort_ends_readiness_poll() {
        let bus = RecordingBus::new();
        let log = bus.log();
        log.set_response(REG_READY, vec![0]);
        let (gate, _) = counting_gate(RegisterChannel::new(0x20, Box::new(bus)));

        let worker = {
            let gate = gate.clone();
            thread::spawn(move || gate.run(CommandPolicy::unconditional(), |_| Ok(())))
        };
        thread::sleep(Duration::from_millis(20));
        gate.abort();
        let err = worker.join().unwrap().unwrap_err();
        assert!(matches!(err, RobotError::Interrupted { .. }));
    }
}
