//! Process-wide machine state shared between the foreground and the step
//! interrupt.
//!
//! Everything in here is a plain atomic cell: single-bit idempotent signals
//! and per-axis position counters. The step interrupt is the only writer of
//! the position counters; the `step_control` bits are set and cleared from
//! both contexts, which is safe because each bit is an independent
//! level-triggered signal, never a counter.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::config::N_AXIS;

/// Top-level machine state, as maintained by the surrounding control loop.
/// The core only reads it to gate homing locks, jog shutdown behavior, and
/// realtime rate reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MachineState {
    #[default]
    Idle = 0,
    Alarm = 1,
    Homing = 2,
    Cycle = 3,
    Hold = 4,
    Jog = 5,
    SafetyDoor = 6,
    Sleep = 7,
}

impl MachineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MachineState::Alarm,
            2 => MachineState::Homing,
            3 => MachineState::Cycle,
            4 => MachineState::Hold,
            5 => MachineState::Jog,
            6 => MachineState::SafetyDoor,
            7 => MachineState::Sleep,
            _ => MachineState::Idle,
        }
    }
}

/// Motion is ending; the preparer refuses to stage further segments until
/// the flags are reset.
pub const STEP_CONTROL_END_MOTION: u8 = 1 << 0;
/// A feed hold is in progress: every newly prepared segment decelerates
/// toward zero speed.
pub const STEP_CONTROL_EXECUTE_HOLD: u8 = 1 << 1;
/// The preparer pulls system-motion blocks (homing, parking) instead of the
/// queued program.
pub const STEP_CONTROL_EXECUTE_SYS_MOTION: u8 = 1 << 2;
/// The next prepared segment must recompute its spindle PWM.
pub const STEP_CONTROL_UPDATE_SPINDLE_PWM: u8 = 1 << 3;

/// Shared state cell. Statically allocate one and hand `&SystemState` to
/// the preparer, the execution engine, and the surrounding control loop.
pub struct SystemState {
    state: AtomicU8,
    step_control: AtomicU8,
    position: [AtomicI32; N_AXIS],
    probe_active: AtomicBool,
    homing_axis_lock: AtomicU8,
    cycle_stop: AtomicBool,
}

impl SystemState {
    pub const fn new() -> Self {
        const ZERO: AtomicI32 = AtomicI32::new(0);
        Self {
            state: AtomicU8::new(MachineState::Idle as u8),
            step_control: AtomicU8::new(0),
            position: [ZERO; N_AXIS],
            probe_active: AtomicBool::new(false),
            homing_axis_lock: AtomicU8::new(0),
            cycle_stop: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> MachineState {
        MachineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: MachineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn step_control(&self) -> u8 {
        self.step_control.load(Ordering::SeqCst)
    }

    pub fn set_step_control_flags(&self, flags: u8) {
        self.step_control.fetch_or(flags, Ordering::SeqCst);
    }

    pub fn clear_step_control_flags(&self, flags: u8) {
        self.step_control.fetch_and(!flags, Ordering::SeqCst);
    }

    /// Return all step-control bits to normal operation.
    pub fn reset_step_control(&self) {
        self.step_control.store(0, Ordering::SeqCst);
    }

    /// Commanded machine position of `axis`, in steps.
    pub fn position(&self, axis: usize) -> i32 {
        self.position[axis].load(Ordering::Relaxed)
    }

    pub fn set_position(&self, axis: usize, steps: i32) {
        self.position[axis].store(steps, Ordering::Relaxed);
    }

    /// Advance the position counter by one step. Called from the step
    /// interrupt, in the same tick as the pulse it accounts for.
    pub(crate) fn bump_position(&self, axis: usize, negative: bool) {
        let delta = if negative { -1 } else { 1 };
        self.position[axis].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn probe_active(&self) -> bool {
        self.probe_active.load(Ordering::SeqCst)
    }

    pub fn set_probe_active(&self, active: bool) {
        self.probe_active.store(active, Ordering::SeqCst);
    }

    /// Axis bits allowed to move during a homing cycle; all other step
    /// outputs are suppressed while the state is [`MachineState::Homing`].
    pub fn homing_axis_lock(&self) -> u8 {
        self.homing_axis_lock.load(Ordering::SeqCst)
    }

    pub fn set_homing_axis_lock(&self, mask: u8) {
        self.homing_axis_lock.store(mask, Ordering::SeqCst);
    }

    /// Raised by the execution engine when the segment ring drains and the
    /// drivers shut down.
    pub(crate) fn signal_cycle_stop(&self) {
        self.cycle_stop.store(true, Ordering::SeqCst);
    }

    /// Consume a pending cycle-stop signal. The control loop polls this to
    /// transition out of CYCLE/HOLD states.
    pub fn take_cycle_stop(&self) -> bool {
        self.cycle_stop.swap(false, Ordering::SeqCst)
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}
