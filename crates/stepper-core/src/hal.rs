//! Hardware abstraction seams.
//!
//! The execution engine runs against these traits so the same code drives
//! real GPIO ports and timers on an MCU or trace-recording fakes on a host.
//! One-shot hardware bring-up (pin directions, timer clocking, PWM setup)
//! belongs to the trait implementations and happens before the engine runs.
//! Every method is called from interrupt context unless noted otherwise and
//! must therefore be cheap, non-blocking, and infallible.

use crate::system::SystemState;

/// Step and direction output port.
///
/// Writes carry the full port mask with polarity already applied; an
/// implementation should map this to an atomic port write (for example an
/// STM32 BSRR-style register) rather than per-pin read-modify-write.
pub trait StepPort {
    fn write_step_bits(&mut self, bits: u8);
    fn write_dir_bits(&mut self, bits: u8);
}

/// The stepper timer peripheral.
///
/// The engine programs a new reload and pulse compare once per segment; the
/// timer must fire the main interrupt at the reload period and the pulse
/// reset interrupt at the compare point within each period.
pub trait StepTimer {
    /// Program the period of the step interrupt, in timer cycles.
    fn set_reload(&mut self, cycles_per_tick: u16);
    /// Program the compare point at which the pulse reset interrupt fires.
    fn set_pulse_compare(&mut self, cycles: u16);
    fn start(&mut self);
    fn stop(&mut self);
}

/// Spindle PWM output contract.
pub trait Spindle {
    /// Translate a commanded speed in RPM into a PWM duty value.
    fn compute_pwm_value(&self, rpm: f32) -> u16;
    /// The duty value that switches the spindle off.
    fn pwm_off_value(&self) -> u16;
    /// Apply a PWM duty value. Called from interrupt context.
    fn set_speed(&mut self, pwm: u16);
}

/// Probe input monitor, polled once per step interrupt while a probing
/// cycle is armed. The monitor owns the trigger reaction (typically it
/// latches the position and requests a feed hold through `system`).
pub trait Probe {
    fn state_monitor(&mut self, system: &SystemState);
}

/// Stepper driver enable line. The engine passes the resolved physical
/// line level; polarity inversion has already been applied.
pub trait DriverEnable {
    fn set_line(&mut self, high: bool);
}

/// The full set of peripherals the execution engine touches, bundled so the
/// interrupt handlers take a single hardware argument.
pub struct MotionHardware<P, T, S, PR, E, D> {
    pub step_port: P,
    pub timer: T,
    pub spindle: S,
    pub probe: PR,
    pub enable: E,
    /// Blocking delay provider, used only outside the interrupt handlers
    /// (driver wake-up and idle-lock dwell).
    pub delay: D,
}
