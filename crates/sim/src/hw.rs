//! Trace-recording hardware stand-ins. Every write the engine makes is
//! captured with the simulated timestamp so tests can reconstruct the full
//! pulse train.

use embedded_hal::delay::DelayNs;
use stepper_core::{DriverEnable, Probe, Spindle, StepPort, StepTimer, SystemState};

/// A port write, in the order the engine issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Step { t_cycles: u64, bits: u8 },
    Dir { t_cycles: u64, bits: u8 },
}

/// Step/direction port that records every write.
#[derive(Default)]
pub struct TracePort {
    /// Simulated time of the next write, maintained by the machine.
    pub now_cycles: u64,
    pub events: Vec<PortEvent>,
}

impl StepPort for TracePort {
    fn write_step_bits(&mut self, bits: u8) {
        self.events.push(PortEvent::Step {
            t_cycles: self.now_cycles,
            bits,
        });
    }
    fn write_dir_bits(&mut self, bits: u8) {
        self.events.push(PortEvent::Dir {
            t_cycles: self.now_cycles,
            bits,
        });
    }
}

/// Timer that logs each programmed reload; the engine programs exactly one
/// reload per segment, so `reloads` doubles as the per-segment rate trace.
#[derive(Default)]
pub struct TraceTimer {
    pub reloads: Vec<u16>,
    pub pulse_compares: Vec<u16>,
    pub running: bool,
}

impl StepTimer for TraceTimer {
    fn set_reload(&mut self, cycles_per_tick: u16) {
        self.reloads.push(cycles_per_tick);
    }
    fn set_pulse_compare(&mut self, cycles: u16) {
        self.pulse_compares.push(cycles);
    }
    fn start(&mut self) {
        self.running = true;
    }
    fn stop(&mut self) {
        self.running = false;
    }
}

/// Linear PWM spindle model with a duty history.
pub struct TraceSpindle {
    pub max_rpm: f32,
    pub max_duty: u16,
    pub duty: u16,
    pub history: Vec<u16>,
}

impl Default for TraceSpindle {
    fn default() -> Self {
        Self {
            max_rpm: 10_000.0,
            max_duty: 1000,
            duty: 0,
            history: Vec::new(),
        }
    }
}

impl Spindle for TraceSpindle {
    fn compute_pwm_value(&self, rpm: f32) -> u16 {
        let duty = (rpm / self.max_rpm).clamp(0.0, 1.0) * self.max_duty as f32;
        duty as u16
    }
    fn pwm_off_value(&self) -> u16 {
        0
    }
    fn set_speed(&mut self, pwm: u16) {
        if self.history.last() != Some(&pwm) {
            self.history.push(pwm);
        }
        self.duty = pwm;
    }
}

/// Probe that trips after a fixed number of polls. The trip is latched for
/// the machine harness, which owns the feed-hold reaction.
#[derive(Default)]
pub struct TraceProbe {
    pub trip_after_polls: Option<u32>,
    pub polls: u32,
    pub tripped: bool,
}

impl Probe for TraceProbe {
    fn state_monitor(&mut self, system: &SystemState) {
        self.polls += 1;
        if let Some(limit) = self.trip_after_polls {
            if self.polls >= limit && !self.tripped {
                self.tripped = true;
                system.set_probe_active(false);
            }
        }
    }
}

/// Enable line recorder.
#[derive(Default)]
pub struct TraceEnable {
    pub line: bool,
    pub transitions: Vec<bool>,
}

impl DriverEnable for TraceEnable {
    fn set_line(&mut self, high: bool) {
        self.line = high;
        self.transitions.push(high);
    }
}

/// Delay provider that only accounts for the requested time.
#[derive(Default)]
pub struct TraceDelay {
    pub total_ns: u64,
}

impl DelayNs for TraceDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += u64::from(ns);
    }
}
