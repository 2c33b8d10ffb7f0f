//! Step execution engine.
//!
//! The interrupt half of the core. [`StepExecutor::on_timer_tick`] is the
//! body of the stepper timer interrupt; [`StepExecutor::on_pulse_reset`] is
//! the companion compare-match handler that ends each pulse. Everything on
//! the tick path is integer arithmetic over state loaded from the segment
//! ring — no floating point, no allocation, no unbounded loops.
//!
//! ## Performance
//!
//! One tick is: two port writes, an occasional segment load (a few loads
//! and one atomic store), one Bresenham pass over the axes, and a couple of
//! flag checks. That keeps the handler comfortably inside the shortest
//! timer period the preparer will schedule.

use embedded_hal::delay::DelayNs;

use crate::config::{N_AXIS, STEP_TIMER_MIN};
#[cfg(feature = "dual-x-axis")]
use crate::config::{DUAL_X_BIT, X_AXIS};
#[cfg(feature = "dual-y-axis")]
use crate::config::{DUAL_Y_BIT, Y_AXIS};
use crate::hal::{DriverEnable, MotionHardware, Probe, Spindle, StepPort, StepTimer};
use crate::segment::{Segment, SegmentConsumer, StepperBlock};
use crate::settings::{Settings, STEPPER_KEEP_ENABLED};
use crate::system::{MachineState, SystemState};

/// Delay between energizing the drivers and the first step pulse, giving
/// the driver charge pumps time to settle.
const WAKEUP_DELAY_MS: u32 = 10;

/// Mirror the dual-axis output bits onto their parents' state. Pure pulse
/// fan-out: the Bresenham tracer itself only knows the primary axes.
#[inline]
fn fan_out(axis_bits: u8) -> u8 {
    #[allow(unused_mut)]
    let mut bits = axis_bits;
    #[cfg(feature = "dual-x-axis")]
    if axis_bits & (1 << X_AXIS) != 0 {
        bits |= 1 << DUAL_X_BIT;
    }
    #[cfg(feature = "dual-y-axis")]
    if axis_bits & (1 << Y_AXIS) != 0 {
        bits |= 1 << DUAL_Y_BIT;
    }
    bits
}

/// Interrupt-context stepper state. Owns the consumer half of the segment
/// ring; the handlers receive the hardware bundle and the shared system
/// state by reference.
pub struct StepExecutor<'a> {
    consumer: SegmentConsumer<'a>,
    /// Segment being executed; `None` means load the next one.
    exec_segment: Option<Segment>,
    /// Pulses remaining in the current segment.
    step_count: u16,
    exec_block_index: u8,
    exec_block: StepperBlock,
    /// Bresenham accumulators, one per axis.
    counters: [u32; N_AXIS],
    /// Per-tick Bresenham increments for the current segment (block counts
    /// shifted by the segment's smoothing level).
    steps_per_tick: [u32; N_AXIS],
    /// Step bits for the *next* tick's leading edge, polarity applied.
    step_outbits: u8,
    /// Direction bits currently driven, polarity applied.
    dir_outbits: u8,
    step_port_invert_mask: u8,
    dir_port_invert_mask: u8,
}

impl<'a> StepExecutor<'a> {
    pub fn new(consumer: SegmentConsumer<'a>, settings: &Settings) -> Self {
        let mut executor = Self {
            consumer,
            exec_segment: None,
            step_count: 0,
            exec_block_index: 0,
            exec_block: StepperBlock::EMPTY,
            counters: [0; N_AXIS],
            steps_per_tick: [0; N_AXIS],
            step_outbits: 0,
            dir_outbits: 0,
            step_port_invert_mask: 0,
            dir_port_invert_mask: 0,
        };
        executor.generate_step_dir_invert_masks(settings);
        executor.step_outbits = executor.step_port_invert_mask;
        executor.dir_outbits = executor.dir_port_invert_mask;
        executor
    }

    /// Rebuild the port polarity masks after a settings change. Mirrored
    /// axes inherit their parent's polarity.
    pub fn generate_step_dir_invert_masks(&mut self, settings: &Settings) {
        let mut step_mask = 0u8;
        let mut dir_mask = 0u8;
        for axis in 0..N_AXIS {
            if settings.step_invert_mask & (1 << axis) != 0 {
                step_mask |= Settings::step_pin_mask(axis);
            }
            if settings.dir_invert_mask & (1 << axis) != 0 {
                dir_mask |= Settings::direction_pin_mask(axis);
            }
        }
        self.step_port_invert_mask = fan_out(step_mask);
        self.dir_port_invert_mask = fan_out(dir_mask);
    }

    /// Zero all execution state and drive every step/direction line to its
    /// idle level. Call while the timer is stopped, together with the
    /// preparer's reset and a ring clear.
    pub fn reset<P: StepPort>(&mut self, port: &mut P, settings: &Settings) {
        self.generate_step_dir_invert_masks(settings);
        self.exec_segment = None;
        self.step_count = 0;
        self.exec_block_index = 0;
        self.exec_block = StepperBlock::EMPTY;
        self.counters = [0; N_AXIS];
        self.steps_per_tick = [0; N_AXIS];
        self.step_outbits = self.step_port_invert_mask;
        self.dir_outbits = self.dir_port_invert_mask;
        port.write_step_bits(self.step_outbits);
        port.write_dir_bits(self.dir_outbits);
    }

    /// Energize the drivers, wait out their wake-up time, and start the
    /// stepper timer. Runs in the foreground at cycle start, never during
    /// motion.
    pub fn wake_up<P, T, S, PR, E, D>(
        &mut self,
        hw: &mut MotionHardware<P, T, S, PR, E, D>,
        settings: &Settings,
    ) where
        T: StepTimer,
        E: DriverEnable,
        D: DelayNs,
    {
        hw.enable.set_line(settings.invert_st_enable());
        hw.delay.delay_ms(WAKEUP_DELAY_MS);
        // Arm the step lines at idle so the first tick cannot pulse.
        self.step_outbits = self.step_port_invert_mask;
        hw.timer.start();
    }

    /// Stop the stepper timer, return the step lines to idle, and set the
    /// driver enable line per the idle-lock settings. `force_disable`
    /// overrides the keep-energized sentinel.
    pub fn disable<P, T, S, PR, E, D>(
        &mut self,
        hw: &mut MotionHardware<P, T, S, PR, E, D>,
        force_disable: bool,
        settings: &Settings,
        system: &SystemState,
    ) where
        P: StepPort,
        T: StepTimer,
        E: DriverEnable,
        D: DelayNs,
    {
        hw.timer.stop();
        self.step_outbits = self.step_port_invert_mask;
        hw.step_port.write_step_bits(self.step_outbits);

        let mut disable_drivers = force_disable;
        if (settings.stepper_idle_lock_time != STEPPER_KEEP_ENABLED
            || system.state() == MachineState::Sleep)
            && system.state() != MachineState::Homing
        {
            // Dwell so the axes settle before torque is released.
            hw.delay.delay_ms(settings.stepper_idle_lock_time as u32);
            disable_drivers = true;
        }
        hw.enable.set_line(disable_drivers != settings.invert_st_enable());
    }

    /// The segment currently executing, if any. Diagnostic accessor; the
    /// interrupt handlers do not use it.
    pub fn current_segment(&self) -> Option<Segment> {
        self.exec_segment
    }

    /// Main stepper timer interrupt body.
    pub fn on_timer_tick<P, T, S, PR, E, D>(
        &mut self,
        hw: &mut MotionHardware<P, T, S, PR, E, D>,
        settings: &Settings,
        system: &SystemState,
    ) where
        P: StepPort,
        T: StepTimer,
        S: Spindle,
        PR: Probe,
        E: DriverEnable,
        D: DelayNs,
    {
        // Drive the edges decided on the previous tick. Direction first:
        // DIR setup time must precede the step rising edge.
        hw.step_port.write_dir_bits(self.dir_outbits);
        hw.step_port.write_step_bits(self.step_outbits);

        // Fetch the next segment when the current one is spent.
        let segment = match self.exec_segment {
            Some(segment) => segment,
            None => match self.load_next_segment(hw, settings, system) {
                Some(segment) => segment,
                None => return,
            },
        };

        // Probe input is sampled once per tick while a probing cycle is
        // armed; the monitor owns the trigger reaction.
        if system.probe_active() {
            hw.probe.state_monitor(system);
        }

        // Bresenham pass, fixed axis order.
        let mut step_bits = 0u8;
        for axis in 0..N_AXIS {
            self.counters[axis] += self.steps_per_tick[axis];
            if self.counters[axis] > self.exec_block.step_event_count {
                step_bits |= 1 << axis;
                self.counters[axis] -= self.exec_block.step_event_count;
                if !segment.backlash_motion {
                    let negative = self.exec_block.direction_bits & (1 << axis) != 0;
                    system.bump_position(axis, negative);
                }
            }
        }

        // A homing cycle suppresses every axis it is not driving.
        if system.state() == MachineState::Homing {
            step_bits &= system.homing_axis_lock();
        }

        self.step_count -= 1;
        if self.step_count == 0 {
            // Segment complete: retire it so the preparer can reuse the
            // slot (and, transitively, the block pool entry).
            self.exec_segment = None;
            self.consumer.finish();
        }

        self.step_outbits = fan_out(step_bits) ^ self.step_port_invert_mask;
    }

    /// Pulse reset compare-match body: return every step line to idle,
    /// ending the pulse begun at the period start. Direction lines are
    /// untouched.
    pub fn on_pulse_reset<P: StepPort>(&self, port: &mut P) {
        port.write_step_bits(self.step_port_invert_mask);
    }

    fn load_next_segment<P, T, S, PR, E, D>(
        &mut self,
        hw: &mut MotionHardware<P, T, S, PR, E, D>,
        settings: &Settings,
        system: &SystemState,
    ) -> Option<Segment>
    where
        P: StepPort,
        T: StepTimer,
        S: Spindle,
        E: DriverEnable,
        D: DelayNs,
    {
        let Some(segment) = self.consumer.peek() else {
            // Ring drained: spin down and signal the cycle end. A jog
            // cancel leaves the spindle program untouched.
            self.disable(hw, false, settings, system);
            if system.state() != MachineState::Jog && self.exec_block.is_pwm_rate_adjusted {
                hw.spindle.set_speed(hw.spindle.pwm_off_value());
            }
            system.signal_cycle_stop();
            return None;
        };

        // Pace the interrupt no faster than the CPU can service it, and put
        // the pulse reset at three quarters of the period (25% pulse width).
        let reload = segment.cycles_per_tick.max(STEP_TIMER_MIN);
        hw.timer.set_reload(reload);
        hw.timer.set_pulse_compare(reload - reload / 4);

        self.step_count = segment.n_step;

        if self.exec_block_index != segment.st_block_index {
            self.exec_block_index = segment.st_block_index;
            self.exec_block = self.consumer.block(segment.st_block_index);
            // Mid-count start gives the classic Bresenham tie-break.
            let half = self.exec_block.step_event_count >> 1;
            self.counters = [half; N_AXIS];
        }

        // Direction lines are driven here, well ahead of the first step
        // edge of the segment.
        self.dir_outbits = fan_out(self.exec_block.direction_bits) ^ self.dir_port_invert_mask;
        hw.step_port.write_dir_bits(self.dir_outbits);

        for axis in 0..N_AXIS {
            self.steps_per_tick[axis] = self.exec_block.steps[axis] >> segment.amass_level;
        }

        hw.spindle.set_speed(segment.spindle_pwm);
        self.exec_segment = Some(segment);
        Some(segment)
    }
}
