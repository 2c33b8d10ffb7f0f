//! Segment preparation.
//!
//! The foreground half of the core. [`SegmentPreparer::prepare_buffer`]
//! pulls blocks from the planner, integrates their velocity profile in
//! floating point, and publishes fixed-rate [`Segment`]s for the step
//! interrupt to execute. All floating-point math in the core lives here;
//! the interrupt side only ever sees integers.
//!
//! Step exactness rests on two mechanisms:
//!
//! - Step counts are staged pre-multiplied by `2^MAX_AMASS_LEVEL`, so a
//!   segment's smoothing shift never truncates a step away.
//! - A segment's pulse count is the *difference of round-ups* of the steps
//!   remaining before and after it, and the execution time of the fractional
//!   step left over is carried into the next segment (`dt_remainder`), so
//!   the integrated step rate matches the plan over any window.

use libm::{ceilf, sqrtf};

use crate::config::{
    AMASS_LEVEL1, AMASS_LEVEL2, AMASS_LEVEL3, DT_SEGMENT, F_TIMER_STEPPER, MAX_AMASS_LEVEL,
    N_AXIS, REQ_MM_INCREMENT_SCALAR,
};
use crate::hal::Spindle;
use crate::planner::{BlockCondition, Planner, PlannerBlock};
use crate::profile::{plan_profile, Ramp};
use crate::segment::{next_block_index, Segment, SegmentProducer, StepperBlock};
use crate::settings::Settings;
use crate::system::{
    SystemState, STEP_CONTROL_END_MOTION, STEP_CONTROL_EXECUTE_HOLD,
    STEP_CONTROL_EXECUTE_SYS_MOTION, STEP_CONTROL_UPDATE_SPINDLE_PWM,
};

const PREP_FLAG_RECALCULATE: u8 = 1 << 0;
const PREP_FLAG_HOLD_PARTIAL_BLOCK: u8 = 1 << 1;
const PREP_FLAG_PARKING: u8 = 1 << 2;
const PREP_FLAG_DECEL_OVERRIDE: u8 = 1 << 3;

/// Step execution data of a partially completed block, retained across a
/// parking interlude.
#[cfg(feature = "parking")]
#[derive(Debug, Clone, Copy, Default)]
struct PartialBlockSnapshot {
    st_block_index: u8,
    steps_remaining: f32,
    dt_remainder: f32,
    step_per_mm: f32,
}

/// What a single pass of segment construction produced.
enum SegmentOutcome {
    /// Segment published; the block has distance left.
    Committed,
    /// Segment published and the block is fully staged.
    BlockDone,
    /// Segment published; a feed hold bottomed out mid-block.
    ForcedTermination,
    /// Less than one step left to decelerate: nothing published.
    HoldBail,
    /// The ring filled up underneath us.
    RingFull,
}

/// Foreground segment preparer. Owns the producer half of the segment ring
/// plus the integration state of the block currently being sliced.
pub struct SegmentPreparer<'a> {
    producer: SegmentProducer<'a>,
    /// A planner block is mid-preparation. Cleared to force a (re)load.
    has_block: bool,
    flags: u8,
    st_block_index: u8,
    steps_remaining: f32,
    dt_remainder: f32,
    step_per_mm: f32,
    req_mm_increment: f32,
    ramp: Ramp,
    mm_complete: f32,
    current_speed: f32,
    maximum_speed: f32,
    exit_speed: f32,
    accelerate_until: f32,
    decelerate_after: f32,
    /// Inverse of the programmed rate, cached for laser-mode PWM scaling.
    inv_rate: f32,
    pwm_rate_adjusted: bool,
    current_spindle_pwm: u16,
    #[cfg(feature = "parking")]
    saved: PartialBlockSnapshot,
}

fn fetch_block<'p, P: Planner>(
    planner: &'p mut P,
    sys_motion: bool,
) -> Option<&'p mut PlannerBlock> {
    if sys_motion {
        planner.system_motion_block()
    } else {
        planner.current_block()
    }
}

/// Smoothing level for a segment of `cycles` timer cycles per step, and the
/// per-tick cycle count after the level's shift.
fn amass_for_cycles(cycles: u32) -> (u8, u32) {
    if cycles < AMASS_LEVEL1 {
        return (0, cycles);
    }
    let level = if cycles < AMASS_LEVEL2 {
        1
    } else if cycles < AMASS_LEVEL3 {
        2
    } else {
        3
    };
    let level = level.min(MAX_AMASS_LEVEL);
    (level, cycles >> level)
}

impl<'a> SegmentPreparer<'a> {
    pub fn new(producer: SegmentProducer<'a>) -> Self {
        Self {
            producer,
            has_block: false,
            flags: 0,
            st_block_index: 0,
            steps_remaining: 0.0,
            dt_remainder: 0.0,
            step_per_mm: 0.0,
            req_mm_increment: 0.0,
            ramp: Ramp::Accel,
            mm_complete: 0.0,
            current_speed: 0.0,
            maximum_speed: 0.0,
            exit_speed: 0.0,
            accelerate_until: 0.0,
            decelerate_after: 0.0,
            inv_rate: 0.0,
            pwm_rate_adjusted: false,
            current_spindle_pwm: 0,
            #[cfg(feature = "parking")]
            saved: PartialBlockSnapshot::default(),
        }
    }

    /// Drop all preparation state. Call together with the engine's reset
    /// and [`crate::segment::clear_segment_buffer`] while motion is stopped.
    pub fn reset(&mut self) {
        self.has_block = false;
        self.flags = 0;
        self.st_block_index = 0;
        self.steps_remaining = 0.0;
        self.dt_remainder = 0.0;
        self.step_per_mm = 0.0;
        self.req_mm_increment = 0.0;
        self.ramp = Ramp::Accel;
        self.mm_complete = 0.0;
        self.current_speed = 0.0;
        self.maximum_speed = 0.0;
        self.exit_speed = 0.0;
        self.accelerate_until = 0.0;
        self.decelerate_after = 0.0;
        self.inv_rate = 0.0;
        self.pwm_rate_adjusted = false;
        self.current_spindle_pwm = 0;
    }

    /// Fill the segment ring. Idempotent when the ring is full or nothing
    /// is queued; refuses to run while motion is ending.
    pub fn prepare_buffer<P: Planner, S: Spindle>(
        &mut self,
        planner: &mut P,
        spindle: &S,
        settings: &Settings,
        system: &SystemState,
    ) {
        if system.step_control() & STEP_CONTROL_END_MOTION != 0 {
            return;
        }

        while !self.producer.is_full() {
            let sys_motion = system.step_control() & STEP_CONTROL_EXECUTE_SYS_MOTION != 0;

            if !self.has_block {
                // Query the planner for the profile inputs before taking
                // the exclusive block borrow below.
                let snapshot = match fetch_block(planner, sys_motion) {
                    Some(block) => *block,
                    None => return,
                };
                let exit_speed_sqr = if sys_motion {
                    0.0
                } else {
                    planner.exec_block_exit_speed_sqr()
                };
                let nominal_speed = planner.profile_nominal_speed(&snapshot);
                let Some(block) = fetch_block(planner, sys_motion) else {
                    return;
                };
                self.enter_block(block, exit_speed_sqr, nominal_speed, settings, system);
            }

            let Some(block) = fetch_block(planner, sys_motion) else {
                return;
            };
            match self.build_segment(block, spindle, system) {
                SegmentOutcome::Committed => {}
                SegmentOutcome::BlockDone => {
                    if sys_motion {
                        system.set_step_control_flags(STEP_CONTROL_END_MOTION);
                        return;
                    }
                    self.has_block = false;
                    planner.discard_current_block();
                }
                SegmentOutcome::ForcedTermination | SegmentOutcome::HoldBail => {
                    // Step data of the partial block stays resident so the
                    // planner can re-plan the remainder after the hold.
                    system.set_step_control_flags(STEP_CONTROL_END_MOTION);
                    if self.flags & PREP_FLAG_PARKING == 0 {
                        self.flags |= PREP_FLAG_HOLD_PARTIAL_BLOCK;
                    }
                    return;
                }
                SegmentOutcome::RingFull => return,
            }
        }
    }

    /// A look-ahead pass changed the plan for the block being prepared:
    /// hand the planner the speed the preparer has actually reached and
    /// recompute only the velocity profile on the next pass. Ignored at a
    /// block boundary, where there is nothing mid-flight to update.
    pub fn update_block_parameters<P: Planner>(&mut self, planner: &mut P, system: &SystemState) {
        if !self.has_block {
            return;
        }
        let sys_motion = system.step_control() & STEP_CONTROL_EXECUTE_SYS_MOTION != 0;
        if let Some(block) = fetch_block(planner, sys_motion) {
            self.flags |= PREP_FLAG_RECALCULATE;
            block.entry_speed_sqr = self.current_speed * self.current_speed;
            self.has_block = false;
        }
    }

    /// Switch preparation over to a parking motion, snapshotting the
    /// progress of a partially completed block for later restore.
    #[cfg(feature = "parking")]
    pub fn parking_setup_buffer(&mut self) {
        if self.flags & PREP_FLAG_HOLD_PARTIAL_BLOCK != 0 {
            self.saved = PartialBlockSnapshot {
                st_block_index: self.st_block_index,
                steps_remaining: self.steps_remaining,
                dt_remainder: self.dt_remainder,
                step_per_mm: self.step_per_mm,
            };
        }
        self.flags |= PREP_FLAG_PARKING;
        self.flags &= !PREP_FLAG_RECALCULATE;
        self.has_block = false;
    }

    /// End the parking interlude: restore the snapshotted block progress
    /// (if any) and resume the program where it was interrupted.
    #[cfg(feature = "parking")]
    pub fn parking_restore_buffer(&mut self) {
        if self.flags & PREP_FLAG_HOLD_PARTIAL_BLOCK != 0 {
            self.st_block_index = self.saved.st_block_index;
            self.steps_remaining = self.saved.steps_remaining;
            self.dt_remainder = self.saved.dt_remainder;
            self.step_per_mm = self.saved.step_per_mm;
            self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
            self.flags = PREP_FLAG_HOLD_PARTIAL_BLOCK | PREP_FLAG_RECALCULATE;
        } else {
            self.flags = 0;
        }
        self.has_block = false;
    }

    /// The last speed the preparer integrated to, in mm/min, while motion
    /// is in a state that executes it; zero otherwise.
    pub fn realtime_rate(&self, system: &SystemState) -> f32 {
        use crate::system::MachineState::*;
        match system.state() {
            Cycle | Homing | Hold | Jog | SafetyDoor => self.current_speed,
            _ => 0.0,
        }
    }

    /// A feed hold ran this block's speed to zero mid-way and its unspent
    /// remainder is being held for a re-plan.
    pub fn has_partial_block(&self) -> bool {
        self.flags & PREP_FLAG_HOLD_PARTIAL_BLOCK != 0
    }

    /// Load a fresh block (or re-enter the current one after a plan
    /// update) and select its velocity profile.
    fn enter_block(
        &mut self,
        block: &mut PlannerBlock,
        exit_speed_sqr: f32,
        nominal_speed: f32,
        settings: &Settings,
        system: &SystemState,
    ) {
        if self.flags & PREP_FLAG_RECALCULATE != 0 {
            // Plan update mid-block: the staged Bresenham data and step
            // tallies stay valid, only the profile below is recomputed.
            #[cfg(feature = "parking")]
            {
                if self.flags & PREP_FLAG_PARKING != 0 {
                    self.flags &= !PREP_FLAG_RECALCULATE;
                } else {
                    self.flags = 0;
                }
            }
            #[cfg(not(feature = "parking"))]
            {
                self.flags = 0;
            }
        } else {
            self.st_block_index = next_block_index(self.st_block_index);

            let mut steps = [0u32; N_AXIS];
            for (staged, count) in steps.iter_mut().zip(block.steps.iter()) {
                *staged = count << MAX_AMASS_LEVEL;
            }
            self.steps_remaining = block.step_event_count as f32;
            self.step_per_mm = self.steps_remaining / block.millimeters;
            self.req_mm_increment = REQ_MM_INCREMENT_SCALAR / self.step_per_mm;
            self.dt_remainder = 0.0;

            if system.step_control() & STEP_CONTROL_EXECUTE_HOLD != 0
                || self.flags & PREP_FLAG_DECEL_OVERRIDE != 0
            {
                // Chained deceleration: this block begins at the speed the
                // previous profile ended with, not at its planned entry.
                self.current_speed = self.exit_speed;
                block.entry_speed_sqr = self.exit_speed * self.exit_speed;
                self.flags &= !PREP_FLAG_DECEL_OVERRIDE;
            } else {
                self.current_speed = sqrtf(block.entry_speed_sqr);
            }

            self.pwm_rate_adjusted = false;
            if settings.laser_mode() && block.condition.intersects(BlockCondition::SPINDLE_CCW) {
                self.inv_rate = 1.0 / block.programmed_rate;
                self.pwm_rate_adjusted = true;
            }

            let staged = StepperBlock {
                steps,
                step_event_count: block.step_event_count << MAX_AMASS_LEVEL,
                direction_bits: block.direction_bits,
                is_pwm_rate_adjusted: self.pwm_rate_adjusted,
            };
            // SAFETY: block indices advance round-robin and only on fresh
            // loads; the pool sizing guarantees this entry has no live
            // referents (see the segment module's safety notes).
            unsafe {
                self.producer
                    .store_block(self.st_block_index as usize, staged);
            }
        }
        self.has_block = true;

        let hold_active = system.step_control() & STEP_CONTROL_EXECUTE_HOLD != 0;
        let plan = plan_profile(block, self.current_speed, exit_speed_sqr, nominal_speed, hold_active);
        self.ramp = plan.ramp;
        self.accelerate_until = plan.accelerate_until;
        self.decelerate_after = plan.decelerate_after;
        self.maximum_speed = plan.maximum_speed;
        self.exit_speed = plan.exit_speed;
        self.mm_complete = plan.mm_complete;
        if plan.decel_override_pending {
            self.flags |= PREP_FLAG_DECEL_OVERRIDE;
        }

        // Every (re)entered block refreshes the spindle PWM on its first
        // segment.
        system.set_step_control_flags(STEP_CONTROL_UPDATE_SPINDLE_PWM);
    }

    /// Integrate one segment's worth of the profile and publish it.
    fn build_segment<S: Spindle>(
        &mut self,
        block: &mut PlannerBlock,
        spindle: &S,
        system: &SystemState,
    ) -> SegmentOutcome {
        let mut dt_max = DT_SEGMENT;
        let mut dt = 0.0_f32;
        let mut time_var = dt_max;
        let mut mm_remaining = block.millimeters;
        // Distance floor that guarantees the segment carries at least one
        // whole step.
        let minimum_mm = (mm_remaining - self.req_mm_increment).max(0.0);

        loop {
            match self.ramp {
                Ramp::DecelOverride => {
                    let speed_var = block.acceleration * time_var;
                    if self.current_speed - self.maximum_speed <= speed_var {
                        // Reached the reduced nominal: collapse into cruise.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (block.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        self.ramp = Ramp::Cruise;
                        self.current_speed = self.maximum_speed;
                    } else {
                        mm_remaining -= time_var * (self.current_speed - 0.5 * speed_var);
                        self.current_speed -= speed_var;
                    }
                }
                Ramp::Accel => {
                    let speed_var = block.acceleration * time_var;
                    mm_remaining -= time_var * (self.current_speed + 0.5 * speed_var);
                    if mm_remaining < self.accelerate_until {
                        // Acceleration ramp ends inside this segment.
                        mm_remaining = self.accelerate_until;
                        time_var = 2.0 * (block.millimeters - mm_remaining)
                            / (self.current_speed + self.maximum_speed);
                        // Triangles have no cruise: both markers coincide.
                        self.ramp = if mm_remaining == self.decelerate_after {
                            Ramp::Decel
                        } else {
                            Ramp::Cruise
                        };
                        self.current_speed = self.maximum_speed;
                    } else {
                        self.current_speed += speed_var;
                    }
                }
                Ramp::Cruise => {
                    let mm_var = mm_remaining - self.maximum_speed * time_var;
                    if mm_var < self.decelerate_after {
                        // Cruise ends inside this segment.
                        time_var = (mm_remaining - self.decelerate_after) / self.maximum_speed;
                        mm_remaining = self.decelerate_after;
                        self.ramp = Ramp::Decel;
                    } else {
                        mm_remaining = mm_var;
                    }
                }
                Ramp::Decel => {
                    let speed_var = block.acceleration * time_var;
                    let mut bottomed = true;
                    if self.current_speed > speed_var {
                        let mm_var =
                            mm_remaining - time_var * (self.current_speed - 0.5 * speed_var);
                        if mm_var > self.mm_complete {
                            mm_remaining = mm_var;
                            self.current_speed -= speed_var;
                            bottomed = false;
                        }
                    }
                    if bottomed {
                        // End of block or of a forced deceleration.
                        time_var = 2.0 * (mm_remaining - self.mm_complete)
                            / (self.current_speed + self.exit_speed);
                        mm_remaining = self.mm_complete;
                        self.current_speed = self.exit_speed;
                    }
                }
            }

            dt += time_var;
            if dt < dt_max {
                // Ramp junction inside the segment: integrate the rest.
                time_var = dt_max - dt;
            } else if mm_remaining > minimum_mm {
                // Very slow motion: stretch the segment until it contains
                // at least one step.
                dt_max += DT_SEGMENT;
                time_var = dt_max - dt;
            } else {
                break; // Segment time maxed out.
            }
            if mm_remaining <= self.mm_complete {
                break; // Profile complete.
            }
        }

        // Spindle PWM for this segment.
        if self.pwm_rate_adjusted
            || system.step_control() & STEP_CONTROL_UPDATE_SPINDLE_PWM != 0
        {
            if block
                .condition
                .intersects(BlockCondition::SPINDLE_CW | BlockCondition::SPINDLE_CCW)
            {
                let mut rpm = block.spindle_speed;
                if self.pwm_rate_adjusted {
                    rpm *= self.current_speed * self.inv_rate;
                }
                self.current_spindle_pwm = spindle.compute_pwm_value(rpm);
            } else {
                self.current_spindle_pwm = spindle.pwm_off_value();
            }
            system.clear_step_control_flags(STEP_CONTROL_UPDATE_SPINDLE_PWM);
        }

        // Steps for this segment, by round-up difference: the fractional
        // step at the segment end is never executed, so its distance and
        // time carry over instead of accumulating as drift.
        let step_dist_remaining = self.step_per_mm * mm_remaining;
        let n_steps_remaining = ceilf(step_dist_remaining);
        let last_n_steps_remaining = ceilf(self.steps_remaining);
        let mut n_step = (last_n_steps_remaining - n_steps_remaining) as u16;

        if n_step == 0 && system.step_control() & STEP_CONTROL_EXECUTE_HOLD != 0 {
            // Less than one step to decelerate to zero, but already very
            // close: whole steps are required, so bail without a segment.
            return SegmentOutcome::HoldBail;
        }

        // Fold the previous segment's partial-step time into this one so
        // the adjusted rate keeps step output exact over any window.
        dt += self.dt_remainder;
        let inv_rate = dt / (last_n_steps_remaining - step_dist_remaining);

        // Timer cycles per step, then the smoothing level and its shifts.
        let cycles = ceilf((F_TIMER_STEPPER as f32 * 60.0) * inv_rate) as u32;
        let (amass_level, cycles) = amass_for_cycles(cycles);
        n_step <<= amass_level;
        let cycles_per_tick = if cycles < 0x1_0000 {
            cycles as u16
        } else {
            // Past 16 bits: run at the slowest representable rate. The rate
            // correction absorbs the difference over following segments.
            0xFFFF
        };

        let segment = Segment {
            n_step,
            cycles_per_tick,
            st_block_index: self.st_block_index,
            amass_level,
            spindle_pwm: self.current_spindle_pwm,
            backlash_motion: block.condition.intersects(BlockCondition::BACKLASH_COMP),
        };
        debug_assert!(segment.n_step >= 1);
        if self.producer.push(segment).is_err() {
            return SegmentOutcome::RingFull;
        }

        block.millimeters = mm_remaining;
        self.steps_remaining = n_steps_remaining;
        self.dt_remainder = (n_steps_remaining - step_dist_remaining) * inv_rate;

        if mm_remaining == self.mm_complete {
            if mm_remaining > 0.0 {
                return SegmentOutcome::ForcedTermination;
            }
            return SegmentOutcome::BlockDone;
        }
        SegmentOutcome::Committed
    }
}
