//! Velocity profile selection.
//!
//! Given a block's entry speed, exit speed, nominal speed and acceleration,
//! pick the trapezoidal (or degenerate) profile the preparer integrates.
//! All distances are measured in millimeters *remaining from the block
//! end*, so `accelerate_until` and `decelerate_after` shrink toward zero as
//! the block executes.

use libm::sqrtf;

use crate::planner::PlannerBlock;

/// Sub-phase of a velocity profile. A plain tag: the integration loop
/// switches on it instead of dispatching on a profile object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub enum Ramp {
    Accel,
    Cruise,
    Decel,
    /// Entry speed exceeds nominal (a feed override dropped mid-motion):
    /// decelerate down to nominal, then continue as a cruise.
    DecelOverride,
}

/// The selected profile, handed back to the preparer's integration state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProfilePlan {
    pub ramp: Ramp,
    /// Distance remaining at which acceleration ends.
    pub accelerate_until: f32,
    /// Distance remaining at which deceleration begins.
    pub decelerate_after: f32,
    pub maximum_speed: f32,
    pub exit_speed: f32,
    /// Distance remaining at which the profile is complete. Non-zero only
    /// for a feed hold that bottoms out inside the block.
    pub mm_complete: f32,
    /// The block must be re-entered with `current_speed = exit_speed`
    /// because the override deceleration spills into the next block.
    pub decel_override_pending: bool,
}

pub(crate) fn plan_profile(
    block: &PlannerBlock,
    current_speed: f32,
    exit_speed_sqr: f32,
    nominal_speed: f32,
    hold_active: bool,
) -> ProfilePlan {
    let inv_2_accel = 0.5 / block.acceleration;

    if hold_active {
        // Forced deceleration to zero. If the block is too short to come to
        // a stop, chain the remainder into the next block via `exit_speed`.
        let mut plan = ProfilePlan {
            ramp: Ramp::Decel,
            accelerate_until: block.millimeters,
            decelerate_after: 0.0,
            maximum_speed: current_speed,
            exit_speed: 0.0,
            mm_complete: 0.0,
            decel_override_pending: false,
        };
        let decel_dist = block.millimeters - inv_2_accel * block.entry_speed_sqr;
        if decel_dist < 0.0 {
            plan.exit_speed =
                sqrtf(block.entry_speed_sqr - 2.0 * block.acceleration * block.millimeters);
        } else {
            plan.mm_complete = decel_dist;
        }
        return plan;
    }

    let exit_speed = sqrtf(exit_speed_sqr);
    let nominal_speed_sqr = nominal_speed * nominal_speed;
    let mut plan = ProfilePlan {
        ramp: Ramp::Accel,
        accelerate_until: block.millimeters,
        decelerate_after: 0.0,
        maximum_speed: nominal_speed,
        exit_speed,
        mm_complete: 0.0,
        decel_override_pending: false,
    };

    if block.entry_speed_sqr > nominal_speed_sqr {
        // Entering faster than nominal: only after a mid-motion override
        // reduction.
        plan.accelerate_until =
            block.millimeters - inv_2_accel * (block.entry_speed_sqr - nominal_speed_sqr);
        if plan.accelerate_until <= 0.0 {
            // Can't reach nominal within this block; decelerate through it
            // and let the next block pick up from the computed exit speed.
            plan.ramp = Ramp::Decel;
            plan.maximum_speed = current_speed;
            plan.exit_speed =
                sqrtf(block.entry_speed_sqr - 2.0 * block.acceleration * block.millimeters);
            plan.decel_override_pending = true;
        } else {
            plan.ramp = Ramp::DecelOverride;
            plan.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
        }
        return plan;
    }

    let intersect =
        0.5 * (block.millimeters + inv_2_accel * (block.entry_speed_sqr - exit_speed_sqr));
    if intersect <= 0.0 {
        // Acceleration through the whole block.
        plan.accelerate_until = 0.0;
        plan.decelerate_after = 0.0;
        plan.maximum_speed = exit_speed;
    } else if intersect < block.millimeters {
        plan.decelerate_after = inv_2_accel * (nominal_speed_sqr - exit_speed_sqr);
        if plan.decelerate_after < intersect {
            // Trapezoid. Exact equality is deliberate: the planner assigns
            // entry speeds equal to nominal when a block starts at cruise.
            if block.entry_speed_sqr == nominal_speed_sqr {
                plan.ramp = Ramp::Cruise;
            } else {
                plan.accelerate_until -=
                    inv_2_accel * (nominal_speed_sqr - block.entry_speed_sqr);
            }
        } else {
            // Triangle: accelerate to the intersection, then decelerate.
            plan.accelerate_until = intersect;
            plan.decelerate_after = intersect;
            plan.maximum_speed = sqrtf(2.0 * block.acceleration * intersect + exit_speed_sqr);
        }
    } else {
        // Deceleration through the whole block.
        plan.ramp = Ramp::Decel;
        plan.maximum_speed = current_speed;
    }
    plan
}
