//! Planner interface contract.
//!
//! Look-ahead planning happens elsewhere; the execution core consumes one
//! [`PlannerBlock`] at a time through the [`Planner`] trait. The preparer
//! re-borrows the active block on every pass instead of holding onto it, and
//! writes its progress (`millimeters`, `entry_speed_sqr`) back through the
//! same borrow so the planner can re-plan a partially executed block.

use crate::config::N_AXIS;

/// Condition flags of a planner block, packed into one byte.
///
/// A thin typed wrapper over the raw flag byte, so a block condition can't
/// be confused with the crate's other bitmasks (axis masks, settings
/// flags). Combine flags with `|`; test them with
/// [`intersects`](Self::intersects).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockCondition(pub u8);

impl BlockCondition {
    /// Plain feed motion: no spindle, no special handling.
    pub const NONE: Self = Self(0);
    /// Spindle on, clockwise.
    pub const SPINDLE_CW: Self = Self(1 << 0);
    /// Spindle on, counter-clockwise. In laser mode this also couples the
    /// PWM to the realtime feed rate.
    pub const SPINDLE_CCW: Self = Self(1 << 1);
    /// Backlash compensation move: pulses are emitted but the machine
    /// position counters must not advance.
    pub const BACKLASH_COMP: Self = Self(1 << 2);
    /// Block originates from a system motion (homing, parking), not the
    /// queued program.
    pub const SYSTEM_MOTION: Self = Self(1 << 3);
    /// Rapid and system moves run at their programmed rate; the feed
    /// override must not scale them.
    pub const NO_FEED_OVERRIDE: Self = Self(1 << 4);

    /// Any of the bits in `flags` is set.
    pub const fn intersects(self, flags: Self) -> bool {
        self.0 & flags.0 != 0
    }
}

impl core::ops::BitOr for BlockCondition {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for BlockCondition {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One straight-line motion command with its speed plan.
///
/// Speeds are mm/min (squared where noted), acceleration is mm/min², and
/// `millimeters` is the distance still to be executed; the preparer reduces
/// it in place as segments are staged.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde-support", derive(serde::Serialize, serde::Deserialize))]
pub struct PlannerBlock {
    /// Per-axis step counts, unsigned; direction is in `direction_bits`.
    pub steps: [u32; N_AXIS],
    /// Maximum of `steps`, the Bresenham dominant-axis count.
    pub step_event_count: u32,
    /// One bit per axis, set for negative travel.
    pub direction_bits: u8,
    /// Condition flags, see [`BlockCondition`].
    pub condition: BlockCondition,
    /// Distance remaining in this block.
    pub millimeters: f32,
    /// Speed at block entry, squared. Re-planned in place on mid-block
    /// velocity updates.
    pub entry_speed_sqr: f32,
    pub acceleration: f32,
    /// Programmed feed rate before overrides.
    pub programmed_rate: f32,
    /// Programmed spindle speed in RPM.
    pub spindle_speed: f32,
}

/// The planner contract the execution core consumes.
pub trait Planner {
    /// The block currently at the head of the program queue, if any. The
    /// same block keeps being returned until it is discarded.
    fn current_block(&mut self) -> Option<&mut PlannerBlock>;

    /// The single system-motion block (homing or parking move), if one is
    /// staged.
    fn system_motion_block(&mut self) -> Option<&mut PlannerBlock>;

    /// Drop the head block once every one of its steps has been staged.
    fn discard_current_block(&mut self);

    /// Exit speed (squared) the look-ahead plan assigns to the block being
    /// executed, i.e. the entry speed of its successor.
    fn exec_block_exit_speed_sqr(&mut self) -> f32;

    /// Nominal speed for `block` with rapid/feed overrides applied.
    fn profile_nominal_speed(&self, block: &PlannerBlock) -> f32;
}
