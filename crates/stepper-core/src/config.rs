//! Compile-time configuration.
//!
//! Everything the core needs to know about the machine build is a constant:
//! there is no runtime configuration path into the interrupt handlers, and
//! invalid combinations are rejected when the crate is compiled.

/// Number of controlled axes.
pub const N_AXIS: usize = 3;

/// Axis indices, also the bit positions in axis masks and on the step and
/// direction ports.
pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

/// Port bit driven in lockstep with X when the gantry has a second X driver.
#[cfg(feature = "dual-x-axis")]
pub const DUAL_X_BIT: usize = 3;
/// Port bit driven in lockstep with Y when the gantry has a second Y driver.
#[cfg(feature = "dual-y-axis")]
pub const DUAL_Y_BIT: usize = 4;

/// Number of slots in the segment ring. One slot always stays open, so the
/// preparer can stage at most `SEGMENT_BUFFER_SIZE - 1` segments ahead of
/// the execution engine.
pub const SEGMENT_BUFFER_SIZE: usize = 10;

/// Size of the block data pool. Deliberately one smaller than the segment
/// ring: block entries are allocated round-robin and a segment keeps its
/// ring slot until fully executed, so a fresh block entry can never land on
/// one that a live segment still references.
pub const BLOCK_POOL_SIZE: usize = SEGMENT_BUFFER_SIZE - 1;

/// Pre-shift applied to every block's step counts for adaptive multi-axis
/// step smoothing. A segment may divide the per-tick increments by up to
/// `2^MAX_AMASS_LEVEL` without losing steps to truncation.
pub const MAX_AMASS_LEVEL: u8 = 3;

/// How many segments the preparer integrates per second of motion.
pub const ACCELERATION_TICKS_PER_SECOND: u32 = 100;

/// Nominal time span of one segment, in minutes (speeds are mm/min).
pub const DT_SEGMENT: f32 = 1.0 / (ACCELERATION_TICKS_PER_SECOND as f32 * 60.0);

/// Frequency of the stepper timer peripheral, in Hz.
pub const F_TIMER_STEPPER: u32 = 24_000_000;

/// Timer cycles per microsecond.
pub const TICKS_PER_MICROSECOND: u32 = F_TIMER_STEPPER / 1_000_000;

/// Ceiling on the step interrupt rate the CPU is expected to service.
pub const MAX_STEP_RATE_HZ: u32 = 60_000;

/// Smallest timer reload the engine will ever program.
pub const STEP_TIMER_MIN: u16 = (F_TIMER_STEPPER / MAX_STEP_RATE_HZ) as u16;

/// Step-smoothing cutoffs, in timer cycles per step. A segment slower than
/// a cutoff runs at the next-higher smoothing level, which multiplies the
/// tick rate without changing the dominant-axis step rate; the thresholds
/// keep the interrupt rate at or below roughly 16 kHz.
pub const AMASS_LEVEL1: u32 = F_TIMER_STEPPER / 8_000;
pub const AMASS_LEVEL2: u32 = F_TIMER_STEPPER / 4_000;
pub const AMASS_LEVEL3: u32 = F_TIMER_STEPPER / 2_000;

/// Scales the minimum distance a segment must cover so that it always
/// contains at least one whole step.
pub const REQ_MM_INCREMENT_SCALAR: f32 = 1.25;

const _: () = assert!(
    MAX_AMASS_LEVEL >= 1 && MAX_AMASS_LEVEL <= 3,
    "step smoothing requires between one and three levels"
);
const _: () = assert!(SEGMENT_BUFFER_SIZE >= 3, "ring must hold at least two staged segments");
const _: () = assert!(N_AXIS >= 1 && N_AXIS <= 3, "axis masks are laid out for up to three axes");
const _: () = assert!(STEP_TIMER_MIN as u32 >= 1);
