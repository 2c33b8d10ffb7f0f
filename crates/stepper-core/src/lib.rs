//! # Stepper Motion Execution Core
//!
//! A deterministic, `no_std`-friendly execution core for multi-axis stepper
//! motion: it consumes pre-planned motion blocks and turns them into
//! precisely timed step and direction pulses, tracing the commanded
//! velocity profile without losing or inventing a single step.
//!
//! ## Operation
//!
//! Two cooperating halves share a lock-free ring of precomputed segments:
//!
//! 1. The [`SegmentPreparer`] runs in the foreground. It pulls blocks from
//!    a [`Planner`], integrates a trapezoidal velocity profile in floating
//!    point, and publishes fixed-rate [`Segment`]s.
//! 2. The [`StepExecutor`] runs in a high-frequency timer interrupt. It
//!    pops segments, runs a fixed-point Bresenham tracer across the axes,
//!    emits pulses through the [`hal`] traits, and advances the machine
//!    position counters in [`SystemState`].
//!
//! A typical firmware wires it up once at startup:
//!
//! ```ignore
//! static SYSTEM: SystemState = SystemState::new();
//! static mut SEGMENTS: SegmentBuffer = SegmentBuffer::new();
//!
//! let (producer, consumer) = unsafe { SEGMENTS.split() };
//! let mut preparer = SegmentPreparer::new(producer);
//! let mut executor = StepExecutor::new(consumer, &settings);
//!
//! // Control loop: preparer.prepare_buffer(&mut planner, ...);
//! // Timer ISR:    executor.on_timer_tick(&mut hardware, ...);
//! // Compare ISR:  executor.on_pulse_reset(&mut hardware.step_port);
//! ```
//!
//! Cycle lifecycle maps onto [`StepExecutor::wake_up`],
//! [`StepExecutor::disable`], [`StepExecutor::reset`] plus
//! [`SegmentPreparer::reset`] and [`segment::clear_segment_buffer`];
//! realtime events onto [`SegmentPreparer::update_block_parameters`] (plan
//! updates, feed hold entry) and the `step_control` bits of
//! [`SystemState`].
//!
//! ## Safety
//!
//! The interrupt path never allocates, never blocks, and never touches
//! floating point. The only `unsafe` in the crate is the publication
//! protocol inside [`segment`], documented there.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod config;
pub mod exec;
pub mod hal;
pub mod planner;
pub mod prep;
pub mod profile;
pub mod segment;
pub mod settings;
pub mod system;

pub use exec::StepExecutor;
pub use hal::{DriverEnable, MotionHardware, Probe, Spindle, StepPort, StepTimer};
pub use planner::{BlockCondition, Planner, PlannerBlock};
pub use prep::SegmentPreparer;
pub use profile::Ramp;
pub use segment::{Segment, SegmentBuffer, SegmentConsumer, SegmentProducer, StepperBlock};
pub use settings::Settings;
pub use system::{MachineState, SystemState};
