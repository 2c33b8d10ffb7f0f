//! # In-Process Simulation Harness
//!
//! Runs the real segment preparer and step execution engine against a
//! scripted planner and trace-recording hardware, entirely on the host and
//! without physical hardware. Tests reconstruct the full pulse train with
//! cycle-accurate timestamps and assert on step conservation, pulse
//! spacing, rate profiles, and realtime event handling.

pub mod error;
pub mod hw;
pub mod machine;
pub mod planner;
pub mod trace;

pub use error::SimError;
pub use machine::{SimHardware, SimMachine};
pub use planner::{MoveSpec, ScriptedPlanner};
pub use trace::{write_trace, PulseRecord};

/// Install the test log subscriber. Safe to call from every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
