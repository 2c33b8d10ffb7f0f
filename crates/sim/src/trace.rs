//! Pulse trace records and serialization, for offline analysis of a
//! simulated run.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One emitted step pulse: when it happened (in stepper-timer cycles) and
/// which axes stepped in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseRecord {
    pub t_cycles: u64,
    pub step_bits: u8,
    pub dir_bits: u8,
}

/// Dump a pulse trace as JSON.
pub fn write_trace(path: &Path, pulses: &[PulseRecord]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("creating trace file {}", path.display()))?;
    serde_json::to_writer_pretty(file, pulses).context("serializing pulse trace")?;
    Ok(())
}
