use thiserror::Error;

/// Errors surfaced by the simulation harness.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimError {
    #[error("simulation did not settle within {ticks} ticks")]
    Timeout { ticks: u64 },

    #[error("motion stopped before the target pulse count was reached")]
    UnexpectedStop,
}
