//! Error types for the erosion simulation.

use crate::sim::stages::Stage;

/// Errors surfaced by the simulation lifecycle and the stage pipeline.
#[derive(Debug)]
pub enum SimulationError {
    /// Grid side length was zero or otherwise unusable.
    InvalidSize(usize),
    /// Source elevation field was missing, mis-sized, or contained
    /// non-finite samples.
    InvalidHeightmap(String),
    /// The compute backend could not be acquired. The step that hit this
    /// is a no-op; the next step retries.
    BackendUnavailable(String),
    /// A stage could not complete for every cell. The iteration's writes
    /// were discarded and the read buffers keep their previous state.
    StageFailure { stage: Stage, reason: String },
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationError::InvalidSize(size) => {
                write!(f, "invalid grid size: {}", size)
            }
            SimulationError::InvalidHeightmap(reason) => {
                write!(f, "invalid heightmap source: {}", reason)
            }
            SimulationError::BackendUnavailable(reason) => {
                write!(f, "compute backend unavailable: {}", reason)
            }
            SimulationError::StageFailure { stage, reason } => {
                write!(f, "stage {} failed: {}", stage.name(), reason)
            }
        }
    }
}

impl std::error::Error for SimulationError {}
