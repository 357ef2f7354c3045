//! Simulation parameters and configuration.

use serde::{Deserialize, Serialize};

use crate::sim::stages::Stage;

/// Smallest usable time step. Smaller values are clamped up so velocity
/// derivation never divides by zero.
const MIN_TIME_STEP: f32 = 1e-6;

/// Smallest usable physical cell size.
const MIN_CELL_SIZE: f32 = 1e-6;

/// Bitmask selecting which pipeline stages run each iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMask(u8);

impl StageMask {
    pub const NONE: StageMask = StageMask(0);
    pub const RAINFALL: StageMask = StageMask(1 << 0);
    pub const OUTFLOW: StageMask = StageMask(1 << 1);
    pub const VELOCITY: StageMask = StageMask(1 << 2);
    pub const EROSION_DEPOSITION: StageMask = StageMask(1 << 3);
    pub const SEDIMENT_TRANSPORT: StageMask = StageMask(1 << 4);
    pub const EVAPORATION: StageMask = StageMask(1 << 5);
    pub const ALL: StageMask = StageMask(0x3f);

    pub fn contains(self, stage: Stage) -> bool {
        self.0 & stage.mask().0 != 0
    }

    pub fn with(self, other: StageMask) -> StageMask {
        StageMask(self.0 | other.0)
    }

    pub fn without(self, other: StageMask) -> StageMask {
        StageMask(self.0 & !other.0)
    }
}

impl Default for StageMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// How water enters the grid during the rainfall stage.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RainfallMode {
    /// Every cell gains `rainfall * time_step` each iteration.
    Uniform,
    /// Randomly chosen cells gain a whole droplet of `rainfall * time_step`;
    /// the rest gain nothing. Deterministic for a fixed `seed`.
    Droplets { probability: f32 },
}

impl Default for RainfallMode {
    fn default() -> Self {
        Self::Uniform
    }
}

/// Simulation intensity preset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SimulationPreset {
    /// Subtle reshaping, slow water
    Gentle,
    /// Balanced erosion
    #[default]
    Normal,
    /// Fast carving, deep channels
    Dramatic,
}

impl SimulationPreset {
    pub fn all() -> &'static [Self] {
        &[Self::Gentle, Self::Normal, Self::Dramatic]
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Gentle => "Subtle reshaping, slow water",
            Self::Normal => "Balanced erosion",
            Self::Dramatic => "Fast carving, deep channels",
        }
    }
}

impl std::fmt::Display for SimulationPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gentle => write!(f, "gentle"),
            Self::Normal => write!(f, "normal"),
            Self::Dramatic => write!(f, "dramatic"),
        }
    }
}

/// Tunables consumed by the simulator. Immutable during a step; replaced
/// wholesale through `ErosionSimulator::update_parameters`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Grid side length in cells
    pub size: usize,

    /// Physical size of one cell
    pub cell_size: f32,

    /// Pipeline iterations executed per `simulation_step` call (min 1)
    pub iterations_per_frame: usize,

    /// Water added per cell per unit time (0.0-1.0)
    pub rainfall: f32,

    /// Fraction of standing water lost per unit time (0.0-1.0)
    pub evaporation: f32,

    /// Sediment carrying capacity multiplier
    /// (capacity = factor * |velocity| * slope)
    pub capacity_factor: f32,

    /// Surface slopes below this drive no outflow
    pub min_slope: f32,

    /// Rate at which excess sediment settles back into the ground
    pub deposit_speed: f32,

    /// Rate at which under-capacity flow digs into the ground
    pub erode_speed: f32,

    /// Gravitational acceleration scaling the outflow flux
    pub gravity: f32,

    /// Simulation time advanced per iteration
    pub time_step: f32,

    /// Which stages run each iteration (default: all)
    pub enabled_stages: StageMask,

    /// Rainfall seeding policy
    pub rainfall_mode: RainfallMode,

    /// Base seed for the droplet rainfall policy
    pub seed: u64,

    /// Run the pipeline on the GPU compute backend when available
    pub use_gpu: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            size: 256,
            cell_size: 1.0,
            iterations_per_frame: 1,
            rainfall: 0.012,
            evaporation: 0.015,
            capacity_factor: 8.0,
            min_slope: 0.005,
            deposit_speed: 0.3,
            erode_speed: 0.3,
            gravity: 9.81,
            time_step: 0.02,
            enabled_stages: StageMask::ALL,
            rainfall_mode: RainfallMode::Uniform,
            seed: 0,
            use_gpu: false,
        }
    }
}

impl SimulationParams {
    /// Normalize all range-constrained fields. Out-of-range values are a
    /// tuning mistake, not a fatal error, so they clamp instead of failing.
    pub fn clamped(mut self) -> Self {
        self.iterations_per_frame = self.iterations_per_frame.max(1);
        self.rainfall = self.rainfall.clamp(0.0, 1.0);
        self.evaporation = self.evaporation.clamp(0.0, 1.0);
        self.capacity_factor = self.capacity_factor.max(0.0);
        self.min_slope = self.min_slope.max(0.0);
        self.deposit_speed = self.deposit_speed.clamp(0.0, 1.0);
        self.erode_speed = self.erode_speed.clamp(0.0, 1.0);
        self.gravity = self.gravity.max(0.0);
        self.time_step = self.time_step.max(MIN_TIME_STEP);
        self.cell_size = self.cell_size.max(MIN_CELL_SIZE);
        if let RainfallMode::Droplets { probability } = &mut self.rainfall_mode {
            *probability = probability.clamp(0.0, 1.0);
        }
        self
    }

    /// Create parameters from a preset.
    pub fn from_preset(preset: SimulationPreset) -> Self {
        match preset {
            SimulationPreset::Gentle => Self {
                rainfall: 0.006,
                erode_speed: 0.1,
                deposit_speed: 0.1,
                capacity_factor: 4.0,
                ..Default::default()
            },
            SimulationPreset::Normal => Self::default(),
            SimulationPreset::Dramatic => Self {
                rainfall: 0.03,
                erode_speed: 0.6,
                deposit_speed: 0.2,
                capacity_factor: 16.0,
                evaporation: 0.008,
                ..Default::default()
            },
        }
    }
}
