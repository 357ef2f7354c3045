//! Shallow-water erosion simulation
//!
//! Evolves a square elevation grid by repeatedly running a fixed six-stage
//! per-cell pipeline:
//! 1. **Rainfall**: water enters the grid (uniform or droplet seeding)
//! 2. **Outflow**: directional flux from surface-level differences,
//!    clamped so no cell gives away more water than it holds
//! 3. **Velocity**: the settled flux balance moves water and yields a
//!    flow velocity field
//! 4. **Erosion/deposition**: flow exchanges material with the ground
//!    based on its transport capacity
//! 5. **Sediment transport**: suspended sediment advects with the flow
//! 6. **Evaporation**: standing water decays
//!
//! All fields are double-buffered; each stage reads the committed previous
//! generation and its writes become visible only at the stage-boundary
//! commit, so the per-cell work parallelizes freely.

pub mod error;
pub mod gpu;
pub mod grid;
pub mod params;
pub mod stages;

pub use error::SimulationError;
pub use grid::{FieldId, SimulationGrid};
pub use params::{RainfallMode, SimulationParams, SimulationPreset, StageMask};
pub use stages::Stage;

use crate::field::Field;
use gpu::GpuStageExecutor;
use stages::ErosionTotals;

/// Totals from one `simulation_step` call.
#[derive(Clone, Copy, Debug, Default)]
pub struct StepStats {
    /// Pipeline iterations executed
    pub iterations: usize,
    /// Ground removed across all cells (height units)
    pub total_eroded: f64,
    /// Ground returned across all cells
    pub total_deposited: f64,
    /// Largest single-cell erosion in one iteration
    pub max_erosion: f32,
    /// Largest single-cell deposition in one iteration
    pub max_deposition: f32,
    /// Standing water summed over the grid after the step
    pub total_water: f64,
    /// Suspended sediment summed over the grid after the step
    pub total_sediment: f64,
}

impl StepStats {
    fn absorb(&mut self, totals: ErosionTotals) {
        self.total_eroded += totals.eroded;
        self.total_deposited += totals.deposited;
        self.max_erosion = self.max_erosion.max(totals.max_erosion);
        self.max_deposition = self.max_deposition.max(totals.max_deposition);
    }
}

/// Mix the base seed with the iteration counter so droplet placement
/// decorrelates between iterations while staying reproducible.
fn rain_seed(seed: u64, iteration: u64) -> u64 {
    seed.wrapping_add(iteration.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Owns the simulation grid and drives the stage pipeline.
///
/// Lifecycle: `init` → any number of `simulation_step` / `refresh` /
/// `update_parameters` calls → `release`. After `release` the simulator
/// is inert until the next `init`.
pub struct ErosionSimulator {
    params: SimulationParams,
    grid: Option<SimulationGrid>,
    source: Option<Field<f32>>,
    iteration: u64,
    gpu: Option<GpuStageExecutor>,
}

impl ErosionSimulator {
    pub fn new() -> Self {
        Self {
            params: SimulationParams::default().clamped(),
            grid: None,
            source: None,
            iteration: 0,
            gpu: None,
        }
    }

    /// Allocate the grid sized to `params.size`, seed height from the
    /// source field and zero the dynamic fields. The source is retained
    /// for later `refresh` calls.
    pub fn init(
        &mut self,
        source: &Field<f32>,
        params: SimulationParams,
    ) -> Result<(), SimulationError> {
        let params = params.clamped();
        if params.size == 0 {
            return Err(SimulationError::InvalidSize(params.size));
        }
        if source.size != params.size {
            return Err(SimulationError::InvalidHeightmap(format!(
                "source is {0}x{0}, parameters want {1}x{1}",
                source.size, params.size
            )));
        }
        if source.as_slice().iter().any(|v| !v.is_finite()) {
            return Err(SimulationError::InvalidHeightmap(
                "source contains non-finite samples".to_string(),
            ));
        }

        let mut grid = SimulationGrid::allocate(params.size)?;
        grid.seed_height(source)?;
        grid.reset_dynamic_fields();

        self.grid = Some(grid);
        self.source = Some(source.clone());
        self.params = params;
        self.iteration = 0;
        Ok(())
    }

    /// Re-seed height from the originally supplied source and zero the
    /// dynamic fields, without reallocating.
    pub fn refresh(&mut self) {
        let (grid, source) = match (&mut self.grid, &self.source) {
            (Some(grid), Some(source)) => (grid, source),
            _ => {
                println!("WARNING: refresh skipped, simulator not initialized");
                return;
            }
        };
        if let Err(e) = grid.seed_height(source) {
            println!("WARNING: refresh failed: {}", e);
            return;
        }
        grid.reset_dynamic_fields();
        self.iteration = 0;
    }

    /// Replace the active parameter set without touching grid contents.
    /// A changed `size` only takes effect at the next `init`.
    pub fn update_parameters(&mut self, params: SimulationParams) {
        let params = params.clamped();
        if let Some(grid) = &self.grid {
            if grid.size() != params.size {
                println!(
                    "WARNING: parameter size {} differs from allocated grid {}; \
                     new size takes effect at the next init",
                    params.size,
                    grid.size()
                );
            }
        }
        self.params = params;
    }

    /// Run `iterations_per_frame` iterations of the stage pipeline.
    ///
    /// A logged no-op when the grid is unallocated or the GPU backend
    /// cannot be acquired (the next call retries). A stage failure
    /// surfaces as an error with the iteration's writes discarded.
    pub fn simulation_step(&mut self) -> Result<StepStats, SimulationError> {
        let grid = match &mut self.grid {
            Some(grid) => grid,
            None => {
                println!("WARNING: simulation step skipped, grid not allocated");
                return Ok(StepStats::default());
            }
        };

        let iterations = self.params.iterations_per_frame;
        let mut stats = StepStats {
            iterations,
            ..Default::default()
        };

        if self.params.use_gpu {
            if self.gpu.is_none() {
                match GpuStageExecutor::new() {
                    Ok(ctx) => self.gpu = Some(ctx),
                    Err(e) => {
                        println!("WARNING: {}; step skipped, will retry", e);
                        return Ok(StepStats::default());
                    }
                }
            }
            if let Some(ctx) = &self.gpu {
                let base_seed = rain_seed(self.params.seed, self.iteration);
                let totals = ctx.run_step(grid, &self.params, iterations, base_seed)?;
                stats.absorb(totals);
                self.iteration += iterations as u64;
            }
        } else {
            for _ in 0..iterations {
                let seed = rain_seed(self.params.seed, self.iteration);
                let totals = stages::run_iteration(grid, &self.params, seed);
                stats.absorb(totals);
                self.iteration += 1;
            }
        }

        stats.total_water = grid.water().as_slice().iter().map(|&w| w as f64).sum();
        stats.total_sediment = grid.sediment().as_slice().iter().map(|&s| s as f64).sum();
        Ok(stats)
    }

    /// Free the grid. The simulator accepts a new `init` afterwards;
    /// until then stepping is a logged no-op and the accessors are empty.
    pub fn release(&mut self) {
        self.grid = None;
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn height(&self) -> Option<&Field<f32>> {
        self.grid.as_ref().map(|g| g.height())
    }

    pub fn water(&self) -> Option<&Field<f32>> {
        self.grid.as_ref().map(|g| g.water())
    }

    pub fn sediment(&self) -> Option<&Field<f32>> {
        self.grid.as_ref().map(|g| g.sediment())
    }

    pub fn outflow(&self) -> Option<&Field<[f32; 4]>> {
        self.grid.as_ref().map(|g| g.outflow())
    }

    pub fn velocity(&self) -> Option<&Field<[f32; 2]>> {
        self.grid.as_ref().map(|g| g.velocity())
    }
}

impl Default for ErosionSimulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_source(size: usize) -> Field<f32> {
        let mut source = Field::new_with(size, 0.0f32);
        for y in 0..size {
            for x in 0..size {
                source.set(x, y, (x + y) as f32 / (2 * size) as f32);
            }
        }
        source
    }

    fn test_params(size: usize) -> SimulationParams {
        SimulationParams {
            size,
            time_step: 0.05,
            rainfall: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_init_rejects_mismatched_source() {
        let mut sim = ErosionSimulator::new();
        let source = ramp_source(8);
        let result = sim.init(&source, test_params(16));
        assert!(matches!(result, Err(SimulationError::InvalidHeightmap(_))));
    }

    #[test]
    fn test_init_rejects_non_finite_source() {
        let mut sim = ErosionSimulator::new();
        let mut source = ramp_source(8);
        source.set(3, 3, f32::NAN);
        let result = sim.init(&source, test_params(8));
        assert!(matches!(result, Err(SimulationError::InvalidHeightmap(_))));
    }

    #[test]
    fn test_step_without_init_is_noop() {
        let mut sim = ErosionSimulator::new();
        let stats = sim.simulation_step().unwrap();
        assert_eq!(stats.iterations, 0);
        assert_eq!(stats.total_water, 0.0);
        assert!(sim.height().is_none());
    }

    #[test]
    fn test_release_then_reinit() {
        let mut sim = ErosionSimulator::new();
        let source = ramp_source(8);
        sim.init(&source, test_params(8)).unwrap();
        sim.simulation_step().unwrap();
        assert!(sim.water().is_some());

        sim.release();
        assert!(sim.height().is_none());
        assert!(sim.velocity().is_none());
        let stats = sim.simulation_step().unwrap();
        assert_eq!(stats.iterations, 0);

        sim.init(&source, test_params(8)).unwrap();
        assert!(sim.height().is_some());
    }

    #[test]
    fn test_refresh_restores_initial_state() {
        let mut sim = ErosionSimulator::new();
        let source = ramp_source(16);
        sim.init(&source, test_params(16)).unwrap();

        for _ in 0..10 {
            sim.simulation_step().unwrap();
        }
        assert!(sim.water().unwrap().as_slice().iter().any(|&w| w > 0.0));

        sim.refresh();
        assert_eq!(sim.height().unwrap().as_slice(), source.as_slice());
        assert!(sim.water().unwrap().as_slice().iter().all(|&w| w == 0.0));
        assert!(sim.sediment().unwrap().as_slice().iter().all(|&s| s == 0.0));
        assert!(sim
            .outflow()
            .unwrap()
            .as_slice()
            .iter()
            .all(|&f| f == [0.0; 4]));
    }

    #[test]
    fn test_runs_are_bit_identical() {
        let source = ramp_source(16);
        let params = SimulationParams {
            rainfall_mode: RainfallMode::Droplets { probability: 0.1 },
            seed: 7,
            iterations_per_frame: 4,
            ..test_params(16)
        };

        let mut sim_a = ErosionSimulator::new();
        let mut sim_b = ErosionSimulator::new();
        sim_a.init(&source, params.clone()).unwrap();
        sim_b.init(&source, params).unwrap();

        for _ in 0..5 {
            sim_a.simulation_step().unwrap();
            sim_b.simulation_step().unwrap();
        }

        assert_eq!(
            sim_a.height().unwrap().as_slice(),
            sim_b.height().unwrap().as_slice()
        );
        assert_eq!(
            sim_a.water().unwrap().as_slice(),
            sim_b.water().unwrap().as_slice()
        );
        assert_eq!(
            sim_a.sediment().unwrap().as_slice(),
            sim_b.sediment().unwrap().as_slice()
        );
        assert_eq!(
            sim_a.outflow().unwrap().as_slice(),
            sim_b.outflow().unwrap().as_slice()
        );
        assert_eq!(
            sim_a.velocity().unwrap().as_slice(),
            sim_b.velocity().unwrap().as_slice()
        );
    }

    #[test]
    fn test_disabled_stages_leave_fields_alone() {
        let mut sim = ErosionSimulator::new();
        let source = ramp_source(8);
        let params = SimulationParams {
            enabled_stages: StageMask::NONE,
            ..test_params(8)
        };
        sim.init(&source, params).unwrap();
        let stats = sim.simulation_step().unwrap();

        assert_eq!(stats.total_eroded, 0.0);
        assert_eq!(sim.height().unwrap().as_slice(), source.as_slice());
        assert!(sim.water().unwrap().as_slice().iter().all(|&w| w == 0.0));
    }

    #[test]
    fn test_rainfall_only_fills_water() {
        let mut sim = ErosionSimulator::new();
        let source = ramp_source(8);
        let params = SimulationParams {
            enabled_stages: StageMask::NONE.with(StageMask::RAINFALL),
            rainfall: 0.5,
            time_step: 0.1,
            ..test_params(8)
        };
        sim.init(&source, params).unwrap();
        let stats = sim.simulation_step().unwrap();

        let expected_per_cell = 0.5 * 0.1;
        for &w in sim.water().unwrap().as_slice() {
            assert!((w - expected_per_cell).abs() < 1e-6);
        }
        let expected_total = expected_per_cell as f64 * 64.0;
        assert!((stats.total_water - expected_total).abs() < 1e-4);
    }

    #[test]
    fn test_update_parameters_clamps_and_keeps_grid() {
        let mut sim = ErosionSimulator::new();
        let source = ramp_source(8);
        sim.init(&source, test_params(8)).unwrap();
        sim.simulation_step().unwrap();
        let water_before = sim.water().unwrap().as_slice().to_vec();

        sim.update_parameters(SimulationParams {
            rainfall: 42.0,
            ..test_params(8)
        });
        assert_eq!(sim.params().rainfall, 1.0);
        // Grid contents untouched by the parameter swap.
        assert_eq!(sim.water().unwrap().as_slice(), water_before.as_slice());
    }

    #[test]
    fn test_long_run_stays_finite() {
        let mut sim = ErosionSimulator::new();
        let source = ramp_source(16);
        let params = SimulationParams {
            iterations_per_frame: 4,
            ..test_params(16)
        };
        sim.init(&source, params).unwrap();

        for _ in 0..25 {
            let stats = sim.simulation_step().unwrap();
            assert!(stats.total_water.is_finite());
            assert!(stats.total_sediment >= 0.0);
        }
        for &h in sim.height().unwrap().as_slice() {
            assert!(h.is_finite());
        }
        for &w in sim.water().unwrap().as_slice() {
            assert!(w >= 0.0 && w.is_finite());
        }
        for &s in sim.sediment().unwrap().as_slice() {
            assert!(s >= 0.0 && s.is_finite());
        }
    }
}
