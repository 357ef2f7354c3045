//! The six per-cell pipeline stages and their parallel CPU executor.
//!
//! Every stage is a pure function of the read buffers frozen at stage
//! start: a cell's output depends only on the previous generation of the
//! fields the stage declares, never on another cell's in-progress write
//! (classic stencil parallelism). Rows are processed in parallel with
//! rayon; the commit at each stage boundary is the barrier between
//! generations.
//!
//! Stage order is a correctness requirement: outflow must see the water
//! rainfall added, velocity must see the clamped outflow, erosion must see
//! the finalized velocity, and transport must see the sediment the erosion
//! pass produced.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::field::{opposite, Field, DIR_DOWN, DIR_LEFT, DIR_RIGHT, DIR_UP};
use crate::sim::grid::{FieldId, SimulationGrid};
use crate::sim::params::{RainfallMode, SimulationParams, StageMask};

/// One named per-cell update pass within an iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Rainfall,
    Outflow,
    Velocity,
    ErosionDeposition,
    SedimentTransport,
    Evaporation,
}

impl Stage {
    /// Pipeline order, fixed.
    pub const ORDER: [Stage; 6] = [
        Stage::Rainfall,
        Stage::Outflow,
        Stage::Velocity,
        Stage::ErosionDeposition,
        Stage::SedimentTransport,
        Stage::Evaporation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Rainfall => "rainfall",
            Stage::Outflow => "outflow",
            Stage::Velocity => "velocity",
            Stage::ErosionDeposition => "erosion_deposition",
            Stage::SedimentTransport => "sediment_transport",
            Stage::Evaporation => "evaporation",
        }
    }

    pub fn mask(self) -> StageMask {
        match self {
            Stage::Rainfall => StageMask::RAINFALL,
            Stage::Outflow => StageMask::OUTFLOW,
            Stage::Velocity => StageMask::VELOCITY,
            Stage::ErosionDeposition => StageMask::EROSION_DEPOSITION,
            Stage::SedimentTransport => StageMask::SEDIMENT_TRANSPORT,
            Stage::Evaporation => StageMask::EVAPORATION,
        }
    }
}

/// Ground/sediment movement totals for one iteration's erosion pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct ErosionTotals {
    pub eroded: f64,
    pub deposited: f64,
    pub max_erosion: f32,
    pub max_deposition: f32,
}

impl ErosionTotals {
    fn merged(a: Self, b: Self) -> Self {
        Self {
            eroded: a.eroded + b.eroded,
            deposited: a.deposited + b.deposited,
            max_erosion: a.max_erosion.max(b.max_erosion),
            max_deposition: a.max_deposition.max(b.max_deposition),
        }
    }
}

/// Run one full iteration of the pipeline on the CPU, committing each
/// written field at its stage boundary.
pub(crate) fn run_iteration(
    grid: &mut SimulationGrid,
    params: &SimulationParams,
    rain_seed: u64,
) -> ErosionTotals {
    let mask = params.enabled_stages;
    let mut totals = ErosionTotals::default();

    if mask.contains(Stage::Rainfall) {
        apply_rainfall(grid, params, rain_seed);
        grid.commit(FieldId::Water);
    }
    if mask.contains(Stage::Outflow) {
        apply_outflow(grid, params);
        grid.commit(FieldId::Outflow);
    }
    if mask.contains(Stage::Velocity) {
        apply_velocity(grid, params);
        grid.commit(FieldId::Water);
        grid.commit(FieldId::Velocity);
    }
    if mask.contains(Stage::ErosionDeposition) {
        totals = apply_erosion_deposition(grid, params);
        grid.commit(FieldId::Height);
        grid.commit(FieldId::Sediment);
    }
    if mask.contains(Stage::SedimentTransport) {
        apply_sediment_transport(grid, params);
        grid.commit(FieldId::Sediment);
    }
    if mask.contains(Stage::Evaporation) {
        apply_evaporation(grid, params);
        grid.commit(FieldId::Water);
    }

    totals
}

// ---------------------------------------------------------------------------
// Stage 1: rainfall
// ---------------------------------------------------------------------------

pub(crate) fn apply_rainfall(grid: &mut SimulationGrid, params: &SimulationParams, rain_seed: u64) {
    let (water_r, water_w) = grid.water.rw();
    let amount = params.rainfall * params.time_step;

    match params.rainfall_mode {
        RainfallMode::Uniform => {
            water_w
                .as_mut_slice()
                .par_iter_mut()
                .zip(water_r.as_slice().par_iter())
                .for_each(|(w, r)| *w = r + amount);
        }
        RainfallMode::Droplets { probability } => {
            let read = water_r.as_slice();
            water_w
                .as_mut_slice()
                .par_iter_mut()
                .enumerate()
                .for_each(|(idx, w)| {
                    // One cheap seeded stream per cell keeps droplet
                    // placement deterministic and parallel-safe.
                    let mut rng = ChaCha8Rng::seed_from_u64(rain_seed.wrapping_add(idx as u64));
                    *w = if rng.gen::<f32>() < probability {
                        read[idx] + amount
                    } else {
                        read[idx]
                    };
                });
        }
    }
}

// ---------------------------------------------------------------------------
// Stage 2: outflow
// ---------------------------------------------------------------------------

/// Flux leaving a cell toward its four neighbors this iteration.
///
/// The previous flux accumulates with the surface-level difference, scaled
/// by gravity and the time step. Directions whose surface slope is below
/// `min_slope` drive nothing; missing neighbors at the rim drive nothing.
/// The four components are rescaled proportionally whenever their sum
/// would exceed the water available in the cell.
fn outflow_cell(
    height: &Field<f32>,
    water: &Field<f32>,
    outflow: &Field<[f32; 4]>,
    x: usize,
    y: usize,
    params: &SimulationParams,
) -> [f32; 4] {
    let avail = *water.get(x, y);
    if avail <= 0.0 {
        return [0.0; 4];
    }

    let level = *height.get(x, y) + avail;
    let prev = *outflow.get(x, y);
    let mut flux = [0.0f32; 4];

    for dir in 0..4 {
        let (nx, ny) = match height.neighbor(x, y, dir) {
            Some(n) => n,
            None => continue,
        };
        let neighbor_level = *height.get(nx, ny) + *water.get(nx, ny);
        let slope = (level - neighbor_level) / params.cell_size;
        if slope < params.min_slope {
            continue;
        }
        flux[dir] = (prev[dir] + params.time_step * params.gravity * slope).max(0.0);
    }

    let total: f32 = flux.iter().sum();
    if total > avail {
        let scale = avail / total;
        for f in &mut flux {
            *f *= scale;
        }
    }
    flux
}

pub(crate) fn apply_outflow(grid: &mut SimulationGrid, params: &SimulationParams) {
    let size = grid.size;
    let (outflow_r, outflow_w) = grid.outflow.rw();
    let height_r = grid.height.read();
    let water_r = grid.water.read();

    outflow_w
        .as_mut_slice()
        .par_chunks_mut(size)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, cell) in row.iter_mut().enumerate() {
                *cell = outflow_cell(height_r, water_r, outflow_r, x, y, params);
            }
        });
}

// ---------------------------------------------------------------------------
// Stage 3: velocity field
// ---------------------------------------------------------------------------

/// Apply the settled flux balance to the water column and derive the flow
/// velocity from the net directional asymmetry.
fn velocity_cell(
    water: &Field<f32>,
    outflow: &Field<[f32; 4]>,
    x: usize,
    y: usize,
    params: &SimulationParams,
) -> (f32, [f32; 2]) {
    let flux_out = *outflow.get(x, y);
    let mut flux_in = [0.0f32; 4];
    for dir in 0..4 {
        if let Some((nx, ny)) = water.neighbor(x, y, dir) {
            flux_in[dir] = outflow.get(nx, ny)[opposite(dir)];
        }
    }

    let in_sum: f32 = flux_in.iter().sum();
    let out_sum: f32 = flux_out.iter().sum();
    let new_water = (*water.get(x, y) + in_sum - out_sum).max(0.0);

    let flow_x =
        0.5 * (flux_in[DIR_LEFT] - flux_out[DIR_LEFT] + flux_out[DIR_RIGHT] - flux_in[DIR_RIGHT]);
    let flow_y =
        0.5 * (flux_in[DIR_UP] - flux_out[DIR_UP] + flux_out[DIR_DOWN] - flux_in[DIR_DOWN]);
    let denom = params.cell_size * params.time_step;

    (new_water, [flow_x / denom, flow_y / denom])
}

pub(crate) fn apply_velocity(grid: &mut SimulationGrid, params: &SimulationParams) {
    let size = grid.size;
    let (water_r, water_w) = grid.water.rw();
    let (_, velocity_w) = grid.velocity.rw();
    let outflow_r = grid.outflow.read();

    water_w
        .as_mut_slice()
        .par_chunks_mut(size)
        .zip(velocity_w.as_mut_slice().par_chunks_mut(size))
        .enumerate()
        .for_each(|(y, (water_row, velocity_row))| {
            for x in 0..size {
                let (w, v) = velocity_cell(water_r, outflow_r, x, y, params);
                water_row[x] = w;
                velocity_row[x] = v;
            }
        });
}

// ---------------------------------------------------------------------------
// Stage 4: erosion and deposition
// ---------------------------------------------------------------------------

/// Exchange material between the ground and the suspended sediment load.
///
/// Transport capacity grows with flow speed and local terrain slope. Flow
/// under capacity digs; flow over capacity settles. Both deltas are
/// bounded so neither height nor sediment goes negative, and the ground
/// moves only in this stage.
fn erosion_cell(
    height: &Field<f32>,
    sediment: &Field<f32>,
    velocity: &Field<[f32; 2]>,
    x: usize,
    y: usize,
    params: &SimulationParams,
) -> (f32, f32) {
    let h = *height.get(x, y);
    let s = *sediment.get(x, y);
    let v = *velocity.get(x, y);
    let speed = (v[0] * v[0] + v[1] * v[1]).sqrt();

    let (gx, gy) = height.gradient_at_cell(x, y);
    let slope = (gx * gx + gy * gy).sqrt() / params.cell_size;

    let capacity = params.capacity_factor * speed * slope;

    if s < capacity {
        let delta = (params.erode_speed * (capacity - s)).min(h.max(0.0));
        (h - delta, s + delta)
    } else {
        let delta = (params.deposit_speed * (s - capacity)).min(s);
        (h + delta, s - delta)
    }
}

pub(crate) fn apply_erosion_deposition(
    grid: &mut SimulationGrid,
    params: &SimulationParams,
) -> ErosionTotals {
    let size = grid.size;
    let (height_r, height_w) = grid.height.rw();
    let (sediment_r, sediment_w) = grid.sediment.rw();
    let velocity_r = grid.velocity.read();

    height_w
        .as_mut_slice()
        .par_chunks_mut(size)
        .zip(sediment_w.as_mut_slice().par_chunks_mut(size))
        .enumerate()
        .map(|(y, (height_row, sediment_row))| {
            let mut totals = ErosionTotals::default();
            for x in 0..size {
                let (new_h, new_s) = erosion_cell(height_r, sediment_r, velocity_r, x, y, params);
                let dh = *height_r.get(x, y) - new_h;
                if dh > 0.0 {
                    totals.eroded += dh as f64;
                    totals.max_erosion = totals.max_erosion.max(dh);
                } else if dh < 0.0 {
                    totals.deposited += (-dh) as f64;
                    totals.max_deposition = totals.max_deposition.max(-dh);
                }
                height_row[x] = new_h;
                sediment_row[x] = new_s;
            }
            totals
        })
        .reduce(ErosionTotals::default, ErosionTotals::merged)
}

// ---------------------------------------------------------------------------
// Stage 5: sediment transport
// ---------------------------------------------------------------------------

/// Semi-Lagrangian advection: trace one step back along the velocity and
/// take the bilinear sample of the previous sediment generation there.
/// The backtrace clamps at the rim, so nothing enters from outside.
fn transport_cell(
    sediment: &Field<f32>,
    velocity: &Field<[f32; 2]>,
    x: usize,
    y: usize,
    params: &SimulationParams,
) -> f32 {
    let v = *velocity.get(x, y);
    let src_x = x as f32 - v[0] * params.time_step;
    let src_y = y as f32 - v[1] * params.time_step;
    sediment.sample_bilinear(src_x, src_y).max(0.0)
}

pub(crate) fn apply_sediment_transport(grid: &mut SimulationGrid, params: &SimulationParams) {
    let size = grid.size;
    let (sediment_r, sediment_w) = grid.sediment.rw();
    let velocity_r = grid.velocity.read();

    sediment_w
        .as_mut_slice()
        .par_chunks_mut(size)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, cell) in row.iter_mut().enumerate() {
                *cell = transport_cell(sediment_r, velocity_r, x, y, params);
            }
        });
}

// ---------------------------------------------------------------------------
// Stage 6: evaporation
// ---------------------------------------------------------------------------

pub(crate) fn apply_evaporation(grid: &mut SimulationGrid, params: &SimulationParams) {
    let (water_r, water_w) = grid.water.rw();
    let keep = (1.0 - params.evaporation * params.time_step).max(0.0);

    water_w
        .as_mut_slice()
        .par_iter_mut()
        .zip(water_r.as_slice().par_iter())
        .for_each(|(w, r)| *w = (r * keep).max(0.0));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::grid::SimulationGrid;

    fn flat_params(size: usize) -> SimulationParams {
        SimulationParams {
            size,
            cell_size: 1.0,
            time_step: 1.0,
            rainfall: 1.0,
            evaporation: 0.0,
            gravity: 9.81,
            min_slope: 0.005,
            ..Default::default()
        }
        .clamped()
    }

    fn seed_field(pair: &mut crate::sim::grid::FieldPair<f32>, values: &[(usize, usize, f32)]) {
        let (_, write) = pair.rw();
        for &(x, y, v) in values {
            write.set(x, y, v);
        }
        pair.commit();
    }

    #[test]
    fn test_flat_grid_rainfall_no_outflow() {
        // Scenario: constant height, full rainfall, one iteration. Every
        // cell ends with exactly the rained amount and no cell flows
        // anywhere because there is no slope to drive flow.
        let mut grid = SimulationGrid::allocate(4).unwrap();
        let source = crate::field::Field::new_with(4, 0.5f32);
        grid.seed_height(&source).unwrap();

        let params = flat_params(4);
        run_iteration(&mut grid, &params, 0);

        for (_, _, &w) in grid.water().iter() {
            assert_eq!(w, 1.0);
        }
        for (_, _, &f) in grid.outflow().iter() {
            assert_eq!(f, [0.0; 4]);
        }
        for (x, y, &h) in grid.height().iter() {
            assert_eq!(h, 0.5, "height moved at ({}, {})", x, y);
        }
    }

    #[test]
    fn test_single_peak_outflow() {
        // Scenario: 2x2 grid, one raised wet cell. Flow leaves the peak
        // toward both lower neighbors and the total never exceeds the
        // water that was available.
        let mut grid = SimulationGrid::allocate(2).unwrap();
        seed_field(&mut grid.height, &[(0, 0, 1.0)]);
        seed_field(&mut grid.water, &[(0, 0, 1.0)]);

        let params = flat_params(2);
        apply_outflow(&mut grid, &params);
        grid.commit(FieldId::Outflow);

        let flux = *grid.outflow().get(0, 0);
        assert!(flux[DIR_RIGHT] > 0.0, "no flow toward lower right neighbor");
        assert!(flux[DIR_DOWN] > 0.0, "no flow toward lower down neighbor");
        assert_eq!(flux[DIR_LEFT], 0.0, "flow through the closed left rim");
        assert_eq!(flux[DIR_UP], 0.0, "flow through the closed top rim");
        let total: f32 = flux.iter().sum();
        assert!(total <= 1.0 + 1e-6, "outflow {} exceeds available water", total);
    }

    #[test]
    fn test_outflow_conserves_water() {
        let mut grid = SimulationGrid::allocate(8).unwrap();
        let mut height = crate::field::Field::new_with(8, 0.0f32);
        for y in 0..8 {
            for x in 0..8 {
                height.set(x, y, ((x * 7 + y * 13) % 5) as f32 * 0.2);
            }
        }
        grid.seed_height(&height).unwrap();

        let params = flat_params(8);
        // Rain a few times so water varies, then check the clamp.
        for iteration in 0..5 {
            apply_rainfall(&mut grid, &params, iteration);
            grid.commit(FieldId::Water);

            let water_before = grid.water().as_slice().to_vec();
            apply_outflow(&mut grid, &params);
            grid.commit(FieldId::Outflow);

            for (x, y, flux) in grid.outflow().iter() {
                let total: f32 = flux.iter().sum();
                let avail = water_before[y * 8 + x];
                assert!(
                    total <= avail + 1e-5,
                    "cell ({}, {}): outflow {} > water {}",
                    x,
                    y,
                    total,
                    avail
                );
            }

            apply_velocity(&mut grid, &params);
            grid.commit(FieldId::Water);
            grid.commit(FieldId::Velocity);
        }
    }

    #[test]
    fn test_velocity_moves_water_downhill() {
        let mut grid = SimulationGrid::allocate(2).unwrap();
        seed_field(&mut grid.height, &[(0, 0, 1.0)]);
        seed_field(&mut grid.water, &[(0, 0, 1.0)]);

        let params = flat_params(2);
        apply_outflow(&mut grid, &params);
        grid.commit(FieldId::Outflow);
        apply_velocity(&mut grid, &params);
        grid.commit(FieldId::Water);
        grid.commit(FieldId::Velocity);

        let peak = *grid.water().get(0, 0);
        let right = *grid.water().get(1, 0);
        let down = *grid.water().get(0, 1);
        assert!(peak < 1.0, "peak kept all its water");
        assert!(right > 0.0 && down > 0.0, "neighbors received nothing");
        // Nothing left the grid.
        let total: f32 = grid.water().as_slice().iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_erosion_mass_balance() {
        // Scenario: under-capacity flow over a slope. Whatever leaves the
        // ground must appear in the sediment load, within tolerance.
        let mut grid = SimulationGrid::allocate(4).unwrap();
        let mut height = crate::field::Field::new_with(4, 0.0f32);
        for y in 0..4 {
            for x in 0..4 {
                height.set(x, y, 1.0 - x as f32 * 0.2);
            }
        }
        grid.seed_height(&height).unwrap();
        {
            let (_, velocity_w) = grid.velocity.rw();
            velocity_w.fill([2.0, 0.0]);
        }
        grid.commit(FieldId::Velocity);

        let params = flat_params(4);
        let h_before = *grid.height().get(1, 1);
        let s_before = *grid.sediment().get(1, 1);

        apply_erosion_deposition(&mut grid, &params);
        grid.commit(FieldId::Height);
        grid.commit(FieldId::Sediment);

        let h_after = *grid.height().get(1, 1);
        let s_after = *grid.sediment().get(1, 1);
        assert!(s_after > s_before, "no erosion happened");
        assert!(
            ((h_before - h_after) - (s_after - s_before)).abs() < 1e-5,
            "ground loss {} does not match sediment gain {}",
            h_before - h_after,
            s_after - s_before
        );
    }

    #[test]
    fn test_deposition_bounded_by_sediment() {
        let mut grid = SimulationGrid::allocate(3).unwrap();
        // Flat ground, still water: capacity is zero, everything settles.
        seed_field(&mut grid.sediment, &[(1, 1, 0.4)]);

        let params = SimulationParams {
            deposit_speed: 1.0,
            ..flat_params(3)
        };
        apply_erosion_deposition(&mut grid, &params);
        grid.commit(FieldId::Height);
        grid.commit(FieldId::Sediment);

        assert!((*grid.sediment().get(1, 1)).abs() < 1e-6);
        assert!((*grid.height().get(1, 1) - 0.4).abs() < 1e-6);
        for (_, _, &s) in grid.sediment().iter() {
            assert!(s >= 0.0);
        }
    }

    #[test]
    fn test_transport_advects_along_velocity() {
        let mut grid = SimulationGrid::allocate(4).unwrap();
        seed_field(&mut grid.sediment, &[(2, 2, 1.0)]);
        {
            let (_, velocity_w) = grid.velocity.rw();
            velocity_w.fill([1.0, 0.0]);
        }
        grid.commit(FieldId::Velocity);

        let params = flat_params(4);
        apply_sediment_transport(&mut grid, &params);
        grid.commit(FieldId::Sediment);

        // The blob moved one cell along +x: each cell now holds what sat
        // one cell behind it.
        assert!((*grid.sediment().get(3, 2) - 1.0).abs() < 1e-6);
        assert!((*grid.sediment().get(2, 2)).abs() < 1e-6);
    }

    #[test]
    fn test_evaporation_shrinks_water() {
        let mut grid = SimulationGrid::allocate(2).unwrap();
        seed_field(&mut grid.water, &[(0, 0, 1.0), (1, 1, 0.5)]);

        let params = SimulationParams {
            evaporation: 0.25,
            ..flat_params(2)
        };
        apply_evaporation(&mut grid, &params);
        grid.commit(FieldId::Water);

        assert!((*grid.water().get(0, 0) - 0.75).abs() < 1e-6);
        assert!((*grid.water().get(1, 1) - 0.375).abs() < 1e-6);
    }

    #[test]
    fn test_droplet_rainfall_deterministic() {
        let params = SimulationParams {
            rainfall_mode: RainfallMode::Droplets { probability: 0.2 },
            ..flat_params(8)
        };

        let mut grid_a = SimulationGrid::allocate(8).unwrap();
        let mut grid_b = SimulationGrid::allocate(8).unwrap();
        apply_rainfall(&mut grid_a, &params, 99);
        apply_rainfall(&mut grid_b, &params, 99);
        grid_a.commit(FieldId::Water);
        grid_b.commit(FieldId::Water);

        assert_eq!(grid_a.water().as_slice(), grid_b.water().as_slice());
        // Some cells rained on, some not.
        let wet = grid_a.water().as_slice().iter().filter(|&&w| w > 0.0).count();
        assert!(wet > 0 && wet < 64, "droplet seeding hit {} of 64 cells", wet);
    }

    #[test]
    fn test_rim_cells_never_flow_outward() {
        let mut grid = SimulationGrid::allocate(5).unwrap();
        // Steep bowl rim: outer ring high, center low, everything wet.
        let mut height = crate::field::Field::new_with(5, 1.0f32);
        height.set(2, 2, 0.0);
        grid.seed_height(&height).unwrap();
        {
            let (_, water_w) = grid.water.rw();
            water_w.fill(1.0);
        }
        grid.commit(FieldId::Water);

        let params = flat_params(5);
        for iteration in 0..10 {
            run_iteration(&mut grid, &params, iteration);
        }

        for (x, y, flux) in grid.outflow().iter() {
            if x == 0 {
                assert_eq!(flux[DIR_LEFT], 0.0);
            }
            if x == 4 {
                assert_eq!(flux[DIR_RIGHT], 0.0);
            }
            if y == 0 {
                assert_eq!(flux[DIR_UP], 0.0);
            }
            if y == 4 {
                assert_eq!(flux[DIR_DOWN], 0.0);
            }
        }
    }

    #[test]
    fn test_fields_stay_non_negative() {
        let mut grid = SimulationGrid::allocate(8).unwrap();
        let mut height = crate::field::Field::new_with(8, 0.0f32);
        for y in 0..8 {
            for x in 0..8 {
                height.set(x, y, ((x * 3 + y * 5) % 7) as f32 / 7.0);
            }
        }
        grid.seed_height(&height).unwrap();

        let params = SimulationParams {
            rainfall: 0.5,
            evaporation: 0.3,
            ..flat_params(8)
        };
        for iteration in 0..25 {
            run_iteration(&mut grid, &params, iteration);
            for (x, y, &w) in grid.water().iter() {
                assert!(w >= 0.0, "negative water at ({}, {}): {}", x, y, w);
            }
            for (x, y, &s) in grid.sediment().iter() {
                assert!(s >= 0.0, "negative sediment at ({}, {}): {}", x, y, s);
            }
        }
    }
}
