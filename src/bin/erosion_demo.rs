//! Standalone erosion driver: synthesizes a heightmap, runs the simulator
//! for a number of steps and exports before/after field snapshots as PNGs.

use std::path::PathBuf;

use clap::Parser;
use noise::{NoiseFn, Perlin, Seedable};

use terrain_erosion::export;
use terrain_erosion::field::Field;
use terrain_erosion::sim::{
    ErosionSimulator, RainfallMode, SimulationParams, SimulationPreset,
};

#[derive(Parser)]
#[command(name = "erosion_demo", about = "Run the shallow-water erosion simulation")]
struct Args {
    /// Grid side length in cells
    #[arg(long, default_value_t = 256)]
    size: usize,

    /// Seed for heightmap synthesis and droplet rainfall
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of simulation steps to run
    #[arg(long, default_value_t = 120)]
    steps: usize,

    /// Pipeline iterations per step
    #[arg(long, default_value_t = 8)]
    iterations: usize,

    /// Parameter preset (gentle, normal, dramatic)
    #[arg(long, default_value = "normal")]
    preset: String,

    /// JSON parameter file overriding the preset
    #[arg(long)]
    params: Option<PathBuf>,

    /// Seed rainfall as random droplets instead of a uniform film
    #[arg(long)]
    droplets: bool,

    /// Run the pipeline on the GPU compute backend
    #[arg(long)]
    gpu: bool,

    /// Prefix for the exported PNG files
    #[arg(long, default_value = "erosion")]
    out_prefix: String,
}

fn main() {
    let args = Args::parse();

    let mut params = match &args.params {
        Some(path) => match load_params(path) {
            Ok(params) => params,
            Err(e) => {
                eprintln!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => {
            let preset = SimulationPreset::all()
                .iter()
                .copied()
                .find(|p| p.to_string() == args.preset)
                .unwrap_or_else(|| {
                    eprintln!("Unknown preset '{}', using normal", args.preset);
                    SimulationPreset::Normal
                });
            println!("Preset: {} ({})", preset, preset.description());
            SimulationParams::from_preset(preset)
        }
    };
    params.size = args.size;
    params.seed = args.seed;
    params.iterations_per_frame = args.iterations;
    params.use_gpu = args.gpu;
    if args.droplets {
        params.rainfall_mode = RainfallMode::Droplets { probability: 0.02 };
    }

    println!("Synthesizing {}x{} heightmap (seed {})...", args.size, args.size, args.seed);
    let heightmap = synthesize_heightmap(args.size, args.seed);

    let before_path = PathBuf::from(format!("{}_before.png", args.out_prefix));
    if export::save_terrain_png(&heightmap, &before_path).is_ok() {
        println!("  Saved initial terrain: {}", before_path.display());
    }

    let mut sim = ErosionSimulator::new();
    if let Err(e) = sim.init(&heightmap, params) {
        eprintln!("Failed to initialize simulator: {}", e);
        std::process::exit(1);
    }

    println!(
        "Running {} steps of {} iterations...",
        args.steps, args.iterations
    );
    let mut total_eroded = 0.0f64;
    let mut total_deposited = 0.0f64;
    for step in 0..args.steps {
        let stats = match sim.simulation_step() {
            Ok(stats) => stats,
            Err(e) => {
                eprintln!("Simulation step failed: {}", e);
                std::process::exit(1);
            }
        };
        total_eroded += stats.total_eroded;
        total_deposited += stats.total_deposited;

        if (step + 1) % 20 == 0 || step + 1 == args.steps {
            println!(
                "  step {:4}: water {:10.2}  sediment {:10.2}  eroded {:10.2}  deposited {:10.2}",
                step + 1,
                stats.total_water,
                stats.total_sediment,
                total_eroded,
                total_deposited
            );
        }
    }

    println!("Erosion summary:");
    println!("  Total eroded:    {:.2}", total_eroded);
    println!("  Total deposited: {:.2}", total_deposited);

    save_snapshots(&sim, &args.out_prefix);
}

fn load_params(path: &PathBuf) -> Result<SimulationParams, Box<dyn std::error::Error>> {
    let file = std::fs::File::open(path)?;
    let params: SimulationParams = serde_json::from_reader(file)?;
    Ok(params)
}

fn save_snapshots(sim: &ErosionSimulator, prefix: &str) {
    let report = |name: &str, path: &PathBuf, ok: bool| {
        if ok {
            println!("  Saved {} snapshot: {}", name, path.display());
        } else {
            eprintln!("  Failed to save {} snapshot", name);
        }
    };

    if let Some(height) = sim.height() {
        let path = PathBuf::from(format!("{}_after.png", prefix));
        report("terrain", &path, export::save_terrain_png(height, &path).is_ok());
    }
    if let Some(water) = sim.water() {
        let path = PathBuf::from(format!("{}_water.png", prefix));
        report("water", &path, export::save_scalar_png(water, &path).is_ok());
    }
    if let Some(sediment) = sim.sediment() {
        let path = PathBuf::from(format!("{}_sediment.png", prefix));
        report("sediment", &path, export::save_scalar_png(sediment, &path).is_ok());
    }
    if let Some(velocity) = sim.velocity() {
        let path = PathBuf::from(format!("{}_flow.png", prefix));
        report("flow", &path, export::save_flow_speed_png(velocity, &path).is_ok());
    }
}

/// Multi-octave Perlin heightmap normalized to [0, 1].
fn synthesize_heightmap(size: usize, seed: u64) -> Field<f32> {
    let noise = Perlin::new(1).set_seed(seed as u32);
    let octaves = 6;
    let persistence = 0.5f64;
    let lacunarity = 2.0f64;
    let base_frequency = 3.0 / size as f64;

    let mut field = Field::new_with(size, 0.0f32);
    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for y in 0..size {
        for x in 0..size {
            let mut total = 0.0f64;
            let mut amplitude = 1.0f64;
            let mut frequency = base_frequency;
            for _ in 0..octaves {
                total += amplitude * noise.get([x as f64 * frequency, y as f64 * frequency]);
                amplitude *= persistence;
                frequency *= lacunarity;
            }
            let h = total as f32;
            if h < min {
                min = h;
            }
            if h > max {
                max = h;
            }
            field.set(x, y, h);
        }
    }

    // Normalize to [0, 1]
    let range = (max - min).max(1e-6);
    for y in 0..size {
        for x in 0..size {
            let h = (*field.get(x, y) - min) / range;
            field.set(x, y, h);
        }
    }

    field
}
