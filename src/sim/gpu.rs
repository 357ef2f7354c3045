//! GPU compute backend for the erosion pipeline using wgpu.
//!
//! Mirrors the CPU executor: one compute kernel per pipeline stage, cell
//! state double-buffered in two storage buffers, and a buffer-to-buffer
//! copy as the commit at every stage boundary. Fields upload at the start
//! of a step and download at the end; if anything fails before the
//! download completes, the grid keeps its pre-step state.

use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;

use crate::sim::error::SimulationError;
use crate::sim::grid::{FieldId, SimulationGrid};
use crate::sim::params::{RainfallMode, SimulationParams};
use crate::sim::stages::{ErosionTotals, Stage};

/// Parameters passed to the compute kernels
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuParams {
    size: u32,
    rain_mode: u32,
    rain_seed: u32,
    _pad0: u32,
    cell_size: f32,
    rainfall: f32,
    evaporation: f32,
    capacity_factor: f32,
    min_slope: f32,
    deposit_speed: f32,
    erode_speed: f32,
    gravity: f32,
    time_step: f32,
    rain_probability: f32,
    _pad1: f32,
    _pad2: f32,
}

/// One cell's full state, packed so both generations fit in two storage
/// buffers (separate buffers per field would blow the per-stage storage
/// buffer limit).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct GpuCell {
    height: f32,
    water: f32,
    sediment: f32,
    _pad: f32,
    outflow: [f32; 4],
    velocity: [f32; 2],
    _pad2: [f32; 2],
}

/// GPU context holding the device and one pipeline per stage.
pub struct GpuStageExecutor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: [wgpu::ComputePipeline; 6],
    bind_group_layout: wgpu::BindGroupLayout,
}

impl GpuStageExecutor {
    /// Acquire an adapter and build the stage pipelines.
    pub fn new() -> Result<Self, SimulationError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, SimulationError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| {
                SimulationError::BackendUnavailable("no compatible GPU adapter".to_string())
            })?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Erosion GPU"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| SimulationError::BackendUnavailable(format!("device request: {}", e)))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Erosion Stage Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(STAGE_SHADER)),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Erosion Stage Bind Group Layout"),
            entries: &[
                // Previous generation (read-only)
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Current generation (write)
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Parameters
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Erosion Stage Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let make_pipeline = |entry: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let pipelines = [
            make_pipeline("rainfall"),
            make_pipeline("outflow"),
            make_pipeline("velocity"),
            make_pipeline("erosion_deposition"),
            make_pipeline("sediment_transport"),
            make_pipeline("evaporation"),
        ];

        Ok(Self {
            device,
            queue,
            pipelines,
            bind_group_layout,
        })
    }

    fn pipeline_for(&self, stage: Stage) -> &wgpu::ComputePipeline {
        let idx = Stage::ORDER.iter().position(|&s| s == stage).unwrap_or(0);
        &self.pipelines[idx]
    }

    /// Run `iterations` full pipeline iterations on the GPU and write the
    /// results back into the grid's read buffers.
    pub fn run_step(
        &self,
        grid: &mut SimulationGrid,
        params: &SimulationParams,
        iterations: usize,
        base_seed: u64,
    ) -> Result<ErosionTotals, SimulationError> {
        use wgpu::util::DeviceExt;

        let size = grid.size();
        let cell_count = size * size;
        let buffer_bytes = (cell_count * std::mem::size_of::<GpuCell>()) as u64;

        // Pack the current read-buffer state
        let mut cells: Vec<GpuCell> = Vec::with_capacity(cell_count);
        for i in 0..cell_count {
            cells.push(GpuCell {
                height: grid.height().as_slice()[i],
                water: grid.water().as_slice()[i],
                sediment: grid.sediment().as_slice()[i],
                _pad: 0.0,
                outflow: grid.outflow().as_slice()[i],
                velocity: grid.velocity().as_slice()[i],
                _pad2: [0.0; 2],
            });
        }
        let heights_before: Vec<f32> = grid.height().as_slice().to_vec();

        let src_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Cell State (read)"),
                contents: bytemuck::cast_slice(&cells),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            });

        let dst_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Cell State (write)"),
                contents: bytemuck::cast_slice(&cells),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            });

        let rain_probability = match params.rainfall_mode {
            RainfallMode::Droplets { probability } => probability,
            RainfallMode::Uniform => 0.0,
        };
        let mut gpu_params = GpuParams {
            size: size as u32,
            rain_mode: match params.rainfall_mode {
                RainfallMode::Uniform => 0,
                RainfallMode::Droplets { .. } => 1,
            },
            rain_seed: (base_seed & 0xFFFF_FFFF) as u32,
            _pad0: 0,
            cell_size: params.cell_size,
            rainfall: params.rainfall,
            evaporation: params.evaporation,
            capacity_factor: params.capacity_factor,
            min_slope: params.min_slope,
            deposit_speed: params.deposit_speed,
            erode_speed: params.erode_speed,
            gravity: params.gravity,
            time_step: params.time_step,
            rain_probability,
            _pad1: 0.0,
            _pad2: 0.0,
        };

        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Stage Params"),
                contents: bytemuck::bytes_of(&gpu_params),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Erosion Stage Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: src_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dst_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        // 8x8 threads per workgroup
        let groups = ((size + 7) / 8) as u32;

        for iteration in 0..iterations {
            gpu_params.rain_seed =
                (base_seed.wrapping_add(iteration as u64) & 0xFFFF_FFFF) as u32;
            self.queue
                .write_buffer(&params_buffer, 0, bytemuck::bytes_of(&gpu_params));

            let mut encoder = self
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Erosion Iteration Encoder"),
                });

            for stage in Stage::ORDER {
                if !params.enabled_stages.contains(stage) {
                    continue;
                }
                {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(stage.name()),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(self.pipeline_for(stage));
                    pass.set_bind_group(0, &bind_group, &[]);
                    pass.dispatch_workgroups(groups, groups, 1);
                }
                // Commit: the new generation becomes the next stage's input.
                encoder.copy_buffer_to_buffer(&dst_buffer, 0, &src_buffer, 0, buffer_bytes);
            }

            self.queue.submit(std::iter::once(encoder.finish()));
            self.device.poll(wgpu::Maintain::Wait);
        }

        // Read back the final generation
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging"),
            size: buffer_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(&src_buffer, 0, &staging_buffer, 0, buffer_bytes);
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        let map_result = receiver.recv().map_err(|_| SimulationError::StageFailure {
            stage: Stage::Evaporation,
            reason: "readback channel closed".to_string(),
        })?;
        map_result.map_err(|e| SimulationError::StageFailure {
            stage: Stage::Evaporation,
            reason: format!("buffer map failed: {:?}", e),
        })?;

        let data = buffer_slice.get_mapped_range();
        let result: Vec<GpuCell> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        // The download succeeded: unpack through the write buffers and
        // commit, so readers see the whole step or none of it.
        {
            let (_, height_w) = grid.height.rw();
            for (i, cell) in result.iter().enumerate() {
                height_w.as_mut_slice()[i] = cell.height;
            }
        }
        {
            let (_, water_w) = grid.water.rw();
            for (i, cell) in result.iter().enumerate() {
                water_w.as_mut_slice()[i] = cell.water;
            }
        }
        {
            let (_, sediment_w) = grid.sediment.rw();
            for (i, cell) in result.iter().enumerate() {
                sediment_w.as_mut_slice()[i] = cell.sediment;
            }
        }
        {
            let (_, outflow_w) = grid.outflow.rw();
            for (i, cell) in result.iter().enumerate() {
                outflow_w.as_mut_slice()[i] = cell.outflow;
            }
        }
        {
            let (_, velocity_w) = grid.velocity.rw();
            for (i, cell) in result.iter().enumerate() {
                velocity_w.as_mut_slice()[i] = cell.velocity;
            }
        }
        grid.commit(FieldId::Height);
        grid.commit(FieldId::Water);
        grid.commit(FieldId::Sediment);
        grid.commit(FieldId::Outflow);
        grid.commit(FieldId::Velocity);

        let mut totals = ErosionTotals::default();
        for (i, cell) in result.iter().enumerate() {
            let diff = heights_before[i] - cell.height;
            if diff > 0.0 {
                totals.eroded += diff as f64;
                totals.max_erosion = totals.max_erosion.max(diff);
            } else if diff < 0.0 {
                totals.deposited += (-diff) as f64;
                totals.max_deposition = totals.max_deposition.max(-diff);
            }
        }
        Ok(totals)
    }
}

/// WGSL compute shader: one entry point per pipeline stage.
const STAGE_SHADER: &str = r#"
struct Params {
    size: u32,
    rain_mode: u32,
    rain_seed: u32,
    _pad0: u32,
    cell_size: f32,
    rainfall: f32,
    evaporation: f32,
    capacity_factor: f32,
    min_slope: f32,
    deposit_speed: f32,
    erode_speed: f32,
    gravity: f32,
    time_step: f32,
    rain_probability: f32,
    _pad1: f32,
    _pad2: f32,
}

struct Cell {
    height: f32,
    water: f32,
    sediment: f32,
    pad: f32,
    outflow: vec4<f32>,
    velocity: vec2<f32>,
    pad2: vec2<f32>,
}

@group(0) @binding(0) var<storage, read> src: array<Cell>;
@group(0) @binding(1) var<storage, read_write> dst: array<Cell>;
@group(0) @binding(2) var<uniform> params: Params;

// PCG random number generator
fn pcg_hash(input: u32) -> u32 {
    let state = input * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}

fn in_bounds(x: i32, y: i32) -> bool {
    return x >= 0 && y >= 0 && x < i32(params.size) && y < i32(params.size);
}

fn cell_index(x: i32, y: i32) -> u32 {
    return u32(y) * params.size + u32(x);
}

// Direction order: left, right, up, down. d ^ 1 is the opposite.
fn dir_offset(d: u32) -> vec2<i32> {
    if (d == 0u) { return vec2<i32>(-1, 0); }
    if (d == 1u) { return vec2<i32>(1, 0); }
    if (d == 2u) { return vec2<i32>(0, -1); }
    return vec2<i32>(0, 1);
}

fn height_at(x: i32, y: i32) -> f32 {
    let cx = clamp(x, 0, i32(params.size) - 1);
    let cy = clamp(y, 0, i32(params.size) - 1);
    return src[cell_index(cx, cy)].height;
}

@compute @workgroup_size(8, 8)
fn rainfall(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.size || gid.y >= params.size) { return; }
    let i = gid.y * params.size + gid.x;

    var cell = src[i];
    var amount = params.rainfall * params.time_step;
    if (params.rain_mode == 1u) {
        let h = pcg_hash(params.rain_seed ^ (i * 1664525u + 1013904223u));
        let r = f32(h) / 4294967295.0;
        if (r >= params.rain_probability) {
            amount = 0.0;
        }
    }
    cell.water = cell.water + amount;
    dst[i] = cell;
}

@compute @workgroup_size(8, 8)
fn outflow(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.size || gid.y >= params.size) { return; }
    let i = gid.y * params.size + gid.x;

    var cell = src[i];
    var flux = vec4<f32>(0.0);
    let avail = cell.water;

    if (avail > 0.0) {
        let level = cell.height + cell.water;
        for (var d = 0u; d < 4u; d = d + 1u) {
            let off = dir_offset(d);
            let nx = i32(gid.x) + off.x;
            let ny = i32(gid.y) + off.y;
            if (!in_bounds(nx, ny)) {
                continue;
            }
            let n = src[cell_index(nx, ny)];
            let slope = (level - (n.height + n.water)) / params.cell_size;
            if (slope < params.min_slope) {
                continue;
            }
            flux[d] = max(cell.outflow[d] + params.time_step * params.gravity * slope, 0.0);
        }
        let total = flux.x + flux.y + flux.z + flux.w;
        if (total > avail) {
            flux = flux * (avail / total);
        }
    }

    cell.outflow = flux;
    dst[i] = cell;
}

@compute @workgroup_size(8, 8)
fn velocity(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.size || gid.y >= params.size) { return; }
    let i = gid.y * params.size + gid.x;

    var cell = src[i];
    let flux_out = cell.outflow;
    var flux_in = vec4<f32>(0.0);

    for (var d = 0u; d < 4u; d = d + 1u) {
        let off = dir_offset(d);
        let nx = i32(gid.x) + off.x;
        let ny = i32(gid.y) + off.y;
        if (!in_bounds(nx, ny)) {
            continue;
        }
        var neighbor_flux = src[cell_index(nx, ny)].outflow;
        flux_in[d] = neighbor_flux[d ^ 1u];
    }

    let in_sum = flux_in.x + flux_in.y + flux_in.z + flux_in.w;
    let out_sum = flux_out.x + flux_out.y + flux_out.z + flux_out.w;
    cell.water = max(cell.water + in_sum - out_sum, 0.0);

    let flow_x = 0.5 * (flux_in[0u] - flux_out[0u] + flux_out[1u] - flux_in[1u]);
    let flow_y = 0.5 * (flux_in[2u] - flux_out[2u] + flux_out[3u] - flux_in[3u]);
    let denom = params.cell_size * params.time_step;
    cell.velocity = vec2<f32>(flow_x / denom, flow_y / denom);

    dst[i] = cell;
}

@compute @workgroup_size(8, 8)
fn erosion_deposition(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.size || gid.y >= params.size) { return; }
    let i = gid.y * params.size + gid.x;

    var cell = src[i];
    let speed = length(cell.velocity);

    let x = i32(gid.x);
    let y = i32(gid.y);
    let last = i32(params.size) - 1;

    var gx: f32;
    if (x == 0) {
        gx = height_at(1, y) - height_at(0, y);
    } else if (x == last) {
        gx = height_at(x, y) - height_at(x - 1, y);
    } else {
        gx = (height_at(x + 1, y) - height_at(x - 1, y)) / 2.0;
    }

    var gy: f32;
    if (y == 0) {
        gy = height_at(x, 1) - height_at(x, 0);
    } else if (y == last) {
        gy = height_at(x, y) - height_at(x, y - 1);
    } else {
        gy = (height_at(x, y + 1) - height_at(x, y - 1)) / 2.0;
    }

    let slope = sqrt(gx * gx + gy * gy) / params.cell_size;
    let capacity = params.capacity_factor * speed * slope;

    if (cell.sediment < capacity) {
        let delta = min(params.erode_speed * (capacity - cell.sediment), max(cell.height, 0.0));
        cell.height = cell.height - delta;
        cell.sediment = cell.sediment + delta;
    } else {
        let delta = min(params.deposit_speed * (cell.sediment - capacity), cell.sediment);
        cell.height = cell.height + delta;
        cell.sediment = cell.sediment - delta;
    }

    dst[i] = cell;
}

@compute @workgroup_size(8, 8)
fn sediment_transport(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.size || gid.y >= params.size) { return; }
    let i = gid.y * params.size + gid.x;

    var cell = src[i];
    let back_x = f32(gid.x) - cell.velocity.x * params.time_step;
    let back_y = f32(gid.y) - cell.velocity.y * params.time_step;

    let maxc = f32(params.size - 1u);
    let cx = clamp(back_x, 0.0, maxc);
    let cy = clamp(back_y, 0.0, maxc);

    let x0 = u32(floor(cx));
    let y0 = u32(floor(cy));
    let x1 = min(x0 + 1u, params.size - 1u);
    let y1 = min(y0 + 1u, params.size - 1u);
    let fx = cx - floor(cx);
    let fy = cy - floor(cy);

    let s00 = src[y0 * params.size + x0].sediment;
    let s10 = src[y0 * params.size + x1].sediment;
    let s01 = src[y1 * params.size + x0].sediment;
    let s11 = src[y1 * params.size + x1].sediment;

    let s0 = mix(s00, s10, fx);
    let s1 = mix(s01, s11, fx);
    cell.sediment = max(mix(s0, s1, fy), 0.0);

    dst[i] = cell;
}

@compute @workgroup_size(8, 8)
fn evaporation(@builtin(global_invocation_id) gid: vec3<u32>) {
    if (gid.x >= params.size || gid.y >= params.size) { return; }
    let i = gid.y * params.size + gid.x;

    var cell = src[i];
    let keep = max(1.0 - params.evaporation * params.time_step, 0.0);
    cell.water = max(cell.water * keep, 0.0);
    dst[i] = cell;
}
"#;
