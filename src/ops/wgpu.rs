//! GPU-accelerated convolution kernels using WGPU.
//!
//! This module runs the three convolution kernels as WGSL compute shaders:
//!
//! - `convolve`: one invocation per output element
//! - `backprop`: one invocation per input element
//! - `gradient`: one invocation per `(tap, shard)` partial sum
//!
//! All shaders share one bind group layout (a uniform parameter block, two
//! read-only storage buffers and one read-write result buffer) and are
//! compiled once, when the shared executor is first requested.
//!
//! Chunk data is cast from f64 to f32 for the device and back to f64 on
//! readback, so results agree with the CPU executor only to f32 precision.

use std::sync::mpsc;

use briny::prelude::*;
use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::cpu::{chunk_items, shard_count};
use super::dispatch::Executor;
use crate::error::KernelError;
use crate::geometry::Geometry;

const CONVOLVE: &str = include_str!("shaders/convolve.wgsl");
const BACKPROP: &str = include_str!("shaders/backprop.wgsl");
const GRADIENT: &str = include_str!("shaders/gradient.wgsl");

const WORKGROUP_SIZE: u32 = 64;

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// A queue for information related to the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    ///
    /// The device is requested with the adapter's own limits so large
    /// storage buffers stay available.
    ///
    /// # Errors
    ///
    /// [`KernelError::Device`] if no adapter or device can be acquired.
    pub fn new() -> Result<Self, KernelError> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(|e| KernelError::Device(format!("adapter error: {e}")))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_conv"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| KernelError::Device(format!("device error: {e}")))?;

        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!(%error, "uncaptured wgpu error");
        }));
        device.set_device_lost_callback(|reason, message| {
            tracing::error!(?reason, %message, "wgpu device lost");
        });

        Ok(Self { device, queue })
    }
}

/// Secure wrapper for WGSL source code.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;

        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if src.contains("import") || src.contains("#include") {
            return Err(ValidationError);
        }

        let forbidden = ["asm", "unsafe", "ptr", "std::"];
        if forbidden.iter().any(|bad| src.contains(bad)) {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// Uniform block shared by all three shaders. Field order must match the
/// `Params` struct in the WGSL sources.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Params {
    input: [i32; 3],
    filter: [i32; 3],
    output: [i32; 3],
    offset: [i32; 2],
    shards: i32,
    len: i32,
    source_len: i32,
    stride: i32,
    _pad: i32,
}

fn to_i32(value: usize) -> Result<i32, KernelError> {
    i32::try_from(value).map_err(|_| KernelError::TooLarge { len: value })
}

fn triple(dims: [usize; 3]) -> Result<[i32; 3], KernelError> {
    Ok([to_i32(dims[0])?, to_i32(dims[1])?, to_i32(dims[2])?])
}

impl Params {
    fn new(g: &Geometry, shards: usize, len: usize, source_len: usize) -> Result<Self, KernelError> {
        Ok(Self {
            input: triple(g.input)?,
            filter: triple(g.filter)?,
            output: triple(g.output)?,
            offset: [
                i32::try_from(g.offset.x).map_err(|_| KernelError::TooLarge { len: g.filter[0] })?,
                i32::try_from(g.offset.y).map_err(|_| KernelError::TooLarge { len: g.filter[1] })?,
            ],
            shards: to_i32(shards)?,
            len: to_i32(len)?,
            source_len: to_i32(source_len)?,
            stride: 0,
            _pad: 0,
        })
    }
}

/// Compiled pipelines for the three kernels on one device.
pub struct WgpuExecutor {
    ctx: GpuContext,
    layout: wgpu::BindGroupLayout,
    convolve: wgpu::ComputePipeline,
    backprop: wgpu::ComputePipeline,
    gradient: wgpu::ComputePipeline,
}

lazy_static::lazy_static! {
    static ref SHARED: Option<WgpuExecutor> = match WgpuExecutor::new() {
        Ok(executor) => Some(executor),
        Err(err) => {
            tracing::warn!(%err, "failed to initialize wgpu executor");
            None
        }
    };
}

/// The process-wide GPU executor, or `None` if no device is available.
pub(crate) fn shared() -> Option<&'static WgpuExecutor> {
    SHARED.as_ref()
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Storage bindings larger than the device limit fail validation on upload.
fn within_binding_limit(limit: usize, lens: &[usize]) -> Result<(), KernelError> {
    match lens.iter().find(|&&len| len > limit) {
        Some(&len) => Err(KernelError::TooLarge { len }),
        None => Ok(()),
    }
}

fn to_f32(data: &[f64]) -> Vec<f32> {
    data.iter().map(|&x| x as f32).collect()
}

impl WgpuExecutor {
    /// Acquires a device and compiles all three pipelines.
    ///
    /// # Errors
    ///
    /// [`KernelError::Device`] if the device cannot be acquired or a shader
    /// fails validation.
    pub fn new() -> Result<Self, KernelError> {
        let ctx = GpuContext::new()?;
        let device = &ctx.device;

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("conv_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("conv_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = |label: &str, source: &str| -> Result<wgpu::ComputePipeline, KernelError> {
            WgslSource(source)
                .validate()
                .map_err(|_| KernelError::Device(format!("{label} shader failed validation")))?;
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            Ok(device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            }))
        };

        let convolve = pipeline("convolve", CONVOLVE)?;
        let backprop = pipeline("backprop", BACKPROP)?;
        let gradient = pipeline("gradient", GRADIENT)?;

        Ok(Self {
            ctx,
            layout,
            convolve,
            backprop,
            gradient,
        })
    }

    /// Splits `len` invocations over a 2D grid of workgroups.
    ///
    /// Returns `(groups_x, groups_y)`; invocation `(x, y)` handles index
    /// `x + y * groups_x * WORKGROUP_SIZE`.
    fn grid(&self, len: usize) -> Result<(u32, u32), KernelError> {
        let max = self.ctx.device.limits().max_compute_workgroups_per_dimension;
        let groups = u32::try_from(len.div_ceil(WORKGROUP_SIZE as usize))
            .map_err(|_| KernelError::TooLarge { len })?;
        let x = groups.clamp(1, max);
        let y = groups.div_ceil(x);
        if y > max {
            return Err(KernelError::TooLarge { len });
        }
        Ok((x, y))
    }

    /// Runs `f` inside validation and out-of-memory error scopes and turns
    /// any captured device error into [`KernelError::Device`].
    fn scoped<T>(&self, label: &str, f: impl FnOnce() -> Result<T, KernelError>) -> Result<T, KernelError> {
        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = f();
        let validation = pollster::block_on(device.pop_error_scope());
        let out_of_memory = pollster::block_on(device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(error) => Err(KernelError::Device(format!("{label}: {error}"))),
            None => result,
        }
    }

    fn run(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        mut params: Params,
        a: &[f64],
        b: &[f64],
        result: &mut [f64],
    ) -> Result<(), KernelError> {
        if result.is_empty() {
            return Ok(());
        }
        within_binding_limit(self.max_buffer_len(), &[a.len(), b.len(), result.len()])?;
        let (groups_x, groups_y) = self.grid(result.len())?;
        params.stride = to_i32(groups_x as usize * WORKGROUP_SIZE as usize)?;

        let staging = self.scoped(label, || {
            Ok(self.submit(label, pipeline, &params, a, b, result.len(), (groups_x, groups_y)))
        })?;
        self.read_back(&staging, result)
    }

    /// Uploads one chunk, dispatches `pipeline` over it and queues a copy of
    /// the result into a mappable staging buffer.
    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        params: &Params,
        a: &[f64],
        b: &[f64],
        result_len: usize,
        (groups_x, groups_y): (u32, u32),
    ) -> wgpu::Buffer {
        let device = &self.ctx.device;
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let a_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("a"),
            contents: bytemuck::cast_slice(&to_f32(a)),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let b_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("b"),
            contents: bytemuck::cast_slice(&to_f32(b)),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let size = (result_len * size_of::<f32>()) as u64;
        let result_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("result"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: a_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: b_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: result_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        encoder.copy_buffer_to_buffer(&result_buf, 0, &staging, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));
        staging
    }

    /// Waits for `staging` to map and widens its f32 contents into `result`.
    fn read_back(&self, staging: &wgpu::Buffer, result: &mut [f64]) -> Result<(), KernelError> {
        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |mapped| {
            let _ = tx.send(mapped);
        });
        self.ctx
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| KernelError::Device(format!("poll failed: {e}")))?;
        rx.recv()
            .map_err(|e| KernelError::Device(format!("map callback dropped: {e}")))?
            .map_err(|e| KernelError::Device(format!("map failed: {e}")))?;

        {
            let data = slice.get_mapped_range();
            let values: &[f32] = bytemuck::try_cast_slice(&data)
                .map_err(|e| KernelError::Device(format!("readback failed: {e}")))?;
            for (dst, &src) in result.iter_mut().zip(values) {
                *dst = f64::from(src);
            }
        }
        staging.unmap();

        Ok(())
    }
}

impl Executor for WgpuExecutor {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn max_buffer_len(&self) -> usize {
        let limits = self.ctx.device.limits();
        let bytes = u64::from(limits.max_storage_buffer_binding_size).min(limits.max_buffer_size);
        usize::try_from(bytes / size_of::<f32>() as u64).unwrap_or(usize::MAX)
    }

    fn convolve(&self, geometry: &Geometry, input: &[f64], filter: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
        chunk_items(geometry, input.len(), output.len(), filter.len())?;
        let params = Params::new(geometry, 1, output.len(), input.len())?;
        self.run("convolve", &self.convolve, params, input, filter, output)
    }

    fn backprop(&self, geometry: &Geometry, input: &mut [f64], filter: &[f64], output: &[f64]) -> Result<(), KernelError> {
        chunk_items(geometry, input.len(), output.len(), filter.len())?;
        let params = Params::new(geometry, 1, input.len(), output.len())?;
        self.run("backprop", &self.backprop, params, output, filter, input)
    }

    fn gradient(&self, geometry: &Geometry, input: &[f64], partials: &mut [f64], output: &[f64]) -> Result<(), KernelError> {
        let shards = shard_count(geometry, partials.len())?;
        chunk_items(geometry, input.len(), output.len(), geometry.filter_len())?;
        let params = Params::new(geometry, shards, partials.len(), input.len())?;
        self.run("gradient", &self.gradient, params, input, output, partials)
    }
}
