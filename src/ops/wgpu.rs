//! GPU accelerator using WGPU.
//!
//! The convolution runs as a single WGSL compute kernel (`conv2d.wgsl`)
//! that indexes the input directly, one invocation per output element.
//! The device and queue are initialized once per process via `lazy_static`;
//! every [`WgpuAccelerator`] shares them and owns its own pipeline.
//!
//! Every allocation, upload, launch and readback runs inside a WGPU error
//! scope, so out-of-memory and validation failures come back as
//! [`ConvError`] values instead of panicking in the uncaptured-error handler.

use super::device::Accelerator;
use crate::error::{ConvError, Result};
use crate::memory::MemoryDomain;
use crate::shape::ConvGeometry;
use bytemuck::{Pod, Zeroable};
use std::sync::mpsc;
use tracing::debug;
use wgpu::util::DeviceExt;

const CONV2D: &str = include_str!("shaders/conv2d.wgsl");

/// Threads per workgroup along each dispatch axis; matches the shader.
const WORKGROUP: u32 = 16;

/// Failures while bringing up the GPU.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// No suitable adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    /// The adapter refused to create a device.
    #[error("device error: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    /// Shader source rejected before compilation.
    #[error("shader rejected: {0}")]
    Shader(&'static str),
}

impl From<GpuError> for ConvError {
    fn from(e: GpuError) -> Self {
        Self::Device(e.to_string())
    }
}

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device and queue.
    ///
    /// # Errors
    /// [`GpuError`] if no adapter or device can be acquired.
    pub fn new() -> core::result::Result<Self, GpuError> {
        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("conv"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))?;

        debug!(adapter = ?adapter.get_info().name, "gpu context ready");
        Ok(Self { device, queue })
    }
}

/// Sanity checks on WGSL source before it reaches the compiler.
pub fn validate_wgsl(src: &str) -> core::result::Result<(), GpuError> {
    if src.len() > 65536 {
        return Err(GpuError::Shader("source too large"));
    }
    if !src.contains("fn main") {
        return Err(GpuError::Shader("missing `main` entry point"));
    }
    if src.contains("import") || src.contains("#include") {
        return Err(GpuError::Shader("source inclusion is not allowed"));
    }
    let forbidden = ["asm", "unsafe", "ptr", "std::"];
    if forbidden.iter().any(|bad| src.contains(bad)) {
        return Err(GpuError::Shader("forbidden pattern"));
    }
    Ok(())
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: core::result::Result<GpuContext, GpuError> = GpuContext::new();
}

/// Uniform block of `conv2d.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ConvParams {
    in_channels: u32,
    in_h: u32,
    in_w: u32,
    out_channels: u32,
    kernel_h: u32,
    kernel_w: u32,
    stride_h: u32,
    stride_w: u32,
    out_h: u32,
    out_w: u32,
    positions: u32,
    kernel_size: u32,
}

impl ConvParams {
    fn new(g: &ConvGeometry) -> Result<Self> {
        let cast = |v: usize| {
            u32::try_from(v).map_err(|_| ConvError::Device(format!("dimension {v} exceeds u32")))
        };
        Ok(Self {
            in_channels: cast(g.in_channels)?,
            in_h: cast(g.in_h)?,
            in_w: cast(g.in_w)?,
            out_channels: cast(g.out_channels)?,
            kernel_h: cast(g.kernel_h)?,
            kernel_w: cast(g.kernel_w)?,
            stride_h: cast(g.stride_h)?,
            stride_w: cast(g.stride_w)?,
            out_h: cast(g.out_h)?,
            out_w: cast(g.out_w)?,
            positions: cast(g.positions())?,
            kernel_size: cast(g.kernel_size())?,
        })
    }
}

/// A storage buffer of `f32` elements.
#[derive(Debug)]
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

impl WgpuBuffer {
    fn bytes(&self) -> u64 {
        (self.len * size_of::<f32>()) as u64
    }
}

/// [`Accelerator`] backed by the default WGPU adapter.
pub struct WgpuAccelerator {
    ctx: &'static GpuContext,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
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

impl WgpuAccelerator {
    /// Connects to the shared GPU context and builds the conv pipeline.
    ///
    /// # Errors
    /// [`ConvError::Device`] if there is no usable GPU or the shader is rejected.
    pub fn new() -> Result<Self> {
        let ctx = GPU_CONTEXT
            .as_ref()
            .map_err(|e| ConvError::Device(e.to_string()))?;
        validate_wgsl(CONV2D)?;

        let device = &ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("conv2d"),
            source: wgpu::ShaderSource::Wgsl(CONV2D.into()),
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("conv2d_bgl"),
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
            label: Some("conv2d_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("conv2d_pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ConvError::Device(format!("conv2d pipeline: {err}")));
        }

        Ok(Self {
            ctx,
            layout,
            pipeline,
        })
    }

    fn limits(&self) -> wgpu::Limits {
        self.ctx.device.limits()
    }

    /// Runs `f` inside an error scope of kind `filter` and returns what the
    /// scope captured alongside `f`'s value.
    fn scoped<T>(
        &self,
        filter: wgpu::ErrorFilter,
        f: impl FnOnce(&wgpu::Device) -> T,
    ) -> (T, Option<wgpu::Error>) {
        let device = &self.ctx.device;
        device.push_error_scope(filter);
        let value = f(device);
        (value, pollster::block_on(device.pop_error_scope()))
    }
}

impl Accelerator for WgpuAccelerator {
    type Buffer = WgpuBuffer;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn alloc(&self, len: usize) -> Result<WgpuBuffer> {
        let oom = || ConvError::OutOfMemory {
            domain: MemoryDomain::Device,
            elements: len,
        };
        let bytes = len
            .checked_mul(size_of::<f32>())
            .map(|b| b.max(size_of::<f32>()) as u64)
            .ok_or_else(oom)?;
        let limits = self.limits();
        if bytes > limits.max_buffer_size
            || bytes > u64::from(limits.max_storage_buffer_binding_size)
        {
            return Err(oom());
        }

        let (buffer, err) = self.scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("conv_storage"),
                size: bytes,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        });
        if err.is_some() {
            return Err(oom());
        }
        Ok(WgpuBuffer { buffer, len })
    }

    fn upload(&self, dst: &mut WgpuBuffer, src: &[f32]) -> Result<()> {
        if dst.len != src.len() {
            return Err(ConvError::Device(format!(
                "upload of {} elements into a {}-element buffer",
                src.len(),
                dst.len
            )));
        }
        let ((), err) = self.scoped(wgpu::ErrorFilter::Validation, |_| {
            self.ctx
                .queue
                .write_buffer(&dst.buffer, 0, bytemuck::cast_slice(src));
        });
        match err {
            Some(err) => Err(ConvError::Device(format!("upload: {err}"))),
            None => Ok(()),
        }
    }

    fn launch_conv(
        &self,
        g: &ConvGeometry,
        input: &WgpuBuffer,
        weights: &WgpuBuffer,
        output: &mut WgpuBuffer,
    ) -> Result<()> {
        if input.len != g.input_len() || weights.len != g.weight_len() || output.len != g.output_len()
        {
            return Err(ConvError::Device("launch with mis-sized buffers".into()));
        }
        let params = ConvParams::new(g)?;
        let groups_x = params.positions.div_ceil(WORKGROUP);
        let groups_y = params.out_channels.div_ceil(WORKGROUP);
        let max_groups = self.limits().max_compute_workgroups_per_dimension;
        if groups_x > max_groups || groups_y > max_groups {
            return Err(ConvError::Device(format!(
                "dispatch of {groups_x}x{groups_y} workgroups exceeds {max_groups} per dimension"
            )));
        }

        let ((), err) = self.scoped(wgpu::ErrorFilter::Validation, |device| {
            let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("conv2d_params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("conv2d_bind_group"),
                layout: &self.layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: input.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: weights.buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: output.buffer.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("conv2d_encoder"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("conv2d_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups_x, groups_y, 1);
            }
            self.ctx.queue.submit(Some(encoder.finish()));
        });
        match err {
            Some(err) => Err(ConvError::Device(format!("conv2d launch: {err}"))),
            None => Ok(()),
        }
    }

    fn synchronize(&self) -> Result<()> {
        self.ctx
            .device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| ConvError::Device(format!("synchronize: {e}")))
    }

    fn download(&self, src: &WgpuBuffer, dst: &mut [f32]) -> Result<()> {
        if src.len != dst.len() {
            return Err(ConvError::Device(format!(
                "download of a {}-element buffer into {} elements",
                src.len,
                dst.len()
            )));
        }
        let bytes = src.bytes();

        let (staging, err) = self.scoped(wgpu::ErrorFilter::OutOfMemory, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("conv2d_staging"),
                size: bytes,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        });
        if err.is_some() {
            return Err(ConvError::OutOfMemory {
                domain: MemoryDomain::Device,
                elements: src.len,
            });
        }

        let ((), err) = self.scoped(wgpu::ErrorFilter::Validation, |device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("conv2d_readback"),
            });
            encoder.copy_buffer_to_buffer(&src.buffer, 0, &staging, 0, bytes);
            self.ctx.queue.submit(Some(encoder.finish()));
        });
        if let Some(err) = err {
            return Err(ConvError::Device(format!("readback copy: {err}")));
        }

        let (tx, rx) = mpsc::channel();
        let slice = staging.slice(..);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.synchronize()?;
        rx.recv()
            .map_err(|_| ConvError::Device("readback callback never ran".into()))?
            .map_err(|e| ConvError::Device(format!("readback map: {e}")))?;

        {
            let view = slice.get_mapped_range();
            let data: &[f32] = bytemuck::try_cast_slice(&view[..])
                .map_err(|e| ConvError::Device(format!("readback cast: {e}")))?;
            dst.copy_from_slice(data);
        }
        staging.unmap();
        Ok(())
    }
}
