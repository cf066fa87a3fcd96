// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

//! GPU device using wgpu compute shaders.
//!
//! Each stream records into its own command encoder. Flushing a stream
//! submits its encoder to the single in-order queue, so a marker is simply
//! the submission that ended the marking stream's recorded work: anything
//! the waiting stream submits later executes after it.

use super::{Device, Element, KernelArgs};
use crate::error::NbnxmError;
use crate::kernel::{Kernel, LaunchParams};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use wgpu::util::DeviceExt;

const SHADER_SOURCE: &str = include_str!("../shaders/nonbonded.wgsl");

/// Bindings 0 and 1 are uniforms, the rest storage buffers
const NUM_BINDINGS: u32 = 17;

/// Storage bindings the kernels write to
const READ_WRITE_BINDINGS: [u32; 6] = [3, 5, 6, 7, 14, 16];

/// Largest workgroup count per dispatch dimension
const MAX_WORKGROUPS_PER_DIMENSION: usize = 65535;

pub struct GpuBuffer<T> {
    buffer: wgpu::Buffer,
    len: usize,
    _marker: PhantomData<T>,
}

pub struct GpuStream {
    label: String,
    encoder: Mutex<Option<wgpu::CommandEncoder>>,
}

/// Staging buffer filled by an enqueued device-to-host copy
pub struct GpuDownload<T> {
    staging: wgpu::Buffer,
    len: usize,
    _marker: PhantomData<T>,
}

fn byte_size<T>(len: usize) -> u64 {
    (len * std::mem::size_of::<T>()) as u64
}

/// Buffer sizes must be non-zero multiples of four bytes
fn padded_size(bytes: u64) -> u64 {
    bytes.max(4).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    shader: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    /// Compiled on first use of each kernel
    pipelines: Mutex<HashMap<Kernel, Arc<wgpu::ComputePipeline>>>,
}

impl WgpuDevice {
    fn request_adapter() -> Option<wgpu::Adapter> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
    }

    /// Check if a GPU is available for compute.
    pub fn is_available() -> bool {
        Self::request_adapter().is_some()
    }

    pub fn new() -> Result<Self> {
        let adapter = Self::request_adapter().ok_or(NbnxmError::NoAdapter)?;
        let adapter_name = adapter.get_info().name;
        info!("Using GPU adapter: {adapter_name}");

        let storage_bindings = NUM_BINDINGS - 2;
        let available = adapter.limits().max_storage_buffers_per_shader_stage;
        if available < storage_bindings {
            return Err(NbnxmError::DeviceCreation(format!(
                "{storage_bindings} storage buffers per stage required, adapter supports {available}"
            ))
            .into());
        }
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("clusterpair"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits {
                    max_storage_buffers_per_shader_stage: storage_bindings,
                    ..wgpu::Limits::default()
                },
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| NbnxmError::DeviceCreation(e.to_string()))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Nonbonded kernels"),
            source: wgpu::ShaderSource::Wgsl(SHADER_SOURCE.into()),
        });

        let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..NUM_BINDINGS)
            .map(|binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: match binding {
                        0 | 1 => wgpu::BufferBindingType::Uniform,
                        _ => wgpu::BufferBindingType::Storage {
                            read_only: !READ_WRITE_BINDINGS.contains(&binding),
                        },
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Nonbonded bind group layout"),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Nonbonded pipeline layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        Ok(Self {
            device,
            queue,
            adapter_name,
            shader,
            bind_group_layout,
            pipeline_layout,
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    fn pipeline(&self, kernel: Kernel) -> Result<Arc<wgpu::ComputePipeline>> {
        let mut pipelines = self
            .pipelines
            .lock()
            .map_err(|_| anyhow!("Pipeline cache is poisoned"))?;
        if let Some(pipeline) = pipelines.get(&kernel) {
            return Ok(pipeline.clone());
        }
        let (entry_point, constants) = match kernel {
            Kernel::Nonbonded(flavor) => (
                "nonbonded",
                HashMap::from([
                    ("ELEC_TYPE".to_string(), flavor.elec.code() as f64),
                    ("VDW_TYPE".to_string(), flavor.vdw.code() as f64),
                    ("CALC_ENERGIES".to_string(), flavor.calc_energies as u32 as f64),
                    ("PRUNE".to_string(), flavor.prune as u32 as f64),
                ]),
            ),
            Kernel::PruneOnly => ("prune_only", HashMap::new()),
            Kernel::SumUp => ("sum_up", HashMap::new()),
        };
        let label = kernel.to_string();
        debug!("Compiling pipeline {label}");
        let pipeline = Arc::new(self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&label),
            layout: Some(&self.pipeline_layout),
            module: &self.shader,
            entry_point: Some(entry_point),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &constants,
                zero_initialize_workgroup_memory: true,
            },
            cache: None,
        }));
        pipelines.insert(kernel, pipeline.clone());
        Ok(pipeline)
    }

    fn encoder<'a>(&self, stream: &'a GpuStream) -> Result<MutexGuard<'a, Option<wgpu::CommandEncoder>>> {
        let mut guard = stream
            .encoder
            .lock()
            .map_err(|_| anyhow!("Stream {} is poisoned", stream.label))?;
        if guard.is_none() {
            *guard = Some(self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&stream.label),
            }));
        }
        Ok(guard)
    }

    /// Records commands into the stream's open encoder
    fn record<R>(&self, stream: &GpuStream, f: impl FnOnce(&mut wgpu::CommandEncoder) -> R) -> Result<R> {
        let mut guard = self.encoder(stream)?;
        let encoder = guard
            .as_mut()
            .ok_or_else(|| anyhow!("No encoder on stream {}", stream.label))?;
        Ok(f(encoder))
    }

    /// Submits the stream's recorded work
    fn submit(&self, stream: &GpuStream) -> Result<wgpu::SubmissionIndex> {
        let encoder = stream
            .encoder
            .lock()
            .map_err(|_| anyhow!("Stream {} is poisoned", stream.label))?
            .take();
        Ok(self.queue.submit(encoder.map(|e| e.finish())))
    }

    /// Workgroup grid covering `num_blocks` blocks
    fn dispatch_size(num_blocks: usize) -> (u32, u32) {
        let x = num_blocks.min(MAX_WORKGROUPS_PER_DIMENSION);
        (x as u32, num_blocks.div_ceil(x.max(1)) as u32)
    }
}

impl Device for WgpuDevice {
    type Buffer<T: Element> = GpuBuffer<T>;
    type Stream = GpuStream;
    type Marker = wgpu::SubmissionIndex;
    type Download<T: Element> = GpuDownload<T>;

    fn name(&self) -> String {
        self.adapter_name.clone()
    }

    fn create_stream(&self, label: &str) -> Result<GpuStream> {
        Ok(GpuStream {
            label: label.to_string(),
            encoder: Mutex::new(None),
        })
    }

    fn allocate<T: Element>(&self, len: usize, label: &str) -> Result<GpuBuffer<T>> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: padded_size(byte_size::<T>(len)),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::UNIFORM
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        Ok(GpuBuffer {
            buffer,
            len,
            _marker: PhantomData,
        })
    }

    fn copy_to_device<T: Element>(
        &self,
        stream: &GpuStream,
        dst: &GpuBuffer<T>,
        offset: usize,
        src: &[T],
    ) -> Result<()> {
        anyhow::ensure!(offset + src.len() <= dst.len, "Upload out of bounds");
        if src.is_empty() {
            return Ok(());
        }
        // A staging copy keeps the upload ordered with the stream's other commands
        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Upload staging"),
            contents: bytemuck::cast_slice(src),
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        self.record(stream, |encoder| {
            encoder.copy_buffer_to_buffer(&staging, 0, &dst.buffer, byte_size::<T>(offset), byte_size::<T>(src.len()))
        })
    }

    fn clear<T: Element>(&self, stream: &GpuStream, buffer: &GpuBuffer<T>, range: Range<usize>) -> Result<()> {
        anyhow::ensure!(range.end <= buffer.len, "Clear out of bounds");
        if range.is_empty() {
            return Ok(());
        }
        self.record(stream, |encoder| {
            encoder.clear_buffer(&buffer.buffer, byte_size::<T>(range.start), Some(byte_size::<T>(range.len())))
        })
    }

    fn copy_from_device<T: Element>(
        &self,
        stream: &GpuStream,
        src: &GpuBuffer<T>,
        range: Range<usize>,
    ) -> Result<GpuDownload<T>> {
        anyhow::ensure!(range.end <= src.len, "Download out of bounds");
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Download staging"),
            size: padded_size(byte_size::<T>(range.len())),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if !range.is_empty() {
            self.record(stream, |encoder| {
                encoder.copy_buffer_to_buffer(
                    &src.buffer,
                    byte_size::<T>(range.start),
                    &staging,
                    0,
                    byte_size::<T>(range.len()),
                )
            })?;
        }
        Ok(GpuDownload {
            staging,
            len: range.len(),
            _marker: PhantomData,
        })
    }

    fn fetch<T: Element>(&self, download: GpuDownload<T>) -> Result<Vec<T>> {
        if download.len == 0 {
            return Ok(Vec::new());
        }
        let slice = download.staging.slice(..byte_size::<T>(download.len));
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| NbnxmError::Readback(e.to_string()))?
            .map_err(|e| NbnxmError::Readback(e.to_string()))?;
        let view = slice.get_mapped_range();
        let values: Vec<T> = bytemuck::pod_collect_to_vec(&view[..]);
        drop(view);
        download.staging.unmap();
        Ok(values)
    }

    fn record_marker(&self, stream: &GpuStream) -> Result<wgpu::SubmissionIndex> {
        self.submit(stream)
    }

    fn wait_marker(&self, stream: &GpuStream, marker: &wgpu::SubmissionIndex) -> Result<()> {
        // Later submissions on the shared queue already follow the marker
        trace!("{} waits for {marker:?}", stream.label);
        Ok(())
    }

    fn flush(&self, stream: &GpuStream) -> Result<()> {
        self.submit(stream).map(|_| ())
    }

    fn synchronize(&self, stream: &GpuStream) -> Result<()> {
        let index = self.submit(stream)?;
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        Ok(())
    }

    fn launch(&self, stream: &GpuStream, kernel: Kernel, args: &KernelArgs<'_, Self>) -> Result<()> {
        let num_blocks = args.launch.num_blocks(&kernel);
        trace!("Launching {kernel} on {} with {num_blocks} blocks", stream.label);
        if num_blocks == 0 {
            return Ok(());
        }
        let pipeline = self.pipeline(kernel)?;
        let launch_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Launch parameters"),
            contents: bytemuck::bytes_of::<LaunchParams>(&args.launch),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let buffers: [&wgpu::Buffer; NUM_BINDINGS as usize] = [
            &args.param.buffer,
            &launch_buffer,
            &args.xq.buffer,
            &args.f.buffer,
            &args.shift_vec.buffer,
            &args.fshift.buffer,
            &args.e_lj.buffer,
            &args.e_el.buffer,
            &args.atom_types.buffer,
            &args.lj_comb.buffer,
            &args.nbfp.buffer,
            &args.nbfp_comb.buffer,
            &args.coulomb_tab.buffer,
            &args.sci.buffer,
            &args.cj4.buffer,
            &args.excl.buffer,
            &args.imask_outer.buffer,
        ];
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Nonbonded bind group"),
            layout: &self.bind_group_layout,
            entries: &entries,
        });
        let (x, y) = Self::dispatch_size(num_blocks);
        self.record(stream, |encoder| {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Nonbonded pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_size() {
        assert_eq!(WgpuDevice::dispatch_size(1), (1, 1));
        assert_eq!(WgpuDevice::dispatch_size(65535), (65535, 1));
        assert_eq!(WgpuDevice::dispatch_size(65536), (65535, 2));
        assert_eq!(padded_size(0), 4);
        assert_eq!(padded_size(12), 12);
    }

    #[test]
    fn test_shader_validates() {
        use wgpu::naga;
        let module = naga::front::wgsl::parse_str(SHADER_SOURCE).unwrap();
        naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::default())
            .validate(&module)
            .unwrap();
        let entry_points: Vec<&str> = module.entry_points.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(entry_points, ["nonbonded", "prune_only", "sum_up"]);
        let overrides: Vec<&str> = module
            .overrides
            .iter()
            .filter_map(|(_, o)| o.name.as_deref())
            .collect();
        for name in ["ELEC_TYPE", "VDW_TYPE", "CALC_ENERGIES", "PRUNE"] {
            assert!(overrides.contains(&name), "missing override {name}");
        }
    }

    #[test]
    fn test_roundtrip_if_available() {
        if !WgpuDevice::is_available() {
            return;
        }
        let device = WgpuDevice::new().unwrap();
        let stream = device.create_stream("local").unwrap();
        let buffer: GpuBuffer<[f32; 3]> = device.allocate(4, "f").unwrap();
        device
            .copy_to_device(&stream, &buffer, 1, &[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]])
            .unwrap();
        device.clear(&stream, &buffer, 2..3).unwrap();
        let download = device.copy_from_device(&stream, &buffer, 0..4).unwrap();
        device.synchronize(&stream).unwrap();
        assert_eq!(
            device.fetch(download).unwrap(),
            vec![[0.0; 3], [1.0, 2.0, 3.0], [0.0; 3], [0.0; 3]]
        );
    }
}
