//! Vulkan backend built on vulkano.
//!
//! Worker contexts each own a queue from the device the renderer uses, so
//! shader modules created on a worker are immediately usable by the render
//! thread.

use super::{Backend, Fence, FenceStatus, MappedBuffer, ShaderStage, glsl};
use crate::error::GpuError;
use crate::pool::WorkerInfo;
use crate::shader::ShaderSource;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use vulkano::buffer::{Buffer, BufferCreateInfo, BufferUsage, Subbuffer};
use vulkano::command_buffer::allocator::StandardCommandBufferAllocator;
use vulkano::command_buffer::{AutoCommandBufferBuilder, CommandBufferExecFuture, CommandBufferUsage};
use vulkano::device::{Device, Queue};
use vulkano::image::view::ImageView;
use vulkano::memory::MemoryPropertyFlags;
use vulkano::memory::allocator::{AllocationCreateInfo, MemoryTypeFilter, StandardMemoryAllocator};
use vulkano::shader::{ShaderModule, ShaderModuleCreateInfo};
use vulkano::sync::future::{FenceSignalFuture, NowFuture};
use vulkano::sync::{self, GpuFuture};
use vulkano::{DeviceSize, Validated, VulkanError};

fn device_error(err: impl std::fmt::Display) -> GpuError {
    GpuError::Device(err.to_string())
}

pub struct VulkanContext {
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    pub worker: WorkerInfo,
}

pub struct VulkanShader {
    pub name: String,
    pub stage: ShaderStage,
    pub module: Arc<ShaderModule>,
}

pub struct VulkanProgram {
    pub name: String,
    pub vertex: Arc<ShaderModule>,
    pub fragment: Arc<ShaderModule>,
}

type SubmitFuture = FenceSignalFuture<CommandBufferExecFuture<NowFuture>>;

pub struct VulkanFence(Mutex<SubmitFuture>);

impl Fence for VulkanFence {
    fn wait(&self, timeout: Duration) -> Result<FenceStatus, GpuError> {
        match self.0.lock().wait(Some(timeout)) {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(Validated::Error(VulkanError::Timeout)) => Ok(FenceStatus::TimedOut),
            Err(err) => Err(device_error(err)),
        }
    }
}

/// Host-coherent uniform allocation, mapped for its whole lifetime.
pub struct VulkanBuffer {
    buffer: Subbuffer<[u8]>,
    bindings: Vec<(u32, Subbuffer<[u8]>)>,
}

impl VulkanBuffer {
    pub fn buffer(&self) -> &Subbuffer<[u8]> {
        &self.buffer
    }

    /// Sub-range the renderer should bind at `bind_point` for the current frame.
    pub fn binding(&self, bind_point: u32) -> Option<&Subbuffer<[u8]>> {
        self.bindings
            .iter()
            .find(|(point, _)| *point == bind_point)
            .map(|(_, range)| range)
    }
}

impl MappedBuffer for VulkanBuffer {
    fn len(&self) -> usize {
        self.buffer.len() as usize
    }

    fn mapped_mut(&mut self) -> Result<&mut [u8], GpuError> {
        let mapped = self.buffer.mapped_slice().map_err(device_error)?;
        // SAFETY: the memory is host coherent and stays mapped while the
        // buffer lives. Slot reuse is ordered by the ring buffer's fences.
        Ok(unsafe { &mut *mapped.as_ptr() })
    }

    fn bind_range(&mut self, bind_point: u32, offset: usize, size: usize) {
        let range = self
            .buffer
            .clone()
            .slice(offset as DeviceSize..(offset + size) as DeviceSize);
        match self.bindings.iter_mut().find(|(point, _)| *point == bind_point) {
            Some((_, bound)) => *bound = range,
            None => self.bindings.push((bind_point, range)),
        }
    }
}

pub struct VulkanBackend {
    device: Arc<Device>,
    render_queue: Arc<Queue>,
    worker_queues: Vec<Arc<Queue>>,
    memory_allocator: Arc<StandardMemoryAllocator>,
    command_buffer_allocator: Arc<StandardCommandBufferAllocator>,
}

impl VulkanBackend {
    /// `worker_queues` are handed to workers round-robin; with none, workers
    /// share the render queue.
    pub fn new(device: Arc<Device>, render_queue: Arc<Queue>, worker_queues: Vec<Arc<Queue>>) -> Self {
        let memory_allocator = Arc::new(StandardMemoryAllocator::new_default(device.clone()));
        let command_buffer_allocator = Arc::new(StandardCommandBufferAllocator::new(
            device.clone(),
            Default::default(),
        ));

        Self {
            device,
            render_queue,
            worker_queues,
            memory_allocator,
            command_buffer_allocator,
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn render_queue(&self) -> &Arc<Queue> {
        &self.render_queue
    }
}

impl Backend for VulkanBackend {
    type Context = VulkanContext;
    type Shader = VulkanShader;
    type Program = VulkanProgram;
    type Texture = Arc<ImageView>;
    type Fence = VulkanFence;
    type Buffer = VulkanBuffer;

    fn create_context(&self, worker: &WorkerInfo) -> Result<VulkanContext, GpuError> {
        let queue = match self.worker_queues.len() {
            0 => self.render_queue.clone(),
            n => self.worker_queues[worker.index % n].clone(),
        };

        Ok(VulkanContext {
            device: self.device.clone(),
            queue,
            worker: worker.clone(),
        })
    }

    fn compile_shader(
        &self,
        context: &mut VulkanContext,
        source: &ShaderSource,
    ) -> Result<VulkanShader, GpuError> {
        let words = glsl::compile_to_spirv(source)?;

        let module = unsafe {
            ShaderModule::new(context.device.clone(), ShaderModuleCreateInfo::new(&words))
        }
        .map_err(|err| GpuError::Codegen {
            name: source.name.clone(),
            message: err.to_string(),
        })?;

        Ok(VulkanShader {
            name: source.name.clone(),
            stage: source.stage,
            module,
        })
    }

    fn link_program(
        &self,
        _context: &mut VulkanContext,
        name: &str,
        shaders: &[&VulkanShader],
    ) -> Result<VulkanProgram, GpuError> {
        let stage = |wanted: ShaderStage| {
            let shader = shaders
                .iter()
                .find(|shader| shader.stage == wanted)
                .ok_or_else(|| GpuError::Link {
                    name: name.to_string(),
                    message: format!("no {wanted} stage"),
                })?;
            if shader.module.entry_point(glsl::ENTRY_POINT).is_none() {
                return Err(GpuError::Link {
                    name: name.to_string(),
                    message: format!("{} has no `{}` entry point", shader.name, glsl::ENTRY_POINT),
                });
            }
            Ok(shader.module.clone())
        };

        Ok(VulkanProgram {
            name: name.to_string(),
            vertex: stage(ShaderStage::Vertex)?,
            fragment: stage(ShaderStage::Fragment)?,
        })
    }

    fn create_buffer(&self, size: usize) -> Result<VulkanBuffer, GpuError> {
        let buffer = Buffer::new_slice::<u8>(
            self.memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::UNIFORM_BUFFER,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter {
                    required_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    preferred_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    not_preferred_flags: MemoryPropertyFlags::HOST_CACHED,
                },
                ..Default::default()
            },
            size as DeviceSize,
        )
        .map_err(device_error)?;

        Ok(VulkanBuffer {
            buffer,
            bindings: Vec::new(),
        })
    }

    fn insert_fence(&self) -> Result<VulkanFence, GpuError> {
        let command_buffer = AutoCommandBufferBuilder::primary(
            self.command_buffer_allocator.clone(),
            self.render_queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )
        .map_err(device_error)?
        .build()
        .map_err(device_error)?;

        let future = sync::now(self.device.clone())
            .then_execute(self.render_queue.clone(), command_buffer)
            .map_err(device_error)?
            .then_signal_fence_and_flush()
            .map_err(device_error)?;

        Ok(VulkanFence(Mutex::new(future)))
    }

    fn uniform_alignment(&self) -> usize {
        self.device
            .physical_device()
            .properties()
            .min_uniform_buffer_offset_alignment
            .as_devicesize() as usize
    }
}
