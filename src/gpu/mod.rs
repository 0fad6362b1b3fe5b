//! Graphics backend seam.
//!
//! Everything the reload pipeline needs from a device goes through
//! [`Backend`]: per-worker execution contexts, shader compilation, program
//! linking, a persistently mapped uniform allocation and fences.

pub mod glsl;
pub mod headless;
pub mod vulkan;

use crate::error::GpuError;
use crate::pool::WorkerInfo;
use crate::shader::ShaderSource;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Fragment => write!(f, "fragment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    TimedOut,
}

/// Marks the point in the command stream where a ring slot was last used.
pub trait Fence: Send + Sync {
    /// Blocks for at most `timeout` until the device passes this fence.
    fn wait(&self, timeout: Duration) -> Result<FenceStatus, GpuError>;
}

/// A host visible allocation that stays mapped for its whole lifetime.
pub trait MappedBuffer: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The mapped bytes of the whole allocation.
    fn mapped_mut(&mut self) -> Result<&mut [u8], GpuError>;

    /// Binds `size` bytes starting at `offset` to uniform binding point `bind_point`.
    fn bind_range(&mut self, bind_point: u32, offset: usize, size: usize);
}

/// A device capable of compiling shader sources from worker threads.
pub trait Backend: Send + Sync + 'static {
    /// Per-worker state, created on the worker's own thread.
    type Context: 'static;
    type Shader: Send + Sync + 'static;
    type Program: Send + Sync + 'static;
    type Texture: Send + Sync + 'static;
    type Fence: Fence + 'static;
    type Buffer: MappedBuffer + 'static;

    fn create_context(&self, worker: &WorkerInfo) -> Result<Self::Context, GpuError>;

    fn compile_shader(
        &self,
        context: &mut Self::Context,
        source: &ShaderSource,
    ) -> Result<Self::Shader, GpuError>;

    /// Links a program from one vertex and one fragment stage.
    fn link_program(
        &self,
        context: &mut Self::Context,
        name: &str,
        shaders: &[&Self::Shader],
    ) -> Result<Self::Program, GpuError>;

    fn create_buffer(&self, size: usize) -> Result<Self::Buffer, GpuError>;

    /// Inserts a fence after all work submitted so far.
    fn insert_fence(&self) -> Result<Self::Fence, GpuError>;

    /// Required alignment of uniform buffer binding offsets.
    fn uniform_alignment(&self) -> usize;
}

/// Rounds `size` up to a multiple of `alignment`.
pub fn align_to(size: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    size.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up() {
        assert_eq!(align_to(48, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
        assert_eq!(align_to(48, 0), 48);
    }
}
