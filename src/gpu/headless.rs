//! Device-less backend: compiles and validates shaders through the GLSL front
//! end and keeps uniform data in host memory. Used by tests and tooling that
//! have no GPU available.

use super::{Backend, Fence, FenceStatus, MappedBuffer, ShaderStage, glsl};
use crate::error::GpuError;
use crate::pool::WorkerInfo;
use crate::shader::ShaderSource;
use parking_lot::{Condvar, Mutex};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How fences handed out by the backend behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceMode {
    /// Fences are signaled as soon as they are inserted.
    #[default]
    Immediate,
    /// Fences stay pending until [`HeadlessBackend::signal_all`].
    Manual,
}

#[derive(Default)]
struct FenceState {
    signaled: Mutex<bool>,
    condition: Condvar,
}

impl FenceState {
    fn signal(&self) {
        *self.signaled.lock() = true;
        self.condition.notify_all();
    }
}

pub struct HeadlessFence(Arc<FenceState>);

impl Fence for HeadlessFence {
    fn wait(&self, timeout: Duration) -> Result<FenceStatus, GpuError> {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.0.signaled.lock();
        while !*signaled {
            if self.0.condition.wait_until(&mut signaled, deadline).timed_out() {
                return Ok(if *signaled {
                    FenceStatus::Signaled
                } else {
                    FenceStatus::TimedOut
                });
            }
        }
        Ok(FenceStatus::Signaled)
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessContext {
    pub worker: WorkerInfo,
}

#[derive(Debug)]
pub struct HeadlessShader {
    pub name: String,
    pub stage: ShaderStage,
    pub spirv: Vec<u32>,
}

#[derive(Debug)]
pub struct HeadlessProgram {
    pub name: String,
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
    /// Worker that linked the program.
    pub linked_by: String,
}

#[derive(Debug)]
pub struct HeadlessTexture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Host memory standing in for a mapped uniform buffer.
#[derive(Debug)]
pub struct HeadlessBuffer {
    // u128 storage keeps every slot view 16 byte aligned
    words: Vec<u128>,
    len: usize,
    bindings: Vec<(u32, Range<usize>)>,
}

impl HeadlessBuffer {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(16)],
            len,
            bindings: Vec::new(),
        }
    }

    /// Range currently bound to `bind_point`.
    pub fn binding(&self, bind_point: u32) -> Option<Range<usize>> {
        self.bindings
            .iter()
            .find(|(point, _)| *point == bind_point)
            .map(|(_, range)| range.clone())
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }
}

impl MappedBuffer for HeadlessBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn mapped_mut(&mut self) -> Result<&mut [u8], GpuError> {
        let len = self.len;
        Ok(&mut bytemuck::cast_slice_mut(&mut self.words)[..len])
    }

    fn bind_range(&mut self, bind_point: u32, offset: usize, size: usize) {
        let range = offset..offset + size;
        match self.bindings.iter_mut().find(|(point, _)| *point == bind_point) {
            Some((_, bound)) => *bound = range,
            None => self.bindings.push((bind_point, range)),
        }
    }
}

pub struct HeadlessBackend {
    fence_mode: FenceMode,
    uniform_alignment: usize,
    pending: Mutex<Vec<Arc<FenceState>>>,
    compiled: AtomicUsize,
    linked: AtomicUsize,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            fence_mode: FenceMode::Immediate,
            uniform_alignment: 256,
            pending: Mutex::new(Vec::new()),
            compiled: AtomicUsize::new(0),
            linked: AtomicUsize::new(0),
        }
    }

    pub fn with_fence_mode(mut self, mode: FenceMode) -> Self {
        self.fence_mode = mode;
        self
    }

    pub fn with_uniform_alignment(mut self, alignment: usize) -> Self {
        self.uniform_alignment = alignment.max(1);
        self
    }

    /// Signals every fence still pending in [`FenceMode::Manual`].
    pub fn signal_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        for fence in pending {
            fence.signal();
        }
    }

    pub fn pending_fences(&self) -> usize {
        self.pending.lock().len()
    }

    /// Number of successful shader compilations so far.
    pub fn compiled_shaders(&self) -> usize {
        self.compiled.load(Ordering::SeqCst)
    }

    pub fn linked_programs(&self) -> usize {
        self.linked.load(Ordering::SeqCst)
    }
}

impl Backend for HeadlessBackend {
    type Context = HeadlessContext;
    type Shader = HeadlessShader;
    type Program = HeadlessProgram;
    type Texture = HeadlessTexture;
    type Fence = HeadlessFence;
    type Buffer = HeadlessBuffer;

    fn create_context(&self, worker: &WorkerInfo) -> Result<HeadlessContext, GpuError> {
        Ok(HeadlessContext {
            worker: worker.clone(),
        })
    }

    fn compile_shader(
        &self,
        _context: &mut HeadlessContext,
        source: &ShaderSource,
    ) -> Result<HeadlessShader, GpuError> {
        let spirv = glsl::compile_to_spirv(source)?;
        self.compiled.fetch_add(1, Ordering::SeqCst);
        Ok(HeadlessShader {
            name: source.name.clone(),
            stage: source.stage,
            spirv,
        })
    }

    fn link_program(
        &self,
        context: &mut HeadlessContext,
        name: &str,
        shaders: &[&HeadlessShader],
    ) -> Result<HeadlessProgram, GpuError> {
        let stage = |wanted: ShaderStage| {
            shaders
                .iter()
                .find(|shader| shader.stage == wanted)
                .map(|shader| shader.spirv.clone())
                .ok_or_else(|| GpuError::Link {
                    name: name.to_string(),
                    message: format!("no {wanted} stage"),
                })
        };

        let program = HeadlessProgram {
            name: name.to_string(),
            vertex: stage(ShaderStage::Vertex)?,
            fragment: stage(ShaderStage::Fragment)?,
            linked_by: context.worker.name.clone(),
        };
        self.linked.fetch_add(1, Ordering::SeqCst);
        Ok(program)
    }

    fn create_buffer(&self, size: usize) -> Result<HeadlessBuffer, GpuError> {
        Ok(HeadlessBuffer::new(size))
    }

    fn insert_fence(&self) -> Result<HeadlessFence, GpuError> {
        let state = Arc::new(FenceState::default());
        match self.fence_mode {
            FenceMode::Immediate => state.signal(),
            FenceMode::Manual => self.pending.lock().push(state.clone()),
        }
        Ok(HeadlessFence(state))
    }

    fn uniform_alignment(&self) -> usize {
        self.uniform_alignment
    }
}
