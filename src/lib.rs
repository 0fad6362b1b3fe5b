//! Live shader editing sandbox.
//!
//! This crate watches a folder of GLSL shaders, recompiles the ones that
//! change on a pool of worker threads and swaps the newest program in on the
//! render thread without restarting the application. Uniforms are streamed
//! through a fenced ring buffer so the CPU never overwrites data the GPU is
//! still reading.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bevy::prelude::*;
//! use shader_sandbox::gpu::headless::{HeadlessBackend, HeadlessBuffer, HeadlessProgram};
//! use shader_sandbox::{FrameInput, HotReloadable, Resource as Program, Sandbox};
//!
//! fn setup_sandbox(mut commands: Commands) {
//!     match Sandbox::<HeadlessBackend>::builder("shaders")
//!         .workers(4)
//!         .build(HeadlessBackend::new())
//!     {
//!         Ok(sandbox) => commands.insert_resource(sandbox),
//!         Err(e) => {
//!             eprintln!("Failed to initialise shader sandbox: {}", e);
//!             std::process::exit(1);
//!         }
//!     }
//! }
//!
//! # struct MyRenderer;
//! impl HotReloadable<HeadlessBackend> for MyRenderer {
//!     fn recreate_pipeline(
//!         &mut self,
//!         program: &Program<HeadlessProgram>,
//!     ) -> Result<(), Box<dyn std::error::Error>> {
//!         // Rebuild pipeline with the new program
//!         Ok(())
//!     }
//!
//!     fn draw(
//!         &mut self,
//!         program: &Program<HeadlessProgram>,
//!         uniforms: &HeadlessBuffer,
//!     ) -> Result<(), Box<dyn std::error::Error>> {
//!         Ok(())
//!     }
//! }
//!
//! fn render(mut sandbox: ResMut<Sandbox<HeadlessBackend>>) {
//!     let input = FrameInput {
//!         resolution: [800.0, 600.0],
//!         ..Default::default()
//!     };
//!     if let Err(e) = sandbox.frame(&mut MyRenderer, &input) {
//!         eprintln!("Frame failed: {}", e);
//!     }
//! }
//! ```

pub mod builder;
pub mod error;
pub mod gpu;
pub mod hash;
pub mod pool;
pub mod registry;
pub mod reloadable;
pub mod ring;
pub mod sandbox;
pub mod shader;
pub mod watcher;

pub use builder::SandboxBuilder;
pub use error::{GpuError, PoolError, SandboxError, TaskError, WatcherError};
pub use gpu::{Backend, Fence, FenceStatus, MappedBuffer, ShaderStage};
pub use hash::{Digest, hash_bytes, hash_str};
pub use pool::{TaskHandle, WorkerInfo, WorkerPool};
pub use registry::{BackendRegistry, Programs, Resource, ResourceRegistry, Shaders, Textures};
pub use reloadable::HotReloadable;
pub use ring::{BufferBind, SyncedRingBuffer, WaitOutcome};
pub use sandbox::{FrameClock, FrameInput, FrameStats, MainUniformBlock, Sandbox};
pub use shader::{MAIN_SHADER, ShaderSource};
pub use watcher::{
    DirectoryWatcher, EventKind, WatcherBackend, WatcherEvent, create_directory_watcher,
};

/// Uniform binding point of [`MainUniformBlock`].
pub const UNIFORM_BIND_POINT: u32 = 0;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_RING_SLOTS: usize = 3;
const DEFAULT_FENCE_TIMEOUT_MS: u64 = 1000;
