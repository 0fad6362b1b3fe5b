use crate::error::SandboxError;
use crate::gpu::Backend;
use crate::sandbox::SandboxConfig;
use crate::watcher::WatcherBackend;
use crate::{DEFAULT_FENCE_TIMEOUT_MS, DEFAULT_RING_SLOTS, DEFAULT_WORKERS, Sandbox};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Builder for configuring a Sandbox instance.
///
/// Provides an interface for sizing the compile worker pool and the uniform
/// ring, choosing the watcher backend and tuning the fence timeout.
///
/// # Example
///
/// ```rust,no_run
/// use shader_sandbox::gpu::headless::HeadlessBackend;
/// use shader_sandbox::{Sandbox, WatcherBackend};
/// use std::time::Duration;
///
/// let sandbox = Sandbox::<HeadlessBackend>::builder("shaders")
///     .workers(2)
///     .ring_slots(3)
///     .fence_timeout(Duration::from_millis(500))
///     .watcher_backend(WatcherBackend::Portable)
///     .build(HeadlessBackend::new())
///     .expect("Failed to initialise shader sandbox");
/// ```
pub struct SandboxBuilder {
    directory: PathBuf,
    workers: usize,
    ring_slots: usize,
    fence_timeout: Duration,
    watcher_backend: WatcherBackend,
}

impl SandboxBuilder {
    /// Creates a new builder with default settings.
    ///
    /// # Arguments
    ///
    /// * `directory` - Folder holding `main.glsl` and the other shaders
    pub fn new(directory: impl AsRef<Path>) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            workers: DEFAULT_WORKERS,
            ring_slots: DEFAULT_RING_SLOTS,
            fence_timeout: Duration::from_millis(DEFAULT_FENCE_TIMEOUT_MS),
            watcher_backend: WatcherBackend::default(),
        }
    }

    /// Sets the number of compile worker threads, each with its own context.
    ///
    /// # Arguments
    ///
    /// * `count` - Number of workers, at least one
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    /// Sets how many frames of uniforms may be in flight.
    ///
    /// # Arguments
    ///
    /// * `slots` - Number of ring slots, at least one
    pub fn ring_slots(mut self, slots: usize) -> Self {
        self.ring_slots = slots.max(1);
        self
    }

    /// Sets the soft deadline for waiting on a slot's fence.
    ///
    /// When it passes the frame proceeds anyway and the event is logged.
    pub fn fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout = timeout;
        self
    }

    pub fn watcher_backend(mut self, backend: WatcherBackend) -> Self {
        self.watcher_backend = backend;
        self
    }

    /// Builds the Sandbox with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A worker context cannot be created
    /// - The uniform buffer cannot be allocated
    /// - `main.glsl` is missing or fails to compile
    /// - The directory watcher cannot be initialised
    pub fn build<G: Backend>(self, backend: G) -> Result<Sandbox<G>, SandboxError> {
        Sandbox::new_with_config(
            backend,
            SandboxConfig {
                directory: self.directory,
                workers: self.workers,
                ring_slots: self.ring_slots,
                fence_timeout: self.fence_timeout,
                watcher_backend: self.watcher_backend,
            },
        )
    }
}
