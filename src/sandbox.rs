use crate::builder::SandboxBuilder;
use crate::error::SandboxError;
use crate::gpu::{Backend, align_to};
use crate::hash::{Digest, hash_str};
use crate::pool::{WorkerInfo, WorkerPool};
use crate::registry::{BackendRegistry, Programs, Resource};
use crate::reloadable::HotReloadable;
use crate::ring::{SyncedRingBuffer, WaitOutcome};
use crate::shader::{MAIN_SHADER, is_builtin_name, reload_shader};
use crate::watcher::{
    DirectoryWatcher, EventCallback, EventKind, WatcherBackend, WatcherEvent,
    create_directory_watcher,
};
use crate::UNIFORM_BIND_POINT;
use bevy::prelude::Resource as BevyResource;
use bytemuck::{Pod, Zeroable};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Uniform block every sandbox shader can read at binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MainUniformBlock {
    /// xy = cursor position, zw = left and right button state
    pub mouse: [f32; 4],
    pub resolution: [f32; 3],
    /// Seconds since the active program was swapped in
    pub time: f32,
    pub time_delta: f32,
    pub frame_rate: f32,
    pub frame: i32,
    pub _padding: i32,
}

/// Window state sampled by the embedding application for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameInput {
    pub resolution: [f32; 2],
    pub mouse: [f32; 2],
    pub left_button: bool,
    pub right_button: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    /// Frame index written to the uniform block.
    pub frame: i32,
    /// Ring slot the uniforms were written to.
    pub slot: usize,
    pub fence: WaitOutcome,
    /// A newer program was swapped in this frame.
    pub swapped: bool,
    pub program: Option<Digest>,
}

/// Playback time of the active program.
#[derive(Debug, Clone)]
pub struct FrameClock {
    start: Instant,
    last: Instant,
    time: f32,
    delta: f32,
    frame_rate: f32,
    frame: i32,
    paused: bool,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
            time: 0.0,
            delta: 0.0,
            frame_rate: 0.0,
            frame: 0,
            paused: false,
        }
    }

    /// Restarts playback from frame zero.
    pub fn reset(&mut self) {
        let paused = self.paused;
        *self = Self::new();
        self.paused = paused;
    }

    /// Accounts for one rendered frame.
    pub fn advance(&mut self) {
        let now = Instant::now();
        let delta = now.duration_since(self.last).as_secs_f32();
        self.last = now;
        self.delta = delta;
        self.frame_rate = if delta > 0.0 { delta.recip() } else { 0.0 };

        if self.paused {
            // keep playback time frozen
            self.start += Duration::from_secs_f32(delta);
        } else {
            self.time = now.duration_since(self.start).as_secs_f32();
            self.frame = self.frame.wrapping_add(1);
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn delta(&self) -> f32 {
        self.delta
    }

    pub fn frame_rate(&self) -> f32 {
        self.frame_rate
    }

    pub fn frame(&self) -> i32 {
        self.frame
    }
}

pub(crate) struct SandboxConfig {
    pub directory: PathBuf,
    pub workers: usize,
    pub ring_slots: usize,
    pub fence_timeout: Duration,
    pub watcher_backend: WatcherBackend,
}

/// Live shader sandbox.
///
/// Watches a folder for edits to its shaders, recompiles them on a pool of
/// worker threads and swaps the newest program in on the render thread.
#[derive(BevyResource)]
pub struct Sandbox<G: Backend> {
    backend: Arc<G>,
    registry: Arc<BackendRegistry<G>>,
    workers: Arc<WorkerPool<G::Context>>,
    watcher: Arc<dyn DirectoryWatcher>,
    watcher_thread: Option<JoinHandle<()>>,
    uniforms: SyncedRingBuffer<G>,
    active: Option<Resource<G::Program>>,
    rejected: Option<Digest>,
    clock: FrameClock,
    directory: PathBuf,
    main_hash: Digest,
}

impl<G: Backend> Sandbox<G> {
    /// Creates a builder for a sandbox over `directory`.
    pub fn builder(directory: impl AsRef<Path>) -> SandboxBuilder {
        SandboxBuilder::new(directory)
    }

    pub(crate) fn new_with_config(backend: G, config: SandboxConfig) -> Result<Self, SandboxError> {
        let backend = Arc::new(backend);
        let registry = Arc::new(BackendRegistry::<G>::new());

        let workers = {
            let backend = backend.clone();
            Arc::new(WorkerPool::new(config.workers, move |info: &WorkerInfo| {
                backend.create_context(info)
            })?)
        };

        let slot_size = align_to(
            std::mem::size_of::<MainUniformBlock>(),
            backend.uniform_alignment(),
        );
        let mut uniforms = SyncedRingBuffer::new(
            backend.clone(),
            config.ring_slots,
            slot_size,
            config.fence_timeout,
        )?;
        uniforms.register_bind(UNIFORM_BIND_POINT, 0, slot_size)?;

        info!("Performing initial shader compilation...");
        let main_path = config.directory.join(MAIN_SHADER);
        if !main_path.is_file() {
            return Err(SandboxError::MissingMainShader(MAIN_SHADER.to_string()));
        }
        let initial = {
            let backend = backend.clone();
            let registry = registry.clone();
            workers
                .enqueue(move |context| reload_shader(&*backend, context, &registry, &main_path))?
                .wait()??
        };
        match initial {
            Some(program) => info!("Initial shader compilation complete ({})", program.hash),
            None => return Err(SandboxError::MissingMainShader(MAIN_SHADER.to_string())),
        }

        let mut watcher = create_directory_watcher(config.watcher_backend)?;
        let reload = || reload_callback(backend.clone(), registry.clone(), workers.clone());
        watcher.register_callback(EventKind::Changed, reload());
        watcher.register_callback(EventKind::Moved, {
            let reload = reload();
            Box::new(move |event: &WatcherEvent| {
                debug!("{event}");
                reload(event);
            })
        });
        watcher.register_callback(EventKind::Created, Box::new(|event: &WatcherEvent| debug!("{event}")));
        watcher.register_callback(EventKind::Deleted, Box::new(|event: &WatcherEvent| debug!("{event}")));
        watcher.register_error_callback(Box::new(|message: &str| error!("{message}")));

        watcher.init()?;
        watcher.add_directory(&config.directory)?;

        let watcher: Arc<dyn DirectoryWatcher> = Arc::from(watcher);
        let watcher_thread = std::thread::Builder::new()
            .name("dirwatcher".to_string())
            .spawn({
                let watcher = watcher.clone();
                move || watcher.watch()
            })
            .map_err(SandboxError::Thread)?;

        info!("Watching: {}", config.directory.display());

        Ok(Self {
            backend,
            registry,
            workers,
            watcher,
            watcher_thread: Some(watcher_thread),
            uniforms,
            active: None,
            rejected: None,
            clock: FrameClock::new(),
            directory: config.directory,
            main_hash: hash_str(MAIN_SHADER),
        })
    }

    /// Runs one render iteration.
    ///
    /// Waits for the current uniform slot, swaps in a newer program if one
    /// was published, writes the uniform block, draws and fences the slot.
    pub fn frame<R: HotReloadable<G>>(
        &mut self,
        renderer: &mut R,
        input: &FrameInput,
    ) -> Result<FrameStats, SandboxError> {
        let fence = self.uniforms.wait();
        self.uniforms.rebind();

        let swapped = self.update_program(renderer);

        let block = MainUniformBlock {
            mouse: [
                input.mouse[0],
                input.mouse[1],
                f32::from(u8::from(input.left_button)),
                f32::from(u8::from(input.right_button)),
            ],
            resolution: [input.resolution[0], input.resolution[1], 0.0],
            time: self.clock.time(),
            time_delta: self.clock.delta(),
            frame_rate: self.clock.frame_rate(),
            frame: self.clock.frame(),
            _padding: 0,
        };
        let slot = self.uniforms.current_index();
        *self.uniforms.slot_mut::<MainUniformBlock>()? = block;

        if let Some(program) = &self.active {
            if let Err(err) = renderer.draw(program, self.uniforms.buffer()) {
                warn!("Drawing {} failed: {err}", program.name);
            }
        }

        self.uniforms.lock_and_swap()?;
        self.clock.advance();

        Ok(FrameStats {
            frame: block.frame,
            slot,
            fence,
            swapped,
            program: self.active.as_ref().map(|program| program.hash),
        })
    }

    fn update_program<R: HotReloadable<G>>(&mut self, renderer: &mut R) -> bool {
        let Some(latest) = self.registry.get::<Programs>(self.main_hash) else {
            return false;
        };
        let current = self.active.as_ref().map(|program| program.hash);
        if current == Some(latest.hash) || self.rejected == Some(latest.hash) {
            return false;
        }

        match renderer.recreate_pipeline(&latest) {
            Ok(()) => {
                info!("Swapped in {} ({})", latest.name, latest.hash);
                self.active = Some(latest);
                self.rejected = None;
                self.clock.reset();
                true
            }
            Err(err) => {
                error!("Pipeline for {} ({}) rejected: {err}", latest.name, latest.hash);
                self.rejected = Some(latest.hash);
                false
            }
        }
    }

    /// Returns true if a program newer than the active one has been published.
    ///
    /// Non-blocking; the swap itself happens in the next [`frame`](Self::frame).
    pub fn pending_swap(&self) -> bool {
        let latest = self.registry.get::<Programs>(self.main_hash).map(|p| p.hash);
        latest.is_some()
            && latest != self.active.as_ref().map(|p| p.hash)
            && latest != self.rejected
    }

    pub fn active_program(&self) -> Option<&Resource<G::Program>> {
        self.active.as_ref()
    }

    pub fn backend(&self) -> &Arc<G> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<BackendRegistry<G>> {
        &self.registry
    }

    pub fn workers(&self) -> &WorkerPool<G::Context> {
        &self.workers
    }

    pub fn uniforms(&self) -> &SyncedRingBuffer<G> {
        &self.uniforms
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut FrameClock {
        &mut self.clock
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// False once the watcher has stopped, either through
    /// [`shutdown`](Self::shutdown) or because the watched directory went away.
    pub fn is_watching(&self) -> bool {
        !self.watcher.is_stopped()
    }

    /// Stops the watcher, joins its thread and stops the workers.
    ///
    /// Recompilations already queued still run to completion.
    pub fn shutdown(&mut self) {
        self.watcher.stop();
        if let Some(thread) = self.watcher_thread.take() {
            if thread.join().is_err() {
                error!("Directory watcher thread panicked");
            }
        }
        self.workers.stop_workers();
    }
}

impl<G: Backend> Drop for Sandbox<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Queues recompilation of built-in shaders named by watcher events.
///
/// Each event gets its own task; concurrent edits of one file are not
/// sequenced, so an older task finishing last publishes stale content.
fn reload_callback<G: Backend>(
    backend: Arc<G>,
    registry: Arc<BackendRegistry<G>>,
    workers: Arc<WorkerPool<G::Context>>,
) -> EventCallback {
    Box::new(move |event: &WatcherEvent| {
        if event.is_dir || !is_builtin_name(&event.name) {
            return;
        }
        if event.name != MAIN_SHADER {
            debug!("{} is reloaded by its texture loader", event.name);
            return;
        }

        let path = event.path();
        let name = event.name.clone();
        let backend = backend.clone();
        let registry = registry.clone();

        let queued = workers.enqueue(move |context| {
            if let Err(err) = reload_shader(&*backend, context, &registry, &path) {
                error!("Reloading {name} failed: {err}");
            }
        });

        match queued {
            Ok(_) => debug!("Queued recompilation of {}", event.name),
            Err(err) => warn!("Dropping recompilation of {}: {err}", event.name),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_is_std140_sized() {
        assert_eq!(std::mem::size_of::<MainUniformBlock>(), 48);
        assert_eq!(std::mem::offset_of!(MainUniformBlock, resolution), 16);
        assert_eq!(std::mem::offset_of!(MainUniformBlock, time), 28);
        assert_eq!(std::mem::offset_of!(MainUniformBlock, frame), 40);
    }

    #[test]
    fn clock_counts_frames_and_resets() {
        let mut clock = FrameClock::new();
        clock.advance();
        clock.advance();
        assert_eq!(clock.frame(), 2);
        assert!(clock.time() >= 0.0);

        clock.reset();
        assert_eq!(clock.frame(), 0);
        assert_eq!(clock.time(), 0.0);
        assert_eq!(clock.delta(), 0.0);
    }

    #[test]
    fn paused_clock_freezes_playback() {
        let mut clock = FrameClock::new();
        clock.advance();
        clock.set_paused(true);
        let frozen = (clock.frame(), clock.time());

        std::thread::sleep(Duration::from_millis(5));
        clock.advance();
        assert_eq!((clock.frame(), clock.time()), frozen);
        assert!(clock.delta() > 0.0);

        clock.reset();
        assert!(clock.is_paused());
    }
}
