//! Multi-buffered uniform storage synchronised with the device by fences.
//!
//! One allocation is split into `slot_count` slots. Each frame the render
//! thread waits for the fence guarding the current slot, writes into it,
//! rebinds it and then fences and advances to the next slot.

use crate::error::GpuError;
use crate::gpu::{Backend, Fence, FenceStatus, MappedBuffer};
use bytemuck::Pod;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// Bind point and range within a slot, replayed every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBind {
    pub bind_point: u32,
    pub offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// No fence was outstanding for the slot.
    Idle,
    Signaled,
    /// The soft deadline passed; the slot is used anyway.
    TimedOut,
}

pub struct SyncedRingBuffer<G: Backend> {
    backend: Arc<G>,
    buffer: G::Buffer,
    slot_size: usize,
    fences: Vec<Option<G::Fence>>,
    current: usize,
    binds: Vec<BufferBind>,
    fence_timeout: Duration,
}

impl<G: Backend> SyncedRingBuffer<G> {
    pub fn new(
        backend: Arc<G>,
        slot_count: usize,
        slot_size: usize,
        fence_timeout: Duration,
    ) -> Result<Self, GpuError> {
        let slot_count = slot_count.max(1);
        let buffer = backend.create_buffer(slot_count * slot_size)?;

        Ok(Self {
            backend,
            buffer,
            slot_size,
            fences: (0..slot_count).map(|_| None).collect(),
            current: 0,
            binds: Vec::new(),
            fence_timeout,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.fences.len()
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn fence_timeout(&self) -> Duration {
        self.fence_timeout
    }

    pub fn set_fence_timeout(&mut self, timeout: Duration) {
        self.fence_timeout = timeout;
    }

    pub fn has_fence(&self, slot: usize) -> bool {
        self.fences.get(slot).is_some_and(Option::is_some)
    }

    pub fn buffer(&self) -> &G::Buffer {
        &self.buffer
    }

    pub fn binds(&self) -> &[BufferBind] {
        &self.binds
    }

    /// Waits for the fence guarding the current slot, at most `fence_timeout`.
    pub fn wait(&mut self) -> WaitOutcome {
        let Some(fence) = self.fences[self.current].take() else {
            return WaitOutcome::Idle;
        };

        match fence.wait(self.fence_timeout) {
            Ok(FenceStatus::Signaled) => WaitOutcome::Signaled,
            Ok(FenceStatus::TimedOut) => {
                debug!("Fence timeout expired on slot {}", self.current);
                WaitOutcome::TimedOut
            }
            Err(err) => {
                warn!("Waiting on fence for slot {} failed: {err}", self.current);
                WaitOutcome::TimedOut
            }
        }
    }

    /// Raw bytes of the current slot.
    pub fn slot_bytes(&mut self) -> Result<&mut [u8], GpuError> {
        let start = self.current * self.slot_size;
        self.range_mut(start, self.slot_size)
    }

    /// Typed view at the start of the current slot.
    pub fn slot_mut<T: Pod>(&mut self) -> Result<&mut T, GpuError> {
        let start = self.current * self.slot_size;
        self.view_mut(start, self.slot_size)
    }

    /// Typed view of a registered bind range within the current slot.
    pub fn bind_mut<T: Pod>(&mut self, bind_index: usize) -> Result<&mut T, GpuError> {
        let bind = self.binds.get(bind_index).copied().ok_or(GpuError::OutOfBounds {
            offset: bind_index,
            end: bind_index + 1,
            len: self.binds.len(),
        })?;
        let start = self.current * self.slot_size + bind.offset;
        self.view_mut(start, bind.size)
    }

    /// Registers a range of every slot to be bound at `bind_point`.
    ///
    /// The range must be non-empty and lie within one slot.
    pub fn register_bind(
        &mut self,
        bind_point: u32,
        offset: usize,
        size: usize,
    ) -> Result<(), GpuError> {
        let end = offset.checked_add(size).unwrap_or(usize::MAX);
        if size == 0 || end > self.slot_size {
            return Err(GpuError::OutOfBounds {
                offset,
                end,
                len: self.slot_size,
            });
        }

        self.binds.push(BufferBind {
            bind_point,
            offset,
            size,
        });
        Ok(())
    }

    /// Points every registered bind at the current slot.
    pub fn rebind(&mut self) {
        let base = self.current * self.slot_size;
        for bind in &self.binds {
            self.buffer
                .bind_range(bind.bind_point, base + bind.offset, bind.size);
        }
    }

    /// Fences the work reading the current slot.
    pub fn lock(&mut self) -> Result<(), GpuError> {
        let fence = self.backend.insert_fence()?;
        self.fences[self.current] = Some(fence);
        Ok(())
    }

    pub fn swap(&mut self) {
        self.current = (self.current + 1) % self.fences.len();
    }

    pub fn lock_and_swap(&mut self) -> Result<(), GpuError> {
        self.lock()?;
        self.swap();
        Ok(())
    }

    fn range_mut(&mut self, start: usize, size: usize) -> Result<&mut [u8], GpuError> {
        let bytes = self.buffer.mapped_mut()?;
        let len = bytes.len();
        bytes.get_mut(start..start + size).ok_or(GpuError::OutOfBounds {
            offset: start,
            end: start + size,
            len,
        })
    }

    fn view_mut<T: Pod>(&mut self, start: usize, available: usize) -> Result<&mut T, GpuError> {
        let size = std::mem::size_of::<T>();
        if size > available {
            return Err(GpuError::SlotView {
                type_name: std::any::type_name::<T>(),
                reason: format!("needs {size} bytes, range holds {available}"),
            });
        }
        let bytes = self.range_mut(start, size)?;
        bytemuck::try_from_bytes_mut(bytes).map_err(|err| GpuError::SlotView {
            type_name: std::any::type_name::<T>(),
            reason: format!("{err:?}"),
        })
    }
}
