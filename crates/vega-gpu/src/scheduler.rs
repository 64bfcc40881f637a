//! Pooled allocation and submission of command buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::backend::{CommandRecorder, GpuBackend, HostFence, SubmitError};
use crate::cycle::FenceCycle;

/// A pooled command buffer: its recorder, the fence tracking all of its
/// submissions, and the cycle of the latest one.
///
/// `active` guards against concurrent recordings; a slot is reusable once the
/// flag is clear and its previous cycle has signalled.
struct CommandBufferSlot {
    active: AtomicBool,
    recorder: Mutex<Box<dyn CommandRecorder>>,
    fence: Arc<dyn HostFence>,
    cycle: Mutex<Arc<FenceCycle>>,
}

impl CommandBufferSlot {
    fn new(backend: &dyn GpuBackend) -> Arc<Self> {
        let fence = backend.create_fence();
        Arc::new(Self {
            active: AtomicBool::new(true),
            recorder: Mutex::new(backend.create_recorder()),
            fence: fence.clone(),
            cycle: Mutex::new(FenceCycle::new(fence)),
        })
    }

    /// Claims the slot if it is neither being recorded nor still executing.
    fn allocate_if_free(&self) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // The GPU may still be chewing on the previous submission; in that
        // case the fence cannot be reset yet and the slot stays busy.
        let mut cycle = self.cycle.lock().unwrap();
        if !cycle.poll() {
            self.active.store(false, Ordering::Release);
            return false;
        }

        *cycle = FenceCycle::new(self.fence.clone());
        true
    }
}

/// An exclusively held command buffer; releases its pool slot on drop.
pub struct ActiveCommandBuffer {
    slot: Arc<CommandBufferSlot>,
}

impl ActiveCommandBuffer {
    pub fn recorder(&self) -> MutexGuard<'_, Box<dyn CommandRecorder>> {
        self.slot.recorder.lock().unwrap()
    }

    /// The cycle tracking this recording's eventual submission.
    pub fn cycle(&self) -> Arc<FenceCycle> {
        self.slot.cycle.lock().unwrap().clone()
    }
}

impl Drop for ActiveCommandBuffer {
    fn drop(&mut self) {
        self.slot.active.store(false, Ordering::Release);
    }
}

/// Hands out command buffers from a pool and submits them to the host queue.
///
/// The pool is shared between threads rather than kept per-thread. Per-slot
/// atomic claims make concurrent allocation safe, and sharing additionally
/// lets one thread reuse a buffer another thread has finished with, so every
/// schedule a thread-local pool could produce is still possible here.
pub struct CommandScheduler {
    backend: Arc<dyn GpuBackend>,
    /// Guards pool growth; per-slot claims go through the atomic flag.
    slots: Mutex<Vec<Arc<CommandBufferSlot>>>,
}

impl CommandScheduler {
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    /// Claims a free slot, growing the pool when every slot is busy or still
    /// executing. Never blocks on the GPU.
    pub fn allocate_command_buffer(&self) -> ActiveCommandBuffer {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter() {
            if slot.allocate_if_free() {
                return ActiveCommandBuffer { slot: slot.clone() };
            }
        }

        let slot = CommandBufferSlot::new(self.backend.as_ref());
        slots.push(slot.clone());
        debug!(pool_size = slots.len(), "grew command buffer pool");
        ActiveCommandBuffer { slot }
    }

    /// Submits the buffer's recording, signalling its fence on completion.
    ///
    /// Failure cancels the cycle so attached resources are released without
    /// waiting on the GPU.
    pub fn submit_command_buffer(&self, buffer: &ActiveCommandBuffer) -> Result<(), SubmitError> {
        trace!("submitting command buffer");
        let mut recorder = buffer.recorder();
        let result = self
            .backend
            .submit(recorder.as_mut(), Some(buffer.slot.fence.as_ref()));
        if let Err(error) = &result {
            buffer.cycle().cancel();
            tracing::error!(%error, "command buffer submission failed");
        }
        result
    }

    /// Records with `record` and submits in one step, returning the cycle the
    /// caller can wait on.
    pub fn submit_with_cycle(
        &self,
        record: impl FnOnce(&mut dyn CommandRecorder, &Arc<FenceCycle>),
    ) -> Result<Arc<FenceCycle>, SubmitError> {
        let buffer = self.allocate_command_buffer();
        let cycle = buffer.cycle();
        {
            let mut recorder = buffer.recorder();
            recorder.begin();
            record(recorder.as_mut(), &cycle);
            recorder.end();
        }
        self.submit_command_buffer(&buffer)?;
        Ok(cycle)
    }

    /// Number of slots ever created; for observability.
    pub fn pool_size(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
