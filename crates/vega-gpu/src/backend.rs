//! Boundary between the deferred command graph and host GPU execution.
//!
//! Implementations may record into a native graphics API, forward to a
//! remote/worker process, or capture commands for inspection in tests. The
//! traits deliberately assume nothing about the threading model of the host
//! API beyond fences being shareable across threads.

use std::sync::Arc;
use std::time::Duration;

use crate::node::RenderPassNode;

/// Screen-space rectangle a render pass draws into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderArea {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl RenderArea {
    pub fn with_extent(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The host queue rejected a recorded command buffer. Not retried; the
    /// submission's fence cycle is cancelled.
    #[error("host GPU queue rejected the command buffer: {reason}")]
    QueueFailure { reason: String },
}

/// Records commands for one submission.
///
/// A recorder is owned by a single command buffer slot and is only ever
/// driven by one thread between `begin` and `end`.
pub trait CommandRecorder: Send {
    fn begin(&mut self);
    fn end(&mut self);

    fn begin_render_pass(&mut self, pass: &RenderPassNode);
    fn next_subpass(&mut self);
    fn end_render_pass(&mut self);

    /// Clears a color attachment of the current subpass in place.
    fn clear_color_attachment(&mut self, index: u32, area: RenderArea, value: [f32; 4]);
    fn clear_depth_stencil_attachment(&mut self, area: RenderArea, depth: f32, stencil: u32);
}

/// A host fence tracking completion of one or more submissions.
///
/// Wait/poll observe the host GPU; `reset` rearms the fence for the next
/// submission and must only be called while nothing is in flight on it.
pub trait HostFence: Send + Sync {
    fn wait(&self);
    /// Returns whether the fence signalled within the timeout.
    fn wait_timeout(&self, timeout: Duration) -> bool;
    fn poll(&self) -> bool;
    fn reset(&self);
}

/// Factory and submission queue of the host graphics API.
pub trait GpuBackend: Send + Sync {
    fn create_recorder(&self) -> Box<dyn CommandRecorder>;
    fn create_fence(&self) -> Arc<dyn HostFence>;

    /// Host limit on subpasses per render pass; the executor closes a render
    /// pass before exceeding it.
    fn max_subpass_count(&self) -> u32;

    /// Submits one recorded command buffer, optionally signalling `fence` on
    /// completion.
    fn submit(
        &self,
        recorder: &mut dyn CommandRecorder,
        fence: Option<&dyn HostFence>,
    ) -> Result<(), SubmitError>;
}
