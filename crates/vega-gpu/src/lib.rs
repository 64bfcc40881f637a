//! Deferred translation of guest GPU work into host command buffers.
//!
//! Engine state machines append nodes (render passes, subpasses, raw
//! commands) to a [`CommandExecutor`]; at submission the graph is flushed
//! into a command buffer pooled by [`CommandScheduler`] and handed to the
//! host [`GpuBackend`]. Every submission is tracked by a [`FenceCycle`] that
//! keeps attached resources alive until the host GPU is done with them.
//!
//! Consecutive draws into the same attachments are coalesced into one
//! subpass, and draws over the same render area share one render pass up to
//! the host's subpass limit, so the recorded stream stays close to what a
//! native title would produce.

mod backend;
mod cycle;
mod executor;
mod node;
mod resource;
mod scheduler;


pub use backend::{
    ClearValue, CommandRecorder, GpuBackend, HostFence, RenderArea, SubmitError,
};
pub use cycle::FenceCycle;
pub use executor::CommandExecutor;
pub use node::{Attachment, CommandNode, LoadOp, RecordFn, RenderPassNode, SubpassDescription};
pub use resource::{GraphicsResource, Texture, TextureAspect, TextureView};
pub use scheduler::{ActiveCommandBuffer, CommandScheduler};
