//! Deferred command-graph builder and executor for one GPU channel.

use std::sync::Arc;

use tracing::trace;

use crate::backend::{CommandRecorder, RenderArea, SubmitError};
use crate::cycle::FenceCycle;
use crate::node::{CommandNode, RecordFn, RenderPassNode};
use crate::resource::{GraphicsResource, Texture, TextureView};
use crate::scheduler::{ActiveCommandBuffer, CommandScheduler};

/// Outcome of routing a command into the active render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubpassToken {
    /// A fresh render pass was opened for the command.
    NewRenderPass,
    /// The pass was reused but the command starts a new subpass.
    NewSubpass,
    /// The command joins the current subpass (identical attachment set).
    Coalesced,
}

/// Assembles a lazy graph of render passes, subpasses, and raw commands, then
/// flushes it into one pooled command buffer per submission cycle.
///
/// One executor serves one logical GPU channel and is not thread-safe; the
/// channel thread is the only caller. Resources handed to `attach_*` must be
/// locked by that caller for the duration of the call.
pub struct CommandExecutor {
    scheduler: Arc<CommandScheduler>,
    max_subpass_count: u32,
    nodes: Vec<CommandNode>,
    /// Index into `nodes` of the open render pass, if any.
    render_pass: Option<usize>,
    subpass_count: u32,
    buffer: ActiveCommandBuffer,
    cycle: Arc<FenceCycle>,
    attached_textures: Vec<Arc<dyn Texture>>,
    attached_buffers: Vec<Arc<dyn GraphicsResource>>,
    flush_callbacks: Vec<Box<dyn FnMut() + Send>>,
}

impl CommandExecutor {
    pub fn new(scheduler: Arc<CommandScheduler>) -> Self {
        let max_subpass_count = scheduler.backend().max_subpass_count();
        let buffer = scheduler.allocate_command_buffer();
        let cycle = buffer.cycle();
        Self {
            scheduler,
            max_subpass_count,
            nodes: Vec::new(),
            render_pass: None,
            subpass_count: 0,
            buffer,
            cycle,
            attached_textures: Vec::new(),
            attached_buffers: Vec::new(),
            flush_callbacks: Vec::new(),
        }
    }

    /// The cycle the current batch of commands will be tracked by.
    pub fn cycle(&self) -> &Arc<FenceCycle> {
        &self.cycle
    }

    /// Registers a callback invoked before every submission's recording;
    /// persists across cycles.
    pub fn add_flush_callback(&mut self, callback: impl FnMut() + Send + 'static) {
        self.flush_callbacks.push(Box::new(callback));
    }

    /// Synchronizes the texture's host copy and ties its lifetime to the
    /// current cycle, once per cycle no matter how often it is attached.
    pub fn attach_texture(&mut self, texture: &Arc<dyn Texture>) {
        if self
            .attached_textures
            .iter()
            .any(|attached| Arc::ptr_eq(attached, texture))
        {
            return;
        }

        texture.wait_on_fence();
        texture.synchronize_host();
        texture.attach_cycle(&self.cycle);
        self.attached_textures.push(texture.clone());
    }

    /// Buffer analogue of [`CommandExecutor::attach_texture`].
    pub fn attach_buffer(&mut self, buffer: &Arc<dyn GraphicsResource>) {
        if self
            .attached_buffers
            .iter()
            .any(|attached| Arc::ptr_eq(attached, buffer))
        {
            return;
        }

        buffer.wait_on_fence();
        buffer.synchronize_host();
        buffer.attach_cycle(&self.cycle);
        self.attached_buffers.push(buffer.clone());
    }

    /// Routes a command into a render pass over `area` with the given
    /// attachments, reusing the open pass and subpass where possible.
    fn create_render_pass_with_subpass(
        &mut self,
        area: RenderArea,
        input_attachments: &[TextureView],
        color_attachments: &[TextureView],
        depth_stencil_attachment: Option<&TextureView>,
    ) -> SubpassToken {
        if let Some(index) = self.render_pass {
            let CommandNode::RenderPass(pass) = &self.nodes[index] else {
                unreachable!("render pass index points at a non-pass node");
            };
            // A differing area or the host subpass limit forces a new pass.
            if pass.area() != area || self.subpass_count >= self.max_subpass_count {
                self.end_render_pass();
            }
        }

        let Some(index) = self.render_pass else {
            let mut pass = RenderPassNode::new(area);
            pass.add_subpass(input_attachments, color_attachments, depth_stencil_attachment);
            self.render_pass = Some(self.nodes.len());
            self.subpass_count = 1;
            self.nodes.push(CommandNode::RenderPass(pass));
            return SubpassToken::NewRenderPass;
        };

        let CommandNode::RenderPass(pass) = &mut self.nodes[index] else {
            unreachable!("render pass index points at a non-pass node");
        };
        if pass.last_subpass_matches(input_attachments, color_attachments, depth_stencil_attachment)
        {
            SubpassToken::Coalesced
        } else {
            pass.add_subpass(input_attachments, color_attachments, depth_stencil_attachment);
            self.subpass_count += 1;
            SubpassToken::NewSubpass
        }
    }

    fn end_render_pass(&mut self) {
        if self.render_pass.take().is_some() {
            self.nodes.push(CommandNode::RenderPassEnd);
            self.subpass_count = 0;
        }
    }

    fn attach_views(
        &mut self,
        input_attachments: &[TextureView],
        color_attachments: &[TextureView],
        depth_stencil_attachment: Option<&TextureView>,
    ) {
        for view in input_attachments.iter().chain(color_attachments) {
            self.attach_texture(&view.texture);
        }
        if let Some(view) = depth_stencil_attachment {
            self.attach_texture(&view.texture);
        }
    }

    /// Adds a command executed inside a subpass with the given attachments.
    pub fn add_subpass(
        &mut self,
        function: RecordFn,
        area: RenderArea,
        input_attachments: &[TextureView],
        color_attachments: &[TextureView],
        depth_stencil_attachment: Option<&TextureView>,
    ) {
        self.attach_views(input_attachments, color_attachments, depth_stencil_attachment);
        let token = self.create_render_pass_with_subpass(
            area,
            input_attachments,
            color_attachments,
            depth_stencil_attachment,
        );
        self.nodes.push(match token {
            SubpassToken::NewSubpass => CommandNode::NextSubpassFunction(function),
            _ => CommandNode::Function(function),
        });
    }

    /// Clears a color attachment, folding the clear into the render pass's
    /// load operation when the attachment has no prior content in the pass.
    pub fn add_clear_color_subpass(&mut self, attachment: &TextureView, value: [f32; 4]) {
        let (width, height) = attachment.texture.dimensions();
        let area = RenderArea::with_extent(width, height);

        self.attach_texture(&attachment.texture);
        let token =
            self.create_render_pass_with_subpass(area, &[], std::slice::from_ref(attachment), None);

        let folded = if token == SubpassToken::Coalesced {
            // The joined subpass already has commands targeting this
            // attachment; the load operation cannot express the clear.
            false
        } else {
            let Some(index) = self.render_pass else {
                unreachable!("a subpass was just created");
            };
            let CommandNode::RenderPass(pass) = &mut self.nodes[index] else {
                unreachable!("render pass index points at a non-pass node");
            };
            pass.clear_color_attachment(0, value)
        };

        if folded {
            if token == SubpassToken::NewSubpass {
                self.nodes.push(CommandNode::NextSubpass);
            }
        } else {
            let function: RecordFn = Box::new(move |recorder, _| {
                recorder.clear_color_attachment(0, area, value);
            });
            self.nodes.push(match token {
                SubpassToken::NewSubpass => CommandNode::NextSubpassFunction(function),
                _ => CommandNode::Function(function),
            });
        }
    }

    /// Depth/stencil analogue of [`CommandExecutor::add_clear_color_subpass`].
    pub fn add_clear_depth_stencil_subpass(
        &mut self,
        attachment: &TextureView,
        depth: f32,
        stencil: u32,
    ) {
        let (width, height) = attachment.texture.dimensions();
        let area = RenderArea::with_extent(width, height);

        self.attach_texture(&attachment.texture);
        let token =
            self.create_render_pass_with_subpass(area, &[], &[], Some(attachment));

        let folded = if token == SubpassToken::Coalesced {
            false
        } else {
            let Some(index) = self.render_pass else {
                unreachable!("a subpass was just created");
            };
            let CommandNode::RenderPass(pass) = &mut self.nodes[index] else {
                unreachable!("render pass index points at a non-pass node");
            };
            pass.clear_depth_stencil_attachment(depth, stencil)
        };

        if folded {
            if token == SubpassToken::NewSubpass {
                self.nodes.push(CommandNode::NextSubpass);
            }
        } else {
            let function: RecordFn = Box::new(move |recorder, _| {
                recorder.clear_depth_stencil_attachment(area, depth, stencil);
            });
            self.nodes.push(match token {
                SubpassToken::NewSubpass => CommandNode::NextSubpassFunction(function),
                _ => CommandNode::Function(function),
            });
        }
    }

    /// Adds a command that must execute outside any render pass, closing the
    /// open one first.
    pub fn add_outside_render_pass_command(&mut self, function: RecordFn) {
        self.end_render_pass();
        self.nodes.push(CommandNode::Function(function));
    }

    /// Flushes the node graph into the pooled command buffer and submits it,
    /// then starts a fresh cycle without waiting for the GPU.
    pub fn submit(&mut self) -> Result<(), SubmitError> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        trace!(nodes = self.nodes.len(), "submitting command graph");

        for callback in &mut self.flush_callbacks {
            callback();
        }
        self.end_render_pass();

        {
            let mut recorder = self.buffer.recorder();
            recorder.begin();
            for node in self.nodes.drain(..) {
                Self::record_node(recorder.as_mut(), &self.cycle, node);
            }
            recorder.end();
        }

        self.scheduler.submit_command_buffer(&self.buffer)?;
        self.begin_cycle();
        Ok(())
    }

    /// Like [`CommandExecutor::submit`], but additionally waits for the GPU
    /// to finish this submission; used when host-visible results must be
    /// observable on return.
    pub fn submit_with_flush(&mut self) -> Result<(), SubmitError> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        let cycle = self.cycle.clone();
        self.submit()?;
        cycle.wait();
        Ok(())
    }

    fn record_node(recorder: &mut dyn CommandRecorder, cycle: &Arc<FenceCycle>, node: CommandNode) {
        match node {
            CommandNode::RenderPass(pass) => recorder.begin_render_pass(&pass),
            CommandNode::Function(function) => function(recorder, cycle),
            CommandNode::NextSubpass => recorder.next_subpass(),
            CommandNode::NextSubpassFunction(function) => {
                recorder.next_subpass();
                function(recorder, cycle);
            }
            CommandNode::RenderPassEnd => recorder.end_render_pass(),
        }
    }

    /// Rolls over to a fresh command buffer and cycle for the next batch.
    fn begin_cycle(&mut self) {
        self.buffer = self.scheduler.allocate_command_buffer();
        self.cycle = self.buffer.cycle();
        self.attached_textures.clear();
        self.attached_buffers.clear();
        self.render_pass = None;
        self.subpass_count = 0;
    }
}
