//! Deferred command nodes replayed against a recorder at submit time.

use std::sync::Arc;

use crate::backend::{ClearValue, CommandRecorder, RenderArea};
use crate::cycle::FenceCycle;
use crate::resource::TextureView;

/// A command recorded lazily while the graph is built and replayed once at
/// submission.
pub type RecordFn = Box<dyn FnOnce(&mut dyn CommandRecorder, &Arc<FenceCycle>) + Send>;

/// One element of the executor's append-only node sequence.
///
/// `RenderPass`/`RenderPassEnd` are balanced and subpass nodes only appear
/// between a pass and its end; the executor maintains this by construction.
pub enum CommandNode {
    RenderPass(RenderPassNode),
    Function(RecordFn),
    NextSubpass,
    NextSubpassFunction(RecordFn),
    RenderPassEnd,
}

/// How an attachment's previous contents are treated when its render pass
/// begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Load,
    Clear(ClearValue),
}

/// An attachment of a render pass, deduplicated across its subpasses.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub view: TextureView,
    pub load_op: LoadOp,
}

/// Indices into [`RenderPassNode::attachments`] used by one subpass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubpassDescription {
    pub input_attachments: Vec<usize>,
    pub color_attachments: Vec<usize>,
    pub depth_stencil_attachment: Option<usize>,
}

/// A render pass being assembled: its area, the union of attachments across
/// all subpasses, and one description per subpass.
pub struct RenderPassNode {
    area: RenderArea,
    attachments: Vec<Attachment>,
    subpasses: Vec<SubpassDescription>,
}

impl RenderPassNode {
    pub fn new(area: RenderArea) -> Self {
        Self {
            area,
            attachments: Vec::new(),
            subpasses: Vec::new(),
        }
    }

    pub fn area(&self) -> RenderArea {
        self.area
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    pub fn subpasses(&self) -> &[SubpassDescription] {
        &self.subpasses
    }

    /// Index of `view` in the deduplicated attachment list, adding it if new.
    fn add_attachment(&mut self, view: &TextureView) -> usize {
        if let Some(index) = self.find_attachment(view) {
            return index;
        }
        self.attachments.push(Attachment {
            view: view.clone(),
            load_op: LoadOp::Load,
        });
        self.attachments.len() - 1
    }

    fn find_attachment(&self, view: &TextureView) -> Option<usize> {
        self.attachments
            .iter()
            .position(|attachment| attachment.view.same_attachment(view))
    }

    /// Appends a subpass using the given attachment sets.
    pub fn add_subpass(
        &mut self,
        input_attachments: &[TextureView],
        color_attachments: &[TextureView],
        depth_stencil_attachment: Option<&TextureView>,
    ) {
        let description = SubpassDescription {
            input_attachments: input_attachments
                .iter()
                .map(|view| self.add_attachment(view))
                .collect(),
            color_attachments: color_attachments
                .iter()
                .map(|view| self.add_attachment(view))
                .collect(),
            depth_stencil_attachment: depth_stencil_attachment
                .map(|view| self.add_attachment(view)),
        };
        self.subpasses.push(description);
    }

    /// Whether the most recent subpass uses exactly these attachment sets, in
    /// which case a new command can join it instead of opening another
    /// subpass.
    pub fn last_subpass_matches(
        &self,
        input_attachments: &[TextureView],
        color_attachments: &[TextureView],
        depth_stencil_attachment: Option<&TextureView>,
    ) -> bool {
        let Some(last) = self.subpasses.last() else {
            return false;
        };

        let matches = |indices: &[usize], views: &[TextureView]| {
            indices.len() == views.len()
                && indices
                    .iter()
                    .zip(views)
                    .all(|(&index, view)| self.attachments[index].view.same_attachment(view))
        };

        matches(&last.input_attachments, input_attachments)
            && matches(&last.color_attachments, color_attachments)
            && match (last.depth_stencil_attachment, depth_stencil_attachment) {
                (None, None) => true,
                (Some(index), Some(view)) => self.attachments[index].view.same_attachment(view),
                _ => false,
            }
    }

    /// Folds a clear of the latest subpass's `color_index`-th color attachment
    /// into the pass's load operation.
    ///
    /// Only possible when no earlier subpass touches the attachment; returns
    /// whether the fold happened.
    pub fn clear_color_attachment(&mut self, color_index: usize, value: [f32; 4]) -> bool {
        let Some(&attachment) = self
            .subpasses
            .last()
            .and_then(|subpass| subpass.color_attachments.get(color_index))
        else {
            return false;
        };

        if self.attachment_used_before_last_subpass(attachment) {
            return false;
        }
        self.attachments[attachment].load_op = LoadOp::Clear(ClearValue::Color(value));
        true
    }

    /// Depth/stencil analogue of [`RenderPassNode::clear_color_attachment`].
    pub fn clear_depth_stencil_attachment(&mut self, depth: f32, stencil: u32) -> bool {
        let Some(attachment) = self
            .subpasses
            .last()
            .and_then(|subpass| subpass.depth_stencil_attachment)
        else {
            return false;
        };

        if self.attachment_used_before_last_subpass(attachment) {
            return false;
        }
        self.attachments[attachment].load_op = LoadOp::Clear(ClearValue::DepthStencil { depth, stencil });
        true
    }

    fn attachment_used_before_last_subpass(&self, attachment: usize) -> bool {
        let earlier = &self.subpasses[..self.subpasses.len() - 1];
        earlier.iter().any(|subpass| {
            subpass.input_attachments.contains(&attachment)
                || subpass.color_attachments.contains(&attachment)
                || subpass.depth_stencil_attachment == Some(attachment)
        })
    }
}
