//! Collaborator traits for resources whose lifetimes ride on fence cycles.

use std::sync::Arc;

use crate::cycle::FenceCycle;

/// A GPU-visible resource (texture, buffer) whose guest-written contents must
/// be pulled to the host before use and whose destruction must wait for any
/// submission referencing it.
///
/// Callers lock the resource before handing it to the executor; none of these
/// methods take internal locks.
pub trait GraphicsResource: Send + Sync {
    /// Makes the host-visible copy reflect all prior guest writes.
    fn synchronize_host(&self);

    /// Blocks until the last cycle this resource was attached to completes.
    fn wait_on_fence(&self);

    /// Ties the resource's lifetime to the given submission.
    fn attach_cycle(&self, cycle: &Arc<FenceCycle>);
}

pub trait Texture: GraphicsResource {
    /// Width and height in texels.
    fn dimensions(&self) -> (u32, u32);
}

/// Which planes of a texture an attachment addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureAspect {
    Color,
    DepthStencil,
}

/// A view of a texture usable as a render-pass attachment.
///
/// Views are compared by texture identity plus aspect; two views of the same
/// texture with the same aspect are the same attachment for the purposes of
/// subpass coalescing.
#[derive(Clone)]
pub struct TextureView {
    pub texture: Arc<dyn Texture>,
    pub aspect: TextureAspect,
}

impl TextureView {
    pub fn color(texture: Arc<dyn Texture>) -> Self {
        Self {
            texture,
            aspect: TextureAspect::Color,
        }
    }

    pub fn depth_stencil(texture: Arc<dyn Texture>) -> Self {
        Self {
            texture,
            aspect: TextureAspect::DepthStencil,
        }
    }

    pub fn same_attachment(&self, other: &TextureView) -> bool {
        Arc::ptr_eq(&self.texture, &other.texture) && self.aspect == other.aspect
    }
}

impl std::fmt::Debug for TextureView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureView")
            .field("texture", &Arc::as_ptr(&self.texture))
            .field("aspect", &self.aspect)
            .finish()
    }
}
