use std::fmt;

use model::FramebufferSize;

use crate::Tile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderJobError {
    message: String,
}

impl RenderJobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for RenderJobError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "render job failed: {}", self.message)
    }
}

impl std::error::Error for RenderJobError {}

/// Per-frame pixel kernel.
///
/// Called concurrently from every pool thread for distinct tiles of one
/// frame. Any state mutated across calls is the implementor's business.
pub trait RenderJob: Sync {
    /// Fills `tile`'s payload for `tile.region`.
    fn render_tile(&self, tile: &mut Tile) -> Result<(), RenderJobError>;
}

impl<J: RenderJob + ?Sized> RenderJob for &J {
    fn render_tile(&self, tile: &mut Tile) -> Result<(), RenderJobError> {
        (**self).render_tile(tile)
    }
}

/// Creates the render job for each frame.
pub trait TileRenderer {
    type Job: RenderJob;

    fn create_render_job(&self, size: FramebufferSize) -> Self::Job;
}
