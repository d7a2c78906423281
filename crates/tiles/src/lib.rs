mod framebuffer;
mod render_job;

use std::fmt;

use model::{FramebufferSize, TILE_EDGE, TILE_PIXELS, TileLayout, TileRegion};
use static_assertions::{assert_eq_size, const_assert};

pub use framebuffer::{Framebuffer, FramebufferError, Rgba8Framebuffer};
pub use render_job::{RenderJob, RenderJobError, TileRenderer};

/// One RGBA pixel, 8 bits per channel.
pub type Rgba8 = [u8; 4];

assert_eq_size!(Rgba8, u32);
const_assert!(TILE_EDGE > 0 && TILE_EDGE <= 1024);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileFormat {
    Rgba8,
}

impl TileFormat {
    pub const fn wire_tag(self) -> u8 {
        match self {
            TileFormat::Rgba8 => 1,
        }
    }

    pub const fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(TileFormat::Rgba8),
            _ => None,
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileFormat::Rgba8 => write!(formatter, "rgba8"),
        }
    }
}

/// A tile in flight: created per tile index, filled by a render job, then
/// either sent or inserted exactly once.
///
/// The payload always has room for a full `TILE_EDGE x TILE_EDGE` block with
/// stride `TILE_EDGE`, even when `region` is clipped at the framebuffer edge.
#[derive(Clone, PartialEq)]
pub struct Tile {
    pub region: TileRegion,
    pub format: TileFormat,
    pixels: Box<[Rgba8]>,
    fb_size: FramebufferSize,
    rcp_fb_size: [f32; 2],
}

impl Tile {
    pub fn new(region: TileRegion, layout: &TileLayout) -> Self {
        Self::with_pixels(
            region,
            TileFormat::Rgba8,
            vec![[0; 4]; TILE_PIXELS].into_boxed_slice(),
            layout,
        )
    }

    /// Panics if `pixels` is not exactly `TILE_EDGE * TILE_EDGE` long.
    pub fn with_pixels(
        region: TileRegion,
        format: TileFormat,
        pixels: Box<[Rgba8]>,
        layout: &TileLayout,
    ) -> Self {
        assert_eq!(
            pixels.len(),
            TILE_PIXELS,
            "tile payload must hold exactly TILE_EDGE * TILE_EDGE pixels"
        );
        let fb_size = layout.size();
        Self {
            region,
            format,
            pixels,
            fb_size,
            rcp_fb_size: fb_size.reciprocal(),
        }
    }

    pub fn fb_size(&self) -> FramebufferSize {
        self.fb_size
    }

    pub fn rcp_fb_size(&self) -> [f32; 2] {
        self.rcp_fb_size
    }

    pub fn pixels(&self) -> &[Rgba8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [Rgba8] {
        &mut self.pixels
    }

    pub fn into_pixels(self) -> Box<[Rgba8]> {
        self.pixels
    }

    pub fn payload_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels[..])
    }

    /// Pixel at tile-local `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Rgba8 {
        self.pixels[Self::offset(x, y)]
    }

    pub fn pixel_mut(&mut self, x: u32, y: u32) -> &mut Rgba8 {
        &mut self.pixels[Self::offset(x, y)]
    }

    fn offset(x: u32, y: u32) -> usize {
        assert!(
            x < TILE_EDGE && y < TILE_EDGE,
            "tile-local pixel ({x}, {y}) outside {TILE_EDGE}x{TILE_EDGE}"
        );
        (y * TILE_EDGE + x) as usize
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Tile")
            .field("region", &self.region)
            .field("format", &self.format)
            .field("fb_size", &self.fb_size)
            .finish_non_exhaustive()
    }
}
