use std::fmt;

use model::{FramebufferSize, TILE_EDGE, TileRegion};

use crate::{Rgba8, Tile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferError {
    RegionOutOfBounds {
        region: TileRegion,
        size: FramebufferSize,
    },
}

impl fmt::Display for FramebufferError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramebufferError::RegionOutOfBounds { region, size } => write!(
                formatter,
                "tile region {:?} does not fit a {}x{} framebuffer",
                region.bounds(),
                size.width,
                size.height
            ),
        }
    }
}

impl std::error::Error for FramebufferError {}

/// Destination of one frame's tiles.
pub trait Framebuffer {
    fn size(&self) -> FramebufferSize;

    /// Overwrites exactly the pixels inside `tile.region`.
    fn insert_tile(&mut self, tile: &Tile) -> Result<(), FramebufferError>;
}

#[derive(Debug, Clone)]
pub struct Rgba8Framebuffer {
    size: FramebufferSize,
    pixels: Vec<Rgba8>,
}

impl Rgba8Framebuffer {
    pub fn new(size: FramebufferSize) -> Self {
        Self {
            size,
            pixels: vec![[0; 4]; size.pixel_count()],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Rgba8 {
        assert!(
            x < self.size.width && y < self.size.height,
            "pixel ({x}, {y}) outside {}x{} framebuffer",
            self.size.width,
            self.size.height
        );
        self.pixels[(y * self.size.width + x) as usize]
    }

    pub fn pixels(&self) -> &[Rgba8] {
        &self.pixels
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels[..])
    }

    pub fn clear(&mut self) {
        self.pixels.fill([0; 4]);
    }
}

impl Framebuffer for Rgba8Framebuffer {
    fn size(&self) -> FramebufferSize {
        self.size
    }

    fn insert_tile(&mut self, tile: &Tile) -> Result<(), FramebufferError> {
        let region = tile.region;
        if !region.fits_within(self.size) {
            return Err(FramebufferError::RegionOutOfBounds {
                region,
                size: self.size,
            });
        }
        let width = region.width() as usize;
        let source = tile.pixels();
        for local_y in 0..region.height() {
            let source_start = (local_y * TILE_EDGE) as usize;
            let target_y = region.lower.y as u32 + local_y;
            let target_start = (target_y * self.size.width + region.lower.x as u32) as usize;
            self.pixels[target_start..target_start + width]
                .copy_from_slice(&source[source_start..source_start + width]);
        }
        Ok(())
    }
}
