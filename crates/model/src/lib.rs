use std::fmt;

use bitvec::prelude::{BitVec, Lsb0};

/// Maximum edge length of a tile in pixels. Edge tiles are clipped.
pub const TILE_EDGE: u32 = 64;
/// Pixel units carried by every tile payload, clipped or not.
pub const TILE_PIXELS: usize = (TILE_EDGE * TILE_EDGE) as usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferSize {
    pub width: u32,
    pub height: u32,
}

impl FramebufferSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Reciprocal of the size, handed to render kernels so they can
    /// normalise pixel coordinates without dividing per pixel.
    pub fn reciprocal(self) -> [f32; 2] {
        [1.0 / self.width as f32, 1.0 / self.height as f32]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PixelPos {
    pub x: i32,
    pub y: i32,
}

/// Half-open pixel rectangle `[lower, upper)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TileRegion {
    pub lower: PixelPos,
    pub upper: PixelPos,
}

impl TileRegion {
    pub const fn from_bounds(bounds: [i32; 4]) -> Self {
        Self {
            lower: PixelPos {
                x: bounds[0],
                y: bounds[1],
            },
            upper: PixelPos {
                x: bounds[2],
                y: bounds[3],
            },
        }
    }

    /// `[lower.x, lower.y, upper.x, upper.y]`, the order used on the wire.
    pub const fn bounds(self) -> [i32; 4] {
        [self.lower.x, self.lower.y, self.upper.x, self.upper.y]
    }

    pub const fn width(self) -> u32 {
        (self.upper.x - self.lower.x) as u32
    }

    pub const fn height(self) -> u32 {
        (self.upper.y - self.lower.y) as u32
    }

    pub const fn is_empty(self) -> bool {
        self.upper.x <= self.lower.x || self.upper.y <= self.lower.y
    }

    pub fn contains(self, x: i32, y: i32) -> bool {
        x >= self.lower.x && x < self.upper.x && y >= self.lower.y && y < self.upper.y
    }

    pub fn intersects(self, other: TileRegion) -> bool {
        self.lower.x < other.upper.x
            && other.lower.x < self.upper.x
            && self.lower.y < other.upper.y
            && other.lower.y < self.upper.y
    }

    pub fn fits_within(self, size: FramebufferSize) -> bool {
        !self.is_empty()
            && self.lower.x >= 0
            && self.lower.y >= 0
            && self.upper.x as i64 <= size.width as i64
            && self.upper.y as i64 <= size.height as i64
            && self.width() <= TILE_EDGE
            && self.height() <= TILE_EDGE
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileIndex(pub u32);

impl TileIndex {
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TileIndex {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "tile#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileLayoutError {
    EmptyFramebuffer,
    TileIndexOutOfBounds { index: TileIndex, num_tiles: u32 },
    TooManyTiles,
}

impl fmt::Display for TileLayoutError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileLayoutError::EmptyFramebuffer => {
                write!(formatter, "framebuffer has a zero dimension")
            }
            TileLayoutError::TileIndexOutOfBounds { index, num_tiles } => {
                write!(formatter, "{index} is out of bounds for {num_tiles} tiles")
            }
            TileLayoutError::TooManyTiles => {
                write!(formatter, "framebuffer needs more tiles than a tag can address")
            }
        }
    }
}

impl std::error::Error for TileLayoutError {}

/// Global enumeration of the tiles of one frame.
///
/// Every process derives the same layout from the framebuffer size alone, so
/// agreeing on which rectangle a tile index denotes needs no messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TileLayout {
    size: FramebufferSize,
    tiles_per_row: u32,
    tiles_per_column: u32,
}

impl TileLayout {
    pub fn new(size: FramebufferSize) -> Result<Self, TileLayoutError> {
        if size.width == 0 || size.height == 0 {
            return Err(TileLayoutError::EmptyFramebuffer);
        }
        if size.width > i32::MAX as u32 || size.height > i32::MAX as u32 {
            return Err(TileLayoutError::TooManyTiles);
        }
        let tiles_per_row = size.width.div_ceil(TILE_EDGE);
        let tiles_per_column = size.height.div_ceil(TILE_EDGE);
        // Tile indices travel as non-negative i32 grants and u32 tags.
        match tiles_per_row.checked_mul(tiles_per_column) {
            Some(total) if total <= i32::MAX as u32 => {}
            _ => return Err(TileLayoutError::TooManyTiles),
        }
        Ok(Self {
            size,
            tiles_per_row,
            tiles_per_column,
        })
    }

    pub const fn size(&self) -> FramebufferSize {
        self.size
    }

    pub const fn tiles_per_row(&self) -> u32 {
        self.tiles_per_row
    }

    pub const fn tiles_per_column(&self) -> u32 {
        self.tiles_per_column
    }

    pub const fn num_tiles(&self) -> u32 {
        self.tiles_per_row * self.tiles_per_column
    }

    pub fn tile_region(&self, index: TileIndex) -> Result<TileRegion, TileLayoutError> {
        if index.0 >= self.num_tiles() {
            return Err(TileLayoutError::TileIndexOutOfBounds {
                index,
                num_tiles: self.num_tiles(),
            });
        }
        let tile_x = index.0 % self.tiles_per_row;
        let tile_y = index.0 / self.tiles_per_row;
        let lower_x = tile_x * TILE_EDGE;
        let lower_y = tile_y * TILE_EDGE;
        let upper_x = (lower_x + TILE_EDGE).min(self.size.width);
        let upper_y = (lower_y + TILE_EDGE).min(self.size.height);
        Ok(TileRegion {
            lower: PixelPos {
                x: lower_x as i32,
                y: lower_y as i32,
            },
            upper: PixelPos {
                x: upper_x as i32,
                y: upper_y as i32,
            },
        })
    }

    pub fn regions(&self) -> impl Iterator<Item = (TileIndex, TileRegion)> + '_ {
        (0..self.num_tiles()).map(move |raw| {
            let index = TileIndex(raw);
            let region = self
                .tile_region(index)
                .expect("index below num_tiles always has a region");
            (index, region)
        })
    }
}

/// Region of tile `index` for a framebuffer of `size`.
pub fn tile_region(index: TileIndex, size: FramebufferSize) -> Result<TileRegion, TileLayoutError> {
    TileLayout::new(size)?.tile_region(index)
}

/// Which tile indices of one frame have been seen.
pub struct TileCoverage {
    seen: BitVec<usize, Lsb0>,
    seen_count: usize,
}

impl TileCoverage {
    pub fn new(num_tiles: u32) -> Self {
        Self {
            seen: BitVec::repeat(false, num_tiles as usize),
            seen_count: 0,
        }
    }

    /// Marks `index` as seen. Returns `false` if it already was.
    ///
    /// Panics if `index` is outside the frame.
    pub fn mark(&mut self, index: TileIndex) -> bool {
        let slot = index.as_usize();
        assert!(
            slot < self.seen.len(),
            "{index} is outside a coverage of {} tiles",
            self.seen.len()
        );
        if self.seen[slot] {
            return false;
        }
        self.seen.set(slot, true);
        self.seen_count += 1;
        true
    }

    pub fn contains(&self, index: TileIndex) -> bool {
        self.seen
            .get(index.as_usize())
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    pub fn seen_count(&self) -> usize {
        self.seen_count
    }

    pub fn is_complete(&self) -> bool {
        self.seen_count == self.seen.len()
    }

    pub fn iter_missing(&self) -> impl Iterator<Item = TileIndex> + '_ {
        self.seen.iter_zeros().map(|slot| TileIndex(slot as u32))
    }
}
