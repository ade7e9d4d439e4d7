//! Zoom levels and tile coordinates.
//!
//! At zoom `ZMID` one matrix cell covers one pixel. Every level below halves
//! the resolution and every level above doubles it. The range is chosen so
//! that the whole matrix fits in tile `(0, 0)` at `zmin`.

use std::fmt;

use loom_core::{LoomError, Result};

/// Zoom level at which one cell is one pixel.
pub const ZMID: i32 = 8;

/// Tile edge length in pixels.
pub const TILE_SIZE: usize = 256;

/// `ceil(log2(n))`, with `0` for `n <= 1`.
pub fn ceil_log2(n: usize) -> i32 {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as i32
    }
}

/// A validated tile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub z: i32,
    pub x: u64,
    pub y: u64,
}

impl TileKey {
    pub fn new(x: u64, y: u64, z: i32) -> Self {
        Self { z, x, y }
    }

    /// The four tiles one level finer, in `tl, tr, bl, br` order.
    pub fn children(self) -> [TileKey; 4] {
        let (x, y, z) = (self.x * 2, self.y * 2, self.z + 1);
        [
            TileKey::new(x, y, z),
            TileKey::new(x + 1, y, z),
            TileKey::new(x, y + 1, z),
            TileKey::new(x + 1, y + 1, z),
        ]
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{}/x{}/y{}", self.z, self.x, self.y)
    }
}

/// Valid zoom levels for one matrix shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoomRange {
    pub zmin: i32,
    pub zmid: i32,
    pub zmax: i32,
    rows: usize,
    cols: usize,
}

impl ZoomRange {
    pub fn for_shape(rows: usize, cols: usize) -> Self {
        let extent = ceil_log2(rows).max(ceil_log2(cols));
        Self {
            zmin: ZMID - extent,
            zmid: ZMID,
            zmax: ZMID + extent,
            rows,
            cols,
        }
    }

    /// `(zmin, zmid, zmax)`.
    pub fn as_tuple(&self) -> (i32, i32, i32) {
        (self.zmin, self.zmid, self.zmax)
    }

    /// Validate signed coordinates into a [`TileKey`].
    pub fn key(&self, x: i64, y: i64, z: i32) -> Result<TileKey> {
        if z < self.zmin || z > self.zmax {
            return Err(LoomError::Range(format!(
                "z={z} outside {}..={}",
                self.zmin, self.zmax
            )));
        }
        if x < 0 || y < 0 {
            return Err(LoomError::Range(format!(
                "tile coordinates must be non-negative, got x={x} y={y}"
            )));
        }
        Ok(TileKey::new(x as u64, y as u64, z))
    }

    /// Whether the tile's top-left pixel lies at or beyond the data.
    pub fn is_outside(&self, key: TileKey) -> bool {
        origin_beyond(key.x, self.cols, key.z) || origin_beyond(key.y, self.rows, key.z)
    }

    /// Number of valid (non-background) pixels along each axis of a tile,
    /// as `(columns, rows)`.
    pub fn valid_pixels(&self, key: TileKey) -> (usize, usize) {
        (
            valid_along(key.x, self.cols, key.z),
            valid_along(key.y, self.rows, key.z),
        )
    }

    /// Size in pixels of the full image at `zmax`, as `(width, height)`.
    pub fn dimensions(&self) -> (u64, u64) {
        let d = self.zmax - self.zmid;
        (
            scaled_extent(self.cols, d) as u64,
            scaled_extent(self.rows, d) as u64,
        )
    }
}

/// `floor(len * 2^shift)`, saturating.
fn scaled_extent(len: usize, shift: i32) -> u128 {
    let len = len as u128;
    if shift >= 0 {
        len.checked_shl(shift as u32)
            .filter(|v| v >> shift as u32 == len)
            .unwrap_or(u128::MAX)
    } else {
        len.checked_shr((-shift) as u32).unwrap_or(0)
    }
}

fn origin_beyond(index: u64, len: usize, z: i32) -> bool {
    let origin = index as u128 * TILE_SIZE as u128;
    origin >= scaled_extent(len, z - ZMID)
}

fn valid_along(index: u64, len: usize, z: i32) -> usize {
    let origin = index as u128 * TILE_SIZE as u128;
    let extent = scaled_extent(len, z - ZMID);
    extent.saturating_sub(origin).min(TILE_SIZE as u128) as usize
}
