//! Pure tile kernels.
//!
//! These functions never touch storage: [`rescale_native`] turns a raw
//! matrix block into a tile, [`merge`] reduces four tiles into one coarser
//! tile, and [`magnify`] upsamples part of a native tile. The engine wraps
//! them with caching.

use ndarray::{s, Array2};

use crate::zoom::TILE_SIZE;

/// A `TILE_SIZE × TILE_SIZE` tile of display values in `0..=255`.
pub type Tile = Array2<f32>;

/// Extra weight of the brighter pixel of each vertical pair when merging.
/// A value of `2.0` gives the max a 3:1 share.
pub const MERGE_MAX_BIAS: f32 = 2.0;

/// An all-zero tile.
pub fn empty_tile() -> Tile {
    Array2::zeros((TILE_SIZE, TILE_SIZE))
}

/// Log2 contrast stretch of a native-resolution block.
///
/// `block` is the part of the matrix covered by the tile (at most
/// `TILE_SIZE` on each side); `mins` and `maxes` hold the extrema of each
/// of its rows. The result is zero-padded to a full tile. Each value maps to
/// `log2(v - min + 1) / log2(max - min + 1) * 255`, and zero maps to zero.
pub fn rescale_native(block: &Array2<f32>, mins: &[f64], maxes: &[f64]) -> Tile {
    let mut tile = empty_tile();
    let (h, w) = block.dim();
    let h = h.min(TILE_SIZE);
    let w = w.min(TILE_SIZE);
    for r in 0..h {
        let mn = mins.get(r).copied().unwrap_or(0.0);
        let mx = maxes.get(r).copied().unwrap_or(0.0);
        let mut denom = (mx - mn + 1.0).log2();
        if denom == 0.0 {
            denom = f64::from_bits(1);
        }
        for c in 0..w {
            let v = block[[r, c]] as f64;
            if v == 0.0 {
                continue;
            }
            let px = (v - mn + 1.0).log2() / denom * 255.0;
            tile[[r, c]] = if px.is_finite() { px as f32 } else { 0.0 };
        }
    }
    tile
}

/// Reduce four adjacent tiles into one tile at half the resolution.
///
/// Each output pixel covers a 2×2 block. Within each column of the block
/// the brighter pixel gets the extra weight [`MERGE_MAX_BIAS`], and the two
/// column results are averaged.
pub fn merge(tl: &Tile, tr: &Tile, bl: &Tile, br: &Tile) -> Tile {
    merge_with_bias(tl, tr, bl, br, MERGE_MAX_BIAS)
}

/// [`merge`] with an explicit max bias.
pub fn merge_with_bias(tl: &Tile, tr: &Tile, bl: &Tile, br: &Tile, bias: f32) -> Tile {
    let n = TILE_SIZE;
    let mut temp = Array2::<f32>::zeros((2 * n, 2 * n));
    temp.slice_mut(s![..n, ..n]).assign(tl);
    temp.slice_mut(s![..n, n..]).assign(tr);
    temp.slice_mut(s![n.., ..n]).assign(bl);
    temp.slice_mut(s![n.., n..]).assign(br);

    let scale = 1.0 / (2.0 * (bias + 2.0));
    let pair = |a: f32, b: f32| bias * a.max(b) + a + b;
    Array2::from_shape_fn((n, n), |(i, j)| {
        let (r, c) = (2 * i, 2 * j);
        let top = pair(temp[[r, c]], temp[[r + 1, c]]);
        let bottom = pair(temp[[r, c + 1]], temp[[r + 1, c + 1]]);
        (top + bottom) * scale
    })
}

/// Upsample the part of a native tile that tile `(x, y)` covers `d` levels
/// above native resolution.
pub fn magnify(native: &Tile, x: u64, y: u64, d: u32) -> Tile {
    let span = if d <= 8 { TILE_SIZE >> d } else { 1 };
    let offset = |i: u64| -> usize {
        let within = if d >= 64 { i } else { i & ((1u64 << d) - 1) };
        ((within as u128 * TILE_SIZE as u128) >> d) as usize
    };
    let (ox, oy) = (offset(x), offset(y));
    let mut tile = native
        .slice(s![oy..oy + span, ox..ox + span])
        .to_owned();
    while tile.nrows() < TILE_SIZE {
        tile = double(&tile);
    }
    tile
}

/// Nearest-neighbour 2× upsampling: every pixel becomes a 2×2 block.
pub fn double(tile: &Array2<f32>) -> Array2<f32> {
    let (h, w) = tile.dim();
    let mut out = Array2::zeros((2 * h, 2 * w));
    out.slice_mut(s![0..;2, 0..;2]).assign(tile);
    out.slice_mut(s![1..;2, 0..;2]).assign(tile);
    out.slice_mut(s![0..;2, 1..;2]).assign(tile);
    out.slice_mut(s![1..;2, 1..;2]).assign(tile);
    out
}
