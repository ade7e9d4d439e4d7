//! Tile persistence.
//!
//! The engine only talks to a [`TileStore`]. [`DiskTileStore`] keeps tiles
//! next to the loom file so they survive restarts; [`MemoryTileStore`] is
//! for tests and short-lived engines.
//!
//! On-disk layout:
//!
//! ```text
//! <name>.loom.tiles/
//!   marker              modification marker the tiles were built from
//!   extrema.json.gz     per-row mins and maxes
//!   z08/x000_y001.tile  zstd-compressed little-endian f32, row-major
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use tracing::{debug, info};

use loom_core::compress::{
    load_gzipped_json_string, save_gzipped_json, zstd_compress, zstd_decompress,
};
use loom_core::{LoomError, Result};

use crate::extrema::RowExtrema;
use crate::tile::Tile;
use crate::zoom::{TileKey, TILE_SIZE};

const ZSTD_LEVEL: i32 = 3;
const MARKER_FILE: &str = "marker";
const EXTREMA_FILE: &str = "extrema.json.gz";

/// Storage for computed tiles and row extrema.
pub trait TileStore {
    fn get(&self, key: TileKey) -> Result<Option<Tile>>;

    fn put(&mut self, key: TileKey, tile: &Tile) -> Result<()>;

    fn contains(&self, key: TileKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn load_extrema(&self) -> Result<Option<RowExtrema>>;

    fn save_extrema(&mut self, extrema: &RowExtrema) -> Result<()>;

    /// The modification marker the cached tiles were built from.
    fn marker(&self) -> Result<Option<String>>;

    fn set_marker(&mut self, marker: &str) -> Result<()>;

    /// Drop every tile, the extrema and the marker.
    fn clear(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

/// Tiles stored as files in a directory beside the loom file.
#[derive(Debug, Clone)]
pub struct DiskTileStore {
    dir: PathBuf,
}

impl DiskTileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The tile directory for a loom file: `<file>.tiles`.
    pub fn for_file(loom_path: &Path) -> Self {
        let mut name = loom_path.as_os_str().to_os_string();
        name.push(".tiles");
        Self::new(PathBuf::from(name))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tile_path(&self, key: TileKey) -> PathBuf {
        self.dir
            .join(format!("z{:02}", key.z))
            .join(format!("x{:03}_y{:03}.tile", key.x, key.y))
    }
}

fn encode_tile(tile: &Tile) -> Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(TILE_SIZE * TILE_SIZE * 4);
    for v in tile.iter() {
        raw.extend_from_slice(&v.to_le_bytes());
    }
    zstd_compress(&raw, ZSTD_LEVEL)
}

fn decode_tile(bytes: &[u8], path: &Path) -> Result<Tile> {
    let raw = zstd_decompress(bytes)?;
    if raw.len() != TILE_SIZE * TILE_SIZE * 4 {
        return Err(LoomError::Format(format!(
            "{}: expected {} bytes, found {}",
            path.display(),
            TILE_SIZE * TILE_SIZE * 4,
            raw.len()
        )));
    }
    let values: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((TILE_SIZE, TILE_SIZE), values)
        .map_err(|e| LoomError::Format(format!("{}: {e}", path.display())))
}

impl TileStore for DiskTileStore {
    fn get(&self, key: TileKey) -> Result<Option<Tile>> {
        let path = self.tile_path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| LoomError::io_at(&path, e))?;
        decode_tile(&bytes, &path).map(Some)
    }

    fn put(&mut self, key: TileKey, tile: &Tile) -> Result<()> {
        let path = self.tile_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LoomError::io_at(parent, e))?;
        }
        let bytes = encode_tile(tile)?;
        fs::write(&path, bytes).map_err(|e| LoomError::io_at(&path, e))
    }

    fn contains(&self, key: TileKey) -> Result<bool> {
        Ok(self.tile_path(key).is_file())
    }

    fn load_extrema(&self) -> Result<Option<RowExtrema>> {
        match load_gzipped_json_string(&self.dir.join(EXTREMA_FILE))? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn save_extrema(&mut self, extrema: &RowExtrema) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| LoomError::io_at(&self.dir, e))?;
        save_gzipped_json(&self.dir.join(EXTREMA_FILE), extrema)?;
        Ok(())
    }

    fn marker(&self) -> Result<Option<String>> {
        let path = self.dir.join(MARKER_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(|s| Some(s.trim().to_string()))
            .map_err(|e| LoomError::io_at(&path, e))
    }

    fn set_marker(&mut self, marker: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| LoomError::io_at(&self.dir, e))?;
        let path = self.dir.join(MARKER_FILE);
        fs::write(&path, marker).map_err(|e| LoomError::io_at(&path, e))
    }

    fn clear(&mut self) -> Result<()> {
        if self.dir.exists() {
            info!(dir = %self.dir.display(), "removing tile cache");
            fs::remove_dir_all(&self.dir).map_err(|e| LoomError::io_at(&self.dir, e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// Tiles held in a hash map.
#[derive(Debug, Default, Clone)]
pub struct MemoryTileStore {
    tiles: HashMap<TileKey, Tile>,
    extrema: Option<RowExtrema>,
    marker: Option<String>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached tiles.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Cached keys in ascending order.
    pub fn keys(&self) -> Vec<TileKey> {
        let mut keys: Vec<_> = self.tiles.keys().copied().collect();
        keys.sort();
        keys
    }
}

impl TileStore for MemoryTileStore {
    fn get(&self, key: TileKey) -> Result<Option<Tile>> {
        Ok(self.tiles.get(&key).cloned())
    }

    fn put(&mut self, key: TileKey, tile: &Tile) -> Result<()> {
        debug!(%key, "caching tile in memory");
        self.tiles.insert(key, tile.clone());
        Ok(())
    }

    fn contains(&self, key: TileKey) -> Result<bool> {
        Ok(self.tiles.contains_key(&key))
    }

    fn load_extrema(&self) -> Result<Option<RowExtrema>> {
        Ok(self.extrema.clone())
    }

    fn save_extrema(&mut self, extrema: &RowExtrema) -> Result<()> {
        self.extrema = Some(extrema.clone());
        Ok(())
    }

    fn marker(&self) -> Result<Option<String>> {
        Ok(self.marker.clone())
    }

    fn set_marker(&mut self, marker: &str) -> Result<()> {
        self.marker = Some(marker.to_string());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.tiles.clear();
        self.extrema = None;
        self.marker = None;
        Ok(())
    }
}
