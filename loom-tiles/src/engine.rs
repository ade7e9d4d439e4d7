//! The deep-zoom tile engine.
//!
//! [`TileEngine`] answers `(x, y, z)` tile requests for one open
//! [`MatrixStore`]. Native tiles are read from the matrix and stretched,
//! coarser tiles are merged from their four children, and finer tiles are
//! magnified from the native tile beneath them. Every tile at or below
//! native resolution is persisted in the engine's [`TileStore`].

use tracing::{debug, info};

use loom_core::Result;
use loom_store::MatrixStore;

use crate::cache::{DiskTileStore, TileStore};
use crate::extrema::{RowExtrema, DEFAULT_CHUNK_ROWS};
use crate::render::{render_png, PngCompression};
use crate::tile::{empty_tile, magnify, merge, rescale_native, Tile};
use crate::zoom::{TileKey, ZoomRange, TILE_SIZE};

/// Tile computation and caching for one matrix.
pub struct TileEngine<'a, S: TileStore = DiskTileStore> {
    store: &'a MatrixStore,
    cache: S,
    range: ZoomRange,
    extrema: Option<RowExtrema>,
    extrema_chunk_rows: usize,
    png_compression: PngCompression,
    generated: usize,
}

impl<'a> TileEngine<'a, DiskTileStore> {
    /// Engine backed by the `<file>.tiles` directory of `store`.
    pub fn open(store: &'a MatrixStore) -> Result<Self> {
        Self::new(store, DiskTileStore::for_file(store.path()))
    }
}

impl<'a, S: TileStore> TileEngine<'a, S> {
    /// Wrap `cache`, discarding it if it was built from an older version
    /// of the matrix.
    pub fn new(store: &'a MatrixStore, mut cache: S) -> Result<Self> {
        let (rows, cols) = store.shape()?;
        let marker = store.modification_marker()?;
        let cached = cache.marker()?;
        if cached.as_deref() != Some(marker.as_str()) {
            if cached.is_some() {
                info!(path = %store.path().display(), "matrix changed since tiles were built");
            }
            cache.clear()?;
            cache.set_marker(&marker)?;
        }
        Ok(Self {
            store,
            cache,
            range: ZoomRange::for_shape(rows, cols),
            extrema: None,
            extrema_chunk_rows: DEFAULT_CHUNK_ROWS,
            png_compression: PngCompression::default(),
            generated: 0,
        })
    }

    pub fn with_extrema_chunk_rows(mut self, rows: usize) -> Self {
        self.extrema_chunk_rows = rows.max(1);
        self
    }

    pub fn with_png_compression(mut self, compression: PngCompression) -> Self {
        self.png_compression = compression;
        self
    }

    pub fn zoom_range(&self) -> ZoomRange {
        self.range
    }

    /// `(width, height)` of the full image at the deepest zoom.
    pub fn dimensions(&self) -> (u64, u64) {
        self.range.dimensions()
    }

    pub fn cache(&self) -> &S {
        &self.cache
    }

    pub fn into_cache(self) -> S {
        self.cache
    }

    /// Tiles computed (not served from cache) by this engine so far.
    pub fn generated(&self) -> usize {
        self.generated
    }

    /// Per-row extrema, loaded from the cache or computed on first use.
    pub fn extrema(&mut self) -> Result<&RowExtrema> {
        let extrema = match self.extrema.take() {
            Some(e) => e,
            None => self.load_or_compute_extrema()?,
        };
        Ok(self.extrema.insert(extrema))
    }

    fn load_or_compute_extrema(&mut self) -> Result<RowExtrema> {
        let (rows, _) = self.store.shape()?;
        if let Some(e) = self.cache.load_extrema()?.filter(|e| e.len() == rows) {
            debug!("row extrema loaded from cache");
            return Ok(e);
        }
        let e = RowExtrema::compute(self.store, self.extrema_chunk_rows)?;
        self.cache.save_extrema(&e)?;
        Ok(e)
    }

    /// The 256×256 tile at `(x, y, z)`.
    ///
    /// Fails with [`LoomError::Range`](loom_core::LoomError::Range) outside
    /// the zoom range or for negative coordinates. Tiles beyond the data
    /// are all zero.
    pub fn get_tile(&mut self, x: i64, y: i64, z: i32) -> Result<Tile> {
        let key = self.range.key(x, y, z)?;
        self.tile(key)
    }

    fn tile(&mut self, key: TileKey) -> Result<Tile> {
        if self.range.is_outside(key) {
            return Ok(empty_tile());
        }
        if key.z > self.range.zmid {
            let d = (key.z - self.range.zmid) as u32;
            let native = TileKey::new(
                key.x.checked_shr(d).unwrap_or(0),
                key.y.checked_shr(d).unwrap_or(0),
                self.range.zmid,
            );
            let tile = self.tile(native)?;
            return Ok(magnify(&tile, key.x, key.y, d));
        }
        if let Some(tile) = self.cache.get(key)? {
            return Ok(tile);
        }

        let tile = if key.z == self.range.zmid {
            self.native_tile(key)?
        } else {
            let [tl, tr, bl, br] = key.children();
            let tl = self.tile(tl)?;
            let tr = self.tile(tr)?;
            let bl = self.tile(bl)?;
            let br = self.tile(br)?;
            merge(&tl, &tr, &bl, &br)
        };
        self.cache.put(key, &tile)?;
        self.generated += 1;
        debug!(%key, "generated tile");
        Ok(tile)
    }

    fn native_tile(&mut self, key: TileKey) -> Result<Tile> {
        let (rows, cols) = self.store.shape()?;
        let y0 = key.y as usize * TILE_SIZE;
        let x0 = key.x as usize * TILE_SIZE;
        let y1 = (y0 + TILE_SIZE).min(rows);
        let x1 = (x0 + TILE_SIZE).min(cols);
        let (mins, maxes) = self.extrema()?.window(y0, y1 - y0);
        let block = self.store.read_region(y0..y1, x0..x1)?;
        Ok(rescale_native(&block, &mins, &maxes))
    }

    /// The tile at `(x, y, z)` rendered as a PNG heatmap.
    pub fn get_image(&mut self, x: i64, y: i64, z: i32) -> Result<Vec<u8>> {
        let key = self.range.key(x, y, z)?;
        let tile = self.tile(key)?;
        let (valid_cols, valid_rows) = self.range.valid_pixels(key);
        render_png(&tile, valid_cols, valid_rows, self.png_compression)
    }

    /// Generate and cache every tile from the most zoomed-out level down
    /// to native resolution. Returns the number of tiles computed.
    ///
    /// Without `truncate`, an already prepared cache is left alone.
    pub fn prepare(&mut self, truncate: bool) -> Result<usize> {
        let root = TileKey::new(0, 0, self.range.zmin);
        if truncate {
            info!(path = %self.store.path().display(), "truncating tile cache");
            self.cache.clear()?;
            self.cache.set_marker(&self.store.modification_marker()?)?;
            self.extrema = None;
        } else if self.cache.contains(root)? {
            info!(path = %self.store.path().display(), "tiles already prepared");
            return Ok(0);
        }
        let before = self.generated;
        self.extrema()?;
        self.tile(root)?;
        let count = self.generated - before;
        info!(path = %self.store.path().display(), tiles = count, "tiles prepared");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use loom_core::LoomError;
    use loom_store::{Attribute, OpenMode};
    use ndarray::{array, Array2};

    use crate::cache::MemoryTileStore;

    fn create(dir: &std::path::Path, m: &Array2<f32>) -> MatrixStore {
        let (r, c) = m.dim();
        let mut rows = BTreeMap::new();
        rows.insert(
            "Gene".to_string(),
            Attribute::String((0..r).map(|i| format!("g{i}")).collect()),
        );
        let mut cols = BTreeMap::new();
        cols.insert(
            "Cell".to_string(),
            Attribute::String((0..c).map(|i| format!("c{i}")).collect()),
        );
        MatrixStore::create(dir.join("t.loom"), m, rows, cols).unwrap()
    }

    fn small(dir: &std::path::Path) -> MatrixStore {
        create(
            dir,
            &array![
                [1.0f32, 2.0, 3.0, 4.0],
                [5.0, 6.0, 7.0, 8.0],
                [9.0, 10.0, 11.0, 12.0]
            ],
        )
    }

    #[test]
    fn native_tile_stretch() {
        let dir = tempfile::tempdir().unwrap();
        let store = small(dir.path());
        let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
        let t = engine.get_tile(0, 0, 8).unwrap();
        assert_eq!(t[[0, 0]], 0.0);
        assert!((t[[0, 1]] - 127.5).abs() < 1e-4);
        assert!((t[[0, 3]] - 255.0).abs() < 1e-4);
        assert_eq!(t[[0, 4]], 0.0);
        assert_eq!(t[[3, 0]], 0.0);
    }

    #[test]
    fn tiles_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = small(dir.path());
        let mut engine = TileEngine::open(&store).unwrap();
        let first = engine.get_tile(0, 0, 7).unwrap();
        let generated = engine.generated();
        let second = engine.get_tile(0, 0, 7).unwrap();
        assert_eq!(engine.generated(), generated);
        assert_eq!(first, second);
        drop(engine);

        let mut reopened = TileEngine::open(&store).unwrap();
        assert_eq!(reopened.get_tile(0, 0, 7).unwrap(), first);
        assert_eq!(reopened.generated(), 0);
    }

    #[test]
    fn zoom_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = small(dir.path());
        let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
        let (zmin, _, zmax) = engine.zoom_range().as_tuple();
        assert_eq!((zmin, zmax), (6, 10));
        let root = engine.get_tile(0, 0, zmin).unwrap();
        assert_eq!(root.dim(), (256, 256));
        assert!(root.iter().any(|&v| v > 0.0));
        assert!(matches!(engine.get_tile(0, 0, zmin - 1), Err(LoomError::Range(_))));
        assert!(matches!(engine.get_tile(0, 0, zmax + 1), Err(LoomError::Range(_))));
        assert!(matches!(engine.get_tile(-1, 0, 8), Err(LoomError::Range(_))));
        assert!(matches!(engine.get_tile(0, -3, 8), Err(LoomError::Range(_))));
    }

    #[test]
    fn tiles_beyond_data_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = small(dir.path());
        let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
        assert!(engine.get_tile(5, 0, 8).unwrap().iter().all(|&v| v == 0.0));
        assert!(engine.get_tile(0, 9, 10).unwrap().iter().all(|&v| v == 0.0));
        assert!(!engine.cache().contains(TileKey::new(5, 0, 8)).unwrap());
    }

    #[test]
    fn coarser_tile_is_merge_of_children() {
        let dir = tempfile::tempdir().unwrap();
        let m = Array2::from_shape_fn((300, 520), |(r, c)| ((r * 7 + c * 3) % 50) as f32);
        let store = create(dir.path(), &m);
        let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
        let parent = engine.get_tile(0, 0, 7).unwrap();
        let tl = engine.get_tile(0, 0, 8).unwrap();
        let tr = engine.get_tile(1, 0, 8).unwrap();
        let bl = engine.get_tile(0, 1, 8).unwrap();
        let br = engine.get_tile(1, 1, 8).unwrap();
        assert_eq!(parent, merge(&tl, &tr, &bl, &br));
    }

    #[test]
    fn magnified_tiles_replicate_native_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let store = small(dir.path());
        let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
        let native = engine.get_tile(0, 0, 8).unwrap();
        let up = engine.get_tile(0, 0, 9).unwrap();
        assert_eq!(up[[0, 0]], native[[0, 0]]);
        assert_eq!(up[[1, 1]], native[[0, 0]]);
        assert_eq!(up[[0, 2]], native[[0, 1]]);
        assert!(!engine.cache().contains(TileKey::new(0, 0, 9)).unwrap());
    }

    #[test]
    fn prepare_builds_the_pyramid_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = small(dir.path());
        let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
        assert_eq!(engine.prepare(false).unwrap(), 3);
        assert_eq!(
            engine.cache().keys(),
            vec![
                TileKey::new(0, 0, 6),
                TileKey::new(0, 0, 7),
                TileKey::new(0, 0, 8)
            ]
        );
        assert_eq!(engine.prepare(false).unwrap(), 0);
        assert_eq!(engine.prepare(true).unwrap(), 3);
    }

    #[test]
    fn modification_invalidates_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = small(dir.path()).path().to_path_buf();
        {
            let store = MatrixStore::connect(&path, OpenMode::ReadOnly).unwrap();
            let mut engine = TileEngine::open(&store).unwrap();
            engine.prepare(false).unwrap();
            assert!(engine.cache().contains(TileKey::new(0, 0, 6)).unwrap());
        }
        let mut store = MatrixStore::connect(&path, OpenMode::ReadWrite).unwrap();
        store.set_metadata("title", "changed").unwrap();
        let engine = TileEngine::open(&store).unwrap();
        assert!(!engine.cache().contains(TileKey::new(0, 0, 6)).unwrap());
        assert_eq!(
            engine.cache().marker().unwrap(),
            Some(store.modification_marker().unwrap())
        );
    }

    #[test]
    fn image_and_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let store = small(dir.path());
        let mut engine = TileEngine::new(&store, MemoryTileStore::new()).unwrap();
        assert_eq!(engine.dimensions(), (16, 12));
        let png = engine.get_image(0, 0, 8).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        assert!(matches!(engine.get_image(0, 0, 11), Err(LoomError::Range(_))));
    }
}
