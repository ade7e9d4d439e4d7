//! Deep-zoom tiles for loom matrices.
//!
//! The matrix is presented as a zoomable image of 256×256 tiles:
//!
//! - **Zoom math**: [`ZoomRange`] and [`TileKey`]
//! - **Kernels**: contrast stretch, max-biased merge and magnification in [`tile`]
//! - **Engine**: [`TileEngine`] computes tiles on demand and caches them in a [`TileStore`]
//! - **Rendering**: viridis heatmap PNGs in [`render`]
//!
//! # Quick start
//!
//! ```no_run
//! use loom_store::{MatrixStore, OpenMode};
//! use loom_tiles::TileEngine;
//!
//! let store = MatrixStore::connect("demo.loom", OpenMode::ReadOnly)?;
//! let mut engine = TileEngine::open(&store)?;
//! engine.prepare(false)?;
//! let png = engine.get_image(0, 0, engine.zoom_range().zmin)?;
//! assert!(!png.is_empty());
//! # Ok::<(), loom_core::LoomError>(())
//! ```

pub mod cache;
pub mod engine;
pub mod extrema;
pub mod render;
pub mod tile;
pub mod zoom;

pub use cache::{DiskTileStore, MemoryTileStore, TileStore};
pub use engine::TileEngine;
pub use extrema::RowExtrema;
pub use render::PngCompression;
pub use tile::Tile;
pub use zoom::{TileKey, ZoomRange, TILE_SIZE, ZMID};
