//! Loom matrix container.
//!
//! A loom file holds a `float32` expression matrix (rows are genes, columns
//! are cells) together with typed row and column attributes:
//!
//! - **Container**: [`MatrixStore`] for create, connect, append and attribute edits
//! - **Attributes**: [`Attribute`] vectors with a persisted [`Schema`]
//! - **Selection**: [`Expr`] predicates and [`Selection`] sub-matrices
//!
//! # Quick start
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use loom_store::{Attribute, MatrixStore};
//! use ndarray::array;
//!
//! let mut rows = BTreeMap::new();
//! rows.insert("Gene".to_string(), Attribute::from(vec!["A", "B"]));
//! let mut cols = BTreeMap::new();
//! cols.insert("Cell".to_string(), Attribute::from(vec!["c1", "c2"]));
//!
//! let store = MatrixStore::create("demo.loom", &array![[1.0, 2.0], [3.0, 4.0]], rows, cols)?;
//! let sel = store.select("Gene == 'B'", "True")?;
//! assert_eq!(sel.shape(), (1, 2));
//! # Ok::<(), loom_core::LoomError>(())
//! ```

pub mod attribute;
pub mod predicate;
pub mod schema;
pub mod select;
pub mod store;
mod zarr;

pub use attribute::{AttrType, Attribute, Axis};
pub use predicate::{Expr, Mask};
pub use schema::Schema;
pub use select::{AttributeIndex, Selection};
pub use store::{MatrixStore, OpenMode};
pub use zarr::MATRIX_CHUNK;
