//! Zarr V3 backend for loom containers.
//!
//! A loom container is a Zarr hierarchy on the local filesystem:
//!
//! ```text
//! <name>.loom/
//!   zarr.json            root group; attributes hold schema + file metadata
//!   matrix/              float32 (R, C), 64×64 chunks, grows along axis 1
//!   row_attrs/<name>/    one 1-D array per row attribute
//!   col_attrs/<name>/    one 1-D array per column attribute
//! ```

use std::num::NonZeroU64;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ndarray::Array2;
use serde_json::{Map, Value};
use zarrs::array::chunk_grid::ChunkGrid;
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::{ReadableWritableListableStorage, ReadableWritableListableStorageTraits};

use loom_core::{LoomError, Result};

use crate::attribute::{AttrType, Attribute};

pub(crate) type Store = ReadableWritableListableStorage;

/// Path of the main matrix inside the hierarchy.
pub(crate) const MATRIX: &str = "/matrix";

/// Rows and columns per matrix chunk.
pub const MATRIX_CHUNK: u64 = 64;

/// Elements per attribute chunk.
const ATTR_CHUNK: u64 = 1024;

pub(crate) fn zarr_err(e: impl std::fmt::Display) -> LoomError {
    LoomError::Storage(format!("Zarr error: {e}"))
}

// ---------------------------------------------------------------------------
// Stores and groups
// ---------------------------------------------------------------------------

pub(crate) fn open_store(path: &Path) -> Result<Store> {
    let store: Store = Arc::new(FilesystemStore::new(path).map_err(zarr_err)?);
    Ok(store)
}

pub(crate) fn write_group(store: &Store, path: &str, attributes: Map<String, Value>) -> Result<()> {
    let mut group = GroupBuilder::new()
        .build(store.clone(), path)
        .map_err(zarr_err)?;
    group.attributes_mut().extend(attributes);
    group.store_metadata().map_err(zarr_err)?;
    Ok(())
}

pub(crate) fn read_group_attributes(store: &Store, path: &str) -> Result<Map<String, Value>> {
    let group = Group::open(store.clone(), path)
        .map_err(|e| LoomError::Format(format!("no group at {path}: {e}")))?;
    Ok(group.attributes().clone())
}

// ---------------------------------------------------------------------------
// Chunk grid helper
// ---------------------------------------------------------------------------

fn make_chunk_grid(shape: &[u64]) -> ChunkGrid {
    let nz: Vec<NonZeroU64> = shape
        .iter()
        .map(|&s| NonZeroU64::new(s).unwrap_or(NonZeroU64::MIN))
        .collect();
    ChunkGrid::from(nz)
}

fn subset_2d(rows: &Range<usize>, cols: &Range<usize>) -> ArraySubset {
    ArraySubset::new_with_ranges(&[
        rows.start as u64..rows.end as u64,
        cols.start as u64..cols.end as u64,
    ])
}

fn subset_1d(range: Range<usize>) -> ArraySubset {
    ArraySubset::new_with_ranges(&[range.start as u64..range.end as u64])
}

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

pub(crate) fn create_matrix(store: &Store, matrix: &Array2<f32>) -> Result<()> {
    let (n_rows, n_cols) = matrix.dim();
    let array = ArrayBuilder::new(
        vec![n_rows as u64, n_cols as u64],
        DataType::Float32,
        make_chunk_grid(&[MATRIX_CHUNK, MATRIX_CHUNK]),
        FillValue::from(0.0f32),
    )
    .build(store.clone(), MATRIX)
    .map_err(zarr_err)?;
    array.store_metadata().map_err(zarr_err)?;
    if n_rows > 0 && n_cols > 0 {
        let flat: Vec<f32> = matrix.iter().copied().collect();
        array
            .store_array_subset_elements::<f32>(&array.subset_all(), &flat)
            .map_err(zarr_err)?;
    }
    Ok(())
}

/// Open the matrix and return its `(rows, cols)` shape.
pub(crate) fn matrix_shape(store: &Store) -> Result<(usize, usize)> {
    let array = Array::open(store.clone(), MATRIX)
        .map_err(|e| LoomError::Format(format!("no matrix: {e}")))?;
    if array.data_type() != &DataType::Float32 {
        return Err(LoomError::Format(format!(
            "matrix must be float32, found {:?}",
            array.data_type()
        )));
    }
    match array.shape() {
        [r, c] => Ok((*r as usize, *c as usize)),
        other => Err(LoomError::Format(format!(
            "matrix must be 2-dimensional, found {} dimensions",
            other.len()
        ))),
    }
}

pub(crate) fn read_matrix(
    store: &Store,
    rows: Range<usize>,
    cols: Range<usize>,
) -> Result<Array2<f32>> {
    let shape = (rows.len(), cols.len());
    if shape.0 == 0 || shape.1 == 0 {
        return Ok(Array2::zeros(shape));
    }
    let array = Array::open(store.clone(), MATRIX).map_err(zarr_err)?;
    let flat: Vec<f32> = array
        .retrieve_array_subset_elements::<f32>(&subset_2d(&rows, &cols))
        .map_err(zarr_err)?;
    Array2::from_shape_vec(shape, flat)
        .map_err(|e| LoomError::Storage(format!("matrix block shape error: {e}")))
}

pub(crate) fn write_matrix(
    store: &Store,
    row_start: usize,
    col_start: usize,
    block: &Array2<f32>,
) -> Result<()> {
    let (n_rows, n_cols) = block.dim();
    if n_rows == 0 || n_cols == 0 {
        return Ok(());
    }
    let array = Array::open(store.clone(), MATRIX).map_err(zarr_err)?;
    let flat: Vec<f32> = block.iter().copied().collect();
    let subset = subset_2d(&(row_start..row_start + n_rows), &(col_start..col_start + n_cols));
    array
        .store_array_subset_elements::<f32>(&subset, &flat)
        .map_err(zarr_err)
}

pub(crate) fn resize_matrix(store: &Store, n_rows: usize, n_cols: usize) -> Result<()> {
    let mut array = Array::open(store.clone(), MATRIX).map_err(zarr_err)?;
    array.set_shape(vec![n_rows as u64, n_cols as u64]);
    array.store_metadata().map_err(zarr_err)
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

fn attr_data_type(dtype: AttrType) -> (DataType, FillValue) {
    match dtype {
        AttrType::Float64 => (DataType::Float64, FillValue::from(0.0f64)),
        AttrType::Int => (DataType::Int64, FillValue::from(0i64)),
        AttrType::String => (DataType::String, FillValue::from("")),
    }
}

pub(crate) fn write_attribute(store: &Store, path: &str, attr: &Attribute) -> Result<()> {
    let n = attr.len();
    let (data_type, fill) = attr_data_type(attr.dtype());
    let array = ArrayBuilder::new(
        vec![n as u64],
        data_type,
        make_chunk_grid(&[ATTR_CHUNK]),
        fill,
    )
    .build(store.clone(), path)
    .map_err(zarr_err)?;
    array.store_metadata().map_err(zarr_err)?;
    if n > 0 {
        store_attr_values(&array, 0..n, attr)?;
    }
    Ok(())
}

fn store_attr_values(
    array: &Array<dyn ReadableWritableListableStorageTraits>,
    range: Range<usize>,
    attr: &Attribute,
) -> Result<()> {
    let subset = subset_1d(range);
    match attr {
        Attribute::Float64(v) => array.store_array_subset_elements::<f64>(&subset, v),
        Attribute::Int(v) => array.store_array_subset_elements::<i64>(&subset, v),
        Attribute::String(v) => array.store_array_subset_elements::<String>(&subset, v),
    }
    .map_err(zarr_err)
}

/// Grow a column attribute from `old_len` and write `tail` at the end.
pub(crate) fn append_attribute(
    store: &Store,
    path: &str,
    old_len: usize,
    tail: &Attribute,
) -> Result<()> {
    let mut array = Array::open(store.clone(), path).map_err(zarr_err)?;
    let new_len = old_len + tail.len();
    array.set_shape(vec![new_len as u64]);
    array.store_metadata().map_err(zarr_err)?;
    if !tail.is_empty() {
        store_attr_values(&array, old_len..new_len, tail)?;
    }
    Ok(())
}

/// Type an attribute array would be inferred as when a file carries no schema.
pub(crate) fn infer_attr_type(store: &Store, path: &str) -> Result<AttrType> {
    let array = Array::open(store.clone(), path)
        .map_err(|e| LoomError::Format(format!("unreadable attribute {path}: {e}")))?;
    Ok(match array.data_type() {
        DataType::String => AttrType::String,
        _ => AttrType::Float64,
    })
}

/// Read a whole attribute array and convert it to `dtype`.
pub(crate) fn read_attribute(store: &Store, path: &str, dtype: AttrType) -> Result<Attribute> {
    let array = Array::open(store.clone(), path)
        .map_err(|e| LoomError::Format(format!("unreadable attribute {path}: {e}")))?;
    let all = array.subset_all();
    let stored = match array.data_type() {
        DataType::String => Attribute::String(
            array
                .retrieve_array_subset_elements::<String>(&all)
                .map_err(zarr_err)?,
        ),
        DataType::Int64 => Attribute::Int(
            array
                .retrieve_array_subset_elements::<i64>(&all)
                .map_err(zarr_err)?,
        ),
        DataType::Int32 => Attribute::Int(
            array
                .retrieve_array_subset_elements::<i32>(&all)
                .map_err(zarr_err)?
                .into_iter()
                .map(i64::from)
                .collect(),
        ),
        DataType::Float32 => Attribute::Float64(
            array
                .retrieve_array_subset_elements::<f32>(&all)
                .map_err(zarr_err)?
                .into_iter()
                .map(f64::from)
                .collect(),
        ),
        DataType::Float64 => Attribute::Float64(
            array
                .retrieve_array_subset_elements::<f64>(&all)
                .map_err(zarr_err)?,
        ),
        other => {
            return Err(LoomError::Format(format!(
                "unsupported attribute type {other:?} at {path}"
            )))
        }
    };
    stored
        .cast(dtype)
        .map_err(|e| LoomError::Format(format!("{path} does not match its schema: {e}")))
}

/// Names of the attribute arrays stored in `group_dir`, skipping metadata.
pub(crate) fn list_attributes(group_dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(group_dir) {
        Ok(e) => e,
        Err(_) => return Ok(vec![]),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| LoomError::io_at(group_dir, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}
