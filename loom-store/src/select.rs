//! Attribute-keyed selection of sub-matrices.

use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::{concatenate, Array2, ArrayView2};
use tracing::debug;

use loom_core::{LoomError, Result};

use crate::attribute::{Attribute, Axis};
use crate::predicate::{select_indices, Expr, Mask};
use crate::store::MatrixStore;

/// Predicate evaluation over the in-memory attribute mirror of a
/// connection.
pub struct AttributeIndex<'a> {
    row_attrs: &'a BTreeMap<String, Attribute>,
    col_attrs: &'a BTreeMap<String, Attribute>,
    shape: (usize, usize),
}

impl<'a> AttributeIndex<'a> {
    pub fn new(store: &'a MatrixStore) -> Result<Self> {
        Ok(Self {
            row_attrs: store.row_attrs()?,
            col_attrs: store.col_attrs()?,
            shape: store.shape()?,
        })
    }

    /// Evaluate `predicate` against one axis.
    pub fn mask(&self, predicate: &str, axis: Axis) -> Result<Mask> {
        let attrs = match axis {
            Axis::Row => self.row_attrs,
            Axis::Column => self.col_attrs,
        };
        Expr::parse(predicate)?.evaluate(attrs)
    }

    /// Row indices matching `predicate`.
    pub fn rows(&self, predicate: &str) -> Result<Vec<usize>> {
        select_indices(predicate, self.row_attrs, self.shape.0)
    }

    /// Column indices matching `predicate`.
    pub fn columns(&self, predicate: &str) -> Result<Vec<usize>> {
        select_indices(predicate, self.col_attrs, self.shape.1)
    }
}

/// A selected sub-rectangle with its attribute slices.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub matrix: Array2<f32>,
    pub rows: Vec<usize>,
    pub columns: Vec<usize>,
    pub row_attrs: BTreeMap<String, Attribute>,
    pub col_attrs: BTreeMap<String, Attribute>,
}

impl Selection {
    pub fn shape(&self) -> (usize, usize) {
        self.matrix.dim()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }
}

/// Split sorted indices into maximal runs of consecutive values.
fn runs(indices: &[usize]) -> Vec<Range<usize>> {
    let mut out: Vec<Range<usize>> = Vec::new();
    for &i in indices {
        match out.last_mut() {
            Some(r) if r.end == i => r.end += 1,
            _ => out.push(i..i + 1),
        }
    }
    out
}

fn stack(blocks: &[Array2<f32>], axis: ndarray::Axis, empty: (usize, usize)) -> Result<Array2<f32>> {
    if blocks.is_empty() {
        return Ok(Array2::zeros(empty));
    }
    let views: Vec<ArrayView2<'_, f32>> = blocks.iter().map(|b| b.view()).collect();
    concatenate(axis, &views).map_err(|e| LoomError::Shape(e.to_string()))
}

fn subset_all(
    attrs: &BTreeMap<String, Attribute>,
    indices: &[usize],
) -> BTreeMap<String, Attribute> {
    attrs
        .iter()
        .map(|(k, v)| (k.clone(), v.subset(indices)))
        .collect()
}

impl MatrixStore {
    /// Select the rows and columns matching two predicates.
    ///
    /// A predicate that evaluates to a constant selects everything or
    /// nothing on its axis. Empty selections yield empty results.
    pub fn select(&self, row_predicate: &str, col_predicate: &str) -> Result<Selection> {
        let index = AttributeIndex::new(self)?;
        let rows = index.rows(row_predicate)?;
        let columns = index.columns(col_predicate)?;
        self.select_indices(&rows, &columns)
    }

    /// Select explicit row and column indices.
    pub fn select_indices(&self, rows: &[usize], columns: &[usize]) -> Result<Selection> {
        let (n_rows, n_cols) = self.shape()?;
        let mut rows = rows.to_vec();
        let mut columns = columns.to_vec();
        rows.sort_unstable();
        rows.dedup();
        columns.sort_unstable();
        columns.dedup();
        if rows.last().is_some_and(|&r| r >= n_rows) {
            return Err(LoomError::Shape(format!("row index outside 0..{n_rows}")));
        }
        if columns.last().is_some_and(|&c| c >= n_cols) {
            return Err(LoomError::Shape(format!("column index outside 0..{n_cols}")));
        }

        let matrix = if rows.is_empty() || columns.is_empty() {
            Array2::zeros((rows.len(), columns.len()))
        } else if rows.len() * n_cols <= columns.len() * n_rows {
            debug!(rows = rows.len(), "selecting rows first");
            let blocks = runs(&rows)
                .into_iter()
                .map(|r| self.read_rows(r))
                .collect::<Result<Vec<_>>>()?;
            stack(&blocks, ndarray::Axis(0), (0, n_cols))?.select(ndarray::Axis(1), &columns)
        } else {
            debug!(columns = columns.len(), "selecting columns first");
            let blocks = runs(&columns)
                .into_iter()
                .map(|c| self.read_columns(c))
                .collect::<Result<Vec<_>>>()?;
            stack(&blocks, ndarray::Axis(1), (n_rows, 0))?.select(ndarray::Axis(0), &rows)
        };

        Ok(Selection {
            matrix,
            row_attrs: subset_all(self.row_attrs()?, &rows),
            col_attrs: subset_all(self.col_attrs()?, &columns),
            rows,
            columns,
        })
    }
}
