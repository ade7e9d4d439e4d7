//! The loom matrix container.
//!
//! [`MatrixStore`] owns one `.loom` directory: a chunked `float32` matrix
//! with typed row and column attributes and a persisted schema. All
//! attributes are mirrored in memory for the lifetime of the connection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView1};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use loom_core::{LoomError, Result, Summarizable};

use crate::attribute::{validate_name, AttrType, Attribute, Axis};
use crate::schema::Schema;
use crate::zarr::{self, Store};

/// Root attribute holding the schema JSON.
pub const SCHEMA_KEY: &str = "schema";
const GENERATION_KEY: &str = "generation";
const LAST_MODIFIED_KEY: &str = "last_modified";
const CREATION_DATE_KEY: &str = "creation_date";

/// Columns rewritten per step when permuting rows.
const PERMUTE_COLUMN_CHUNK: usize = 4096;
/// Matrix elements held in memory per step when permuting columns.
const PERMUTE_ELEMENT_BUDGET: usize = 1 << 24;

/// How a container is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

struct Connection {
    store: Store,
    shape: (usize, usize),
    schema: Schema,
    row_attrs: BTreeMap<String, Attribute>,
    col_attrs: BTreeMap<String, Attribute>,
    root_attrs: Map<String, Value>,
}

impl Connection {
    fn attrs(&self, axis: Axis) -> &BTreeMap<String, Attribute> {
        match axis {
            Axis::Row => &self.row_attrs,
            Axis::Column => &self.col_attrs,
        }
    }

    fn attrs_mut(&mut self, axis: Axis) -> &mut BTreeMap<String, Attribute> {
        match axis {
            Axis::Row => &mut self.row_attrs,
            Axis::Column => &mut self.col_attrs,
        }
    }

    fn axis_len(&self, axis: Axis) -> usize {
        match axis {
            Axis::Row => self.shape.0,
            Axis::Column => self.shape.1,
        }
    }

    fn generation(&self) -> u64 {
        self.root_attrs
            .get(GENERATION_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    fn last_modified(&self) -> &str {
        self.root_attrs
            .get(LAST_MODIFIED_KEY)
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Persist the schema and bump the modification marker.
    fn touch(&mut self) -> Result<()> {
        let generation = self.generation() + 1;
        self.root_attrs
            .insert(SCHEMA_KEY.into(), Value::String(self.schema.to_json()?));
        self.root_attrs
            .insert(GENERATION_KEY.into(), Value::from(generation));
        self.root_attrs
            .insert(LAST_MODIFIED_KEY.into(), Value::String(timestamp()));
        zarr::write_group(&self.store, "/", self.root_attrs.clone())
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn attr_node(axis: Axis, name: &str) -> String {
    format!("/{}/{}", axis.group(), name)
}

fn check_range(range: &Range<usize>, len: usize, what: &str) -> Result<()> {
    if range.start > range.end || range.end > len {
        return Err(LoomError::NotFound(format!(
            "{what} {}..{} outside 0..{len}",
            range.start, range.end
        )));
    }
    Ok(())
}

fn check_finite(matrix: &Array2<f32>) -> Result<()> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(LoomError::Schema(
            "matrix values must be finite (no NaN or Inf)".into(),
        ));
    }
    Ok(())
}

/// Validate one axis' attribute dictionary and convert it to the
/// canonical on-create types.
fn prepare_attrs(
    attrs: BTreeMap<String, Attribute>,
    axis: Axis,
    len: usize,
) -> Result<BTreeMap<String, Attribute>> {
    if attrs.is_empty() {
        return Err(LoomError::Schema(format!(
            "at least one {axis} attribute is required"
        )));
    }
    let mut out = BTreeMap::new();
    for (name, values) in attrs {
        validate_name(&name)?;
        if values.len() != len {
            return Err(LoomError::Schema(format!(
                "{axis} attribute '{name}' has {} values, expected {len}",
                values.len()
            )));
        }
        let values = values.normalized();
        if !values.is_finite() {
            return Err(LoomError::Schema(format!(
                "{axis} attribute '{name}' contains non-finite values"
            )));
        }
        out.insert(name, values);
    }
    Ok(out)
}

/// A connection to a `.loom` container.
pub struct MatrixStore {
    path: PathBuf,
    mode: OpenMode,
    conn: Option<Connection>,
}

impl MatrixStore {
    /// Write a new container at `path` and connect to it read-write.
    ///
    /// Numeric attributes are stored as `float64`, everything else as
    /// `string`. An existing container at `path` is replaced.
    pub fn create(
        path: impl AsRef<Path>,
        matrix: &Array2<f32>,
        row_attrs: BTreeMap<String, Attribute>,
        col_attrs: BTreeMap<String, Attribute>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let (n_rows, n_cols) = matrix.dim();
        let row_attrs = prepare_attrs(row_attrs, Axis::Row, n_rows)?;
        let col_attrs = prepare_attrs(col_attrs, Axis::Column, n_cols)?;
        check_finite(matrix)?;

        if path.exists() {
            if !path.is_dir() {
                return Err(LoomError::Format(format!(
                    "{} exists and is not a loom container",
                    path.display()
                )));
            }
            std::fs::remove_dir_all(path).map_err(|e| LoomError::io_at(path, e))?;
        }
        std::fs::create_dir_all(path).map_err(|e| LoomError::io_at(path, e))?;

        let mut schema = Schema::default();
        for (axis, attrs) in [(Axis::Row, &row_attrs), (Axis::Column, &col_attrs)] {
            for (name, values) in attrs {
                schema.axis_mut(axis).insert(name.clone(), values.dtype());
            }
        }

        let store = zarr::open_store(path)?;
        let now = timestamp();
        let mut root = Map::new();
        root.insert(SCHEMA_KEY.into(), Value::String(schema.to_json()?));
        root.insert(GENERATION_KEY.into(), Value::from(0u64));
        root.insert(LAST_MODIFIED_KEY.into(), Value::String(now.clone()));
        root.insert(CREATION_DATE_KEY.into(), Value::String(now));
        zarr::write_group(&store, "/", root)?;
        zarr::write_group(&store, "/row_attrs", Map::new())?;
        zarr::write_group(&store, "/col_attrs", Map::new())?;
        zarr::create_matrix(&store, matrix)?;
        for (axis, attrs) in [(Axis::Row, &row_attrs), (Axis::Column, &col_attrs)] {
            for (name, values) in attrs {
                zarr::write_attribute(&store, &attr_node(axis, name), values)?;
            }
        }
        info!(path = %path.display(), rows = n_rows, cols = n_cols, "created loom file");

        Self::connect(path, OpenMode::ReadWrite)
    }

    /// Open an existing container and mirror its attributes into memory.
    pub fn connect(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(LoomError::NotFound(format!("{}", path.display())));
        }
        if !path.is_dir() {
            return Err(LoomError::Format(format!(
                "{} is not a loom container",
                path.display()
            )));
        }

        let store = zarr::open_store(&path)?;
        let root_attrs = zarr::read_group_attributes(&store, "/")?;
        let shape = zarr::matrix_shape(&store)?;

        let (schema, inferred) = match root_attrs.get(SCHEMA_KEY) {
            Some(Value::String(text)) => (Schema::from_json(text)?, false),
            Some(other) => {
                return Err(LoomError::Format(format!(
                    "schema attribute is not a string: {other}"
                )))
            }
            None => (infer_schema(&path, &store)?, true),
        };

        let mut conn = Connection {
            store,
            shape,
            schema,
            row_attrs: BTreeMap::new(),
            col_attrs: BTreeMap::new(),
            root_attrs,
        };
        for axis in [Axis::Row, Axis::Column] {
            let expected = conn.axis_len(axis);
            let declared: Vec<(String, AttrType)> = conn
                .schema
                .axis(axis)
                .iter()
                .map(|(n, t)| (n.clone(), *t))
                .collect();
            for (name, dtype) in declared {
                let values = zarr::read_attribute(&conn.store, &attr_node(axis, &name), dtype)?;
                if values.len() != expected {
                    return Err(LoomError::Format(format!(
                        "{axis} attribute '{name}' has {} values, matrix has {expected}",
                        values.len()
                    )));
                }
                conn.attrs_mut(axis).insert(name, values);
            }
        }

        if inferred {
            warn!(
                path = %path.display(),
                "no persisted schema; attribute types were inferred"
            );
            if mode == OpenMode::ReadWrite {
                conn.touch()?;
            }
        }
        debug!(path = %path.display(), rows = shape.0, cols = shape.1, ?mode, "connected");

        Ok(Self {
            path,
            mode,
            conn: Some(conn),
        })
    }

    /// Close the connection. Every later call fails with
    /// [`LoomError::Closed`].
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(path = %self.path.display(), "closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| LoomError::Closed(self.path.display().to_string()))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        if self.conn.is_some() && self.mode == OpenMode::ReadOnly {
            return Err(LoomError::ReadOnly(self.path.display().to_string()));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| LoomError::Closed(self.path.display().to_string()))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// `(rows, columns)` of the main matrix.
    pub fn shape(&self) -> Result<(usize, usize)> {
        Ok(self.conn()?.shape)
    }

    pub fn schema(&self) -> Result<&Schema> {
        Ok(&self.conn()?.schema)
    }

    pub fn row_attrs(&self) -> Result<&BTreeMap<String, Attribute>> {
        Ok(&self.conn()?.row_attrs)
    }

    pub fn col_attrs(&self) -> Result<&BTreeMap<String, Attribute>> {
        Ok(&self.conn()?.col_attrs)
    }

    /// Attributes aligned to `axis`.
    pub fn attrs(&self, axis: Axis) -> Result<&BTreeMap<String, Attribute>> {
        Ok(self.conn()?.attrs(axis))
    }

    /// One attribute by name.
    pub fn attr(&self, axis: Axis, name: &str) -> Result<&Attribute> {
        self.conn()?
            .attrs(axis)
            .get(name)
            .ok_or_else(|| LoomError::NotFound(format!("{axis} attribute '{name}'")))
    }

    /// Opaque token that changes on every mutation of the container.
    ///
    /// Derived caches compare it against the value they were built from.
    pub fn modification_marker(&self) -> Result<String> {
        let conn = self.conn()?;
        Ok(format!("{}@{}", conn.generation(), conn.last_modified()))
    }

    /// The modification marker of the container at `path`, read from its
    /// root attributes without connecting.
    pub fn read_modification_marker(path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(LoomError::NotFound(format!("{}", path.display())));
        }
        let store = zarr::open_store(path)?;
        let root_attrs = zarr::read_group_attributes(&store, "/")?;
        let generation = root_attrs
            .get(GENERATION_KEY)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let last_modified = root_attrs
            .get(LAST_MODIFIED_KEY)
            .and_then(Value::as_str)
            .unwrap_or("");
        Ok(format!("{generation}@{last_modified}"))
    }

    /// RFC 3339 time of the last mutation.
    pub fn last_modified(&self) -> Result<String> {
        Ok(self.conn()?.last_modified().to_string())
    }

    // -----------------------------------------------------------------------
    // File metadata
    // -----------------------------------------------------------------------

    /// A file-level metadata entry such as `title` or `doi`.
    pub fn metadata(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn()?.root_attrs.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
    }

    /// Set a file-level metadata entry. Internal keys are protected.
    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || [SCHEMA_KEY, GENERATION_KEY, LAST_MODIFIED_KEY].contains(&key) {
            return Err(LoomError::Schema(format!(
                "'{key}' is reserved and cannot be set as metadata"
            )));
        }
        let conn = self.conn_mut()?;
        conn.root_attrs
            .insert(key.to_string(), Value::String(value.to_string()));
        conn.touch()
    }

    // -----------------------------------------------------------------------
    // Matrix reads
    // -----------------------------------------------------------------------

    /// Read the block `matrix[rows, cols]`.
    pub fn read_region(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Array2<f32>> {
        let conn = self.conn()?;
        check_range(&rows, conn.shape.0, "rows")?;
        check_range(&cols, conn.shape.1, "columns")?;
        zarr::read_matrix(&conn.store, rows, cols)
    }

    /// Read whole rows.
    pub fn read_rows(&self, rows: Range<usize>) -> Result<Array2<f32>> {
        let n_cols = self.shape()?.1;
        self.read_region(rows, 0..n_cols)
    }

    /// Read whole columns.
    pub fn read_columns(&self, cols: Range<usize>) -> Result<Array2<f32>> {
        let n_rows = self.shape()?.0;
        self.read_region(0..n_rows, cols)
    }

    /// The values of row `i`.
    pub fn row(&self, i: usize) -> Result<Vec<f32>> {
        Ok(self.read_rows(i..i + 1)?.into_iter().collect())
    }

    /// The values of column `j`.
    pub fn column(&self, j: usize) -> Result<Vec<f32>> {
        Ok(self.read_columns(j..j + 1)?.into_iter().collect())
    }

    /// Apply `f` to every row, reading `chunk` rows at a time.
    pub fn map_rows<T, F>(&self, chunk: usize, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(ArrayView1<'_, f32>) -> T,
    {
        let (n_rows, _) = self.shape()?;
        let chunk = chunk.max(1);
        let mut out = Vec::with_capacity(n_rows);
        let mut start = 0;
        while start < n_rows {
            let end = (start + chunk).min(n_rows);
            let block = self.read_rows(start..end)?;
            out.extend(block.rows().into_iter().map(&mut f));
            start = end;
        }
        Ok(out)
    }

    /// Apply `f` to every column, reading `chunk` columns at a time.
    pub fn map_columns<T, F>(&self, chunk: usize, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(ArrayView1<'_, f32>) -> T,
    {
        let (_, n_cols) = self.shape()?;
        let chunk = chunk.max(1);
        let mut out = Vec::with_capacity(n_cols);
        let mut start = 0;
        while start < n_cols {
            let end = (start + chunk).min(n_cols);
            let block = self.read_columns(start..end)?;
            out.extend(block.columns().into_iter().map(&mut f));
            start = end;
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Append columns. `col_attrs` must name exactly the existing column
    /// attributes, each with one value per new column.
    pub fn add_columns(
        &mut self,
        submatrix: &Array2<f32>,
        col_attrs: BTreeMap<String, Attribute>,
    ) -> Result<()> {
        let conn = self.conn_mut()?;
        let (n_rows, n_cols) = conn.shape;
        let (sub_rows, added) = submatrix.dim();
        if sub_rows != n_rows {
            return Err(LoomError::Shape(format!(
                "submatrix has {sub_rows} rows, file has {n_rows}"
            )));
        }
        let existing: BTreeSet<&String> = conn.col_attrs.keys().collect();
        let supplied: BTreeSet<&String> = col_attrs.keys().collect();
        if existing != supplied {
            let missing: Vec<_> = existing.difference(&supplied).collect();
            let extra: Vec<_> = supplied.difference(&existing).collect();
            return Err(LoomError::Schema(format!(
                "column attributes must match exactly (missing {missing:?}, unexpected {extra:?})"
            )));
        }
        let mut tails = BTreeMap::new();
        for (name, values) in col_attrs {
            if values.len() != added {
                return Err(LoomError::Schema(format!(
                    "column attribute '{name}' has {} values, expected {added}",
                    values.len()
                )));
            }
            let dtype = conn
                .schema
                .dtype(Axis::Column, &name)
                .unwrap_or(AttrType::String);
            let values = values.cast(dtype)?;
            if !values.is_finite() {
                return Err(LoomError::Schema(format!(
                    "column attribute '{name}' contains non-finite values"
                )));
            }
            tails.insert(name, values);
        }
        check_finite(submatrix)?;
        if added == 0 {
            return Ok(());
        }

        zarr::resize_matrix(&conn.store, n_rows, n_cols + added)?;
        zarr::write_matrix(&conn.store, 0, n_cols, submatrix)?;
        for (name, tail) in &tails {
            zarr::append_attribute(&conn.store, &attr_node(Axis::Column, name), n_cols, tail)?;
            if let Some(current) = conn.col_attrs.get_mut(name) {
                current.extend(tail)?;
            }
        }
        conn.shape = (n_rows, n_cols + added);
        conn.touch()?;
        info!(path = %self.path.display(), added, total = n_cols + added, "appended columns");
        Ok(())
    }

    /// Append every column of another container with the same rows and
    /// the same column attributes.
    pub fn add_loom(&mut self, other: impl AsRef<Path>) -> Result<()> {
        let other = MatrixStore::connect(other, OpenMode::ReadOnly)?;
        let (n_rows, _) = self.shape()?;
        let (other_rows, other_cols) = other.shape()?;
        if other_rows != n_rows {
            return Err(LoomError::Shape(format!(
                "{} has {other_rows} rows, this file has {n_rows}",
                other.path().display()
            )));
        }
        let mine: BTreeSet<&String> = self.col_attrs()?.keys().collect();
        let theirs: BTreeSet<&String> = other.col_attrs()?.keys().collect();
        if mine != theirs {
            return Err(LoomError::Schema(format!(
                "{} has a different set of column attributes",
                other.path().display()
            )));
        }
        let mut start = 0;
        while start < other_cols {
            let end = (start + PERMUTE_COLUMN_CHUNK).min(other_cols);
            let block = other.read_columns(start..end)?;
            let idx: Vec<usize> = (start..end).collect();
            let attrs = other
                .col_attrs()?
                .iter()
                .map(|(k, v)| (k.clone(), v.subset(&idx)))
                .collect();
            self.add_columns(&block, attrs)?;
            start = end;
        }
        Ok(())
    }

    /// Create or overwrite an attribute. `dtype` defaults to the type of
    /// `values`.
    pub fn set_attr(
        &mut self,
        name: &str,
        values: Attribute,
        axis: Axis,
        dtype: Option<AttrType>,
    ) -> Result<()> {
        validate_name(name)?;
        let root = self.path.clone();
        let conn = self.conn_mut()?;
        let expected = conn.axis_len(axis);
        if values.len() != expected {
            return Err(LoomError::Schema(format!(
                "{axis} attribute '{name}' has {} values, expected {expected}",
                values.len()
            )));
        }
        let dtype = dtype.unwrap_or_else(|| values.dtype());
        let values = values.cast(dtype)?;
        if !values.is_finite() {
            return Err(LoomError::Schema(format!(
                "{axis} attribute '{name}' contains non-finite values"
            )));
        }

        if conn.attrs(axis).contains_key(name) {
            replace_attribute(&root, &conn.store, axis, name, &values)?;
        } else {
            zarr::write_attribute(&conn.store, &attr_node(axis, name), &values)?;
        }
        conn.schema.axis_mut(axis).insert(name.to_string(), dtype);
        conn.attrs_mut(axis).insert(name.to_string(), values);
        conn.touch()?;
        debug!(name, %axis, %dtype, "set attribute");
        Ok(())
    }

    /// Derive attribute `name` by mapping the text of `from_attr` through
    /// `mapping`. Unmapped values keep their own text, or take `default`.
    pub fn set_attr_by_mapping(
        &mut self,
        name: &str,
        from_attr: &str,
        mapping: &HashMap<String, String>,
        dtype: Option<AttrType>,
        axis: Axis,
        default: Option<&str>,
    ) -> Result<()> {
        let source = self.attr(axis, from_attr)?;
        let mapped: Vec<String> = (0..source.len())
            .filter_map(|i| source.value_string(i))
            .map(|v| match mapping.get(&v) {
                Some(target) => target.clone(),
                None => default.map(str::to_string).unwrap_or(v),
            })
            .collect();
        let values = match dtype {
            Some(_) => Attribute::String(mapped),
            None => Attribute::infer(mapped),
        };
        self.set_attr(name, values, axis, dtype)
    }

    /// Permanently delete an attribute.
    pub fn delete_attr(&mut self, name: &str, axis: Axis) -> Result<()> {
        let root = self.path.clone();
        let conn = self.conn_mut()?;
        if !conn.attrs(axis).contains_key(name) {
            return Err(LoomError::NotFound(format!("{axis} attribute '{name}'")));
        }
        if conn.attrs(axis).len() == 1 {
            return Err(LoomError::Schema(format!(
                "cannot delete '{name}', the last {axis} attribute"
            )));
        }
        remove_node(&root, &attr_node(axis, name))?;
        conn.attrs_mut(axis).remove(name);
        conn.schema.axis_mut(axis).remove(name);
        conn.touch()?;
        debug!(name, %axis, "deleted attribute");
        Ok(())
    }

    /// Reorder rows or columns, together with every attribute on that
    /// axis. `ordering[i]` is the old index of the new element `i`.
    pub fn permute(&mut self, ordering: &[usize], axis: Axis) -> Result<()> {
        let root = self.path.clone();
        let conn = self.conn_mut()?;
        let len = conn.axis_len(axis);
        if ordering.len() != len {
            return Err(LoomError::Shape(format!(
                "ordering has {} entries, {axis} axis has {len}",
                ordering.len()
            )));
        }
        let mut seen = vec![false; len];
        for &i in ordering {
            if i >= len || std::mem::replace(&mut seen[i], true) {
                return Err(LoomError::Shape(format!(
                    "ordering is not a permutation of 0..{len}"
                )));
            }
        }

        let (n_rows, n_cols) = conn.shape;
        match axis {
            Axis::Row => {
                let mut start = 0;
                while start < n_cols {
                    let end = (start + PERMUTE_COLUMN_CHUNK).min(n_cols);
                    let block = zarr::read_matrix(&conn.store, 0..n_rows, start..end)?;
                    let permuted = block.select(ndarray::Axis(0), ordering);
                    zarr::write_matrix(&conn.store, 0, start, &permuted)?;
                    start = end;
                }
            }
            Axis::Column => {
                let chunk = (PERMUTE_ELEMENT_BUDGET / n_cols.max(1)).max(1);
                let mut start = 0;
                while start < n_rows {
                    let end = (start + chunk).min(n_rows);
                    let block = zarr::read_matrix(&conn.store, start..end, 0..n_cols)?;
                    let permuted = block.select(ndarray::Axis(1), ordering);
                    zarr::write_matrix(&conn.store, start, 0, &permuted)?;
                    start = end;
                }
            }
        }

        let names: Vec<String> = conn.attrs(axis).keys().cloned().collect();
        for name in names {
            let reordered = match conn.attrs(axis).get(&name) {
                Some(values) => values.subset(ordering),
                None => continue,
            };
            replace_attribute(&root, &conn.store, axis, &name, &reordered)?;
            conn.attrs_mut(axis).insert(name, reordered);
        }
        conn.touch()?;
        info!(path = %self.path.display(), %axis, "permuted");
        Ok(())
    }

    /// Add `_LogMean`, `_LogCV` and `_Total` attributes on both axes.
    pub fn compute_stats(&mut self) -> Result<()> {
        let row_stats = self.map_rows(crate::zarr::MATRIX_CHUNK as usize, axis_stats)?;
        let col_stats = self.map_columns(crate::zarr::MATRIX_CHUNK as usize, axis_stats)?;
        for (axis, stats) in [(Axis::Row, row_stats), (Axis::Column, col_stats)] {
            let log_mean = stats.iter().map(|s| finite_or_zero(s.mean.log2())).collect();
            let log_cv = stats
                .iter()
                .map(|s| finite_or_zero((s.std / s.mean).log2()))
                .collect();
            let total = stats.iter().map(|s| s.sum).collect();
            self.set_attr("_LogMean", Attribute::Float64(log_mean), axis, None)?;
            self.set_attr("_LogCV", Attribute::Float64(log_cv), axis, None)?;
            self.set_attr("_Total", Attribute::Float64(total), axis, None)?;
        }
        Ok(())
    }
}

struct Stats {
    mean: f64,
    std: f64,
    sum: f64,
}

fn axis_stats(values: ArrayView1<'_, f32>) -> Stats {
    let n = values.len() as f64;
    let sum: f64 = values.iter().map(|&v| v as f64).sum();
    let mean = sum / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    Stats {
        mean,
        std: var.sqrt(),
        sum,
    }
}

fn finite_or_zero(x: f64) -> f64 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

fn remove_node(root: &Path, node: &str) -> Result<()> {
    remove_dir(&root.join(node.trim_start_matches('/')))
}

fn remove_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        std::fs::remove_dir_all(dir).map_err(|e| LoomError::io_at(dir, e))?;
    }
    Ok(())
}

/// Overwrite an existing attribute array. The new array is written under a
/// hidden staging node and only swapped in once it is complete, so a failed
/// write leaves the old array in place.
fn replace_attribute(
    root: &Path,
    store: &Store,
    axis: Axis,
    name: &str,
    values: &Attribute,
) -> Result<()> {
    let group = root.join(axis.group());
    let target = group.join(name);
    let staged = group.join(format!(".{name}.staging"));
    let retired = group.join(format!(".{name}.retired"));
    remove_dir(&staged)?;
    remove_dir(&retired)?;

    zarr::write_attribute(store, &format!("/{}/.{name}.staging", axis.group()), values)?;
    std::fs::rename(&target, &retired).map_err(|e| LoomError::io_at(&target, e))?;
    if let Err(e) = std::fs::rename(&staged, &target) {
        if let Err(restore) = std::fs::rename(&retired, &target) {
            warn!(path = %target.display(), error = %restore, "could not restore attribute");
        }
        return Err(LoomError::io_at(&target, e));
    }
    remove_dir(&retired)
}

/// Build a schema for a container written without one.
fn infer_schema(path: &Path, store: &Store) -> Result<Schema> {
    let mut schema = Schema::default();
    for axis in [Axis::Row, Axis::Column] {
        for name in zarr::list_attributes(&path.join(axis.group()))? {
            let dtype = zarr::infer_attr_type(store, &attr_node(axis, &name))?;
            schema.axis_mut(axis).insert(name, dtype);
        }
    }
    Ok(schema)
}

impl Summarizable for MatrixStore {
    fn summary(&self) -> String {
        match &self.conn {
            Some(conn) => format!(
                "MatrixStore: {} rows \u{00d7} {} columns, {} row attrs, {} col attrs ({})",
                conn.shape.0,
                conn.shape.1,
                conn.row_attrs.len(),
                conn.col_attrs.len(),
                self.path.display()
            ),
            None => format!("MatrixStore: closed ({})", self.path.display()),
        }
    }
}

impl std::fmt::Debug for MatrixStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;

    pub(crate) fn attrs(pairs: &[(&str, Attribute)]) -> BTreeMap<String, Attribute> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// The 3×4 example matrix with `Gene` and `Cell` attributes.
    pub(crate) fn example(dir: &Path) -> MatrixStore {
        let m = array![
            [1.0f32, 2.0, 3.0, 4.0],
            [5.0, 6.0, 7.0, 8.0],
            [9.0, 10.0, 11.0, 12.0]
        ];
        MatrixStore::create(
            dir.join("example.loom"),
            &m,
            attrs(&[("Gene", Attribute::from(vec!["A", "B", "C"]))]),
            attrs(&[("Cell", Attribute::from(vec!["c1", "c2", "c3", "c4"]))]),
        )
        .unwrap()
    }

    #[test]
    fn create_then_connect_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rt.loom");
        let m = array![[1.5f32, 0.0], [-2.0, 3.25], [7.0, 8.0]];
        let store = MatrixStore::create(
            &path,
            &m,
            attrs(&[
                ("Gene", Attribute::from(vec!["x", "y", "z"])),
                ("Length", Attribute::Int(vec![10, 20, 30])),
            ]),
            attrs(&[("Total", Attribute::from(vec!["1.5", "2"]))]),
        )
        .unwrap();
        drop(store);

        let store = MatrixStore::connect(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(store.shape().unwrap(), (3, 2));
        assert_eq!(store.read_rows(0..3).unwrap(), m);
        assert_eq!(
            store.attr(Axis::Row, "Gene").unwrap(),
            &Attribute::from(vec!["x", "y", "z"])
        );
        assert_eq!(
            store.attr(Axis::Row, "Length").unwrap(),
            &Attribute::Float64(vec![10.0, 20.0, 30.0])
        );
        assert_eq!(
            store.attr(Axis::Column, "Total").unwrap(),
            &Attribute::Float64(vec![1.5, 2.0])
        );
        assert_eq!(
            store.schema().unwrap().dtype(Axis::Row, "Gene"),
            Some(AttrType::String)
        );
    }

    #[test]
    fn create_requires_attributes_on_both_axes() {
        let dir = tempfile::tempdir().unwrap();
        let m = Array2::<f32>::zeros((2, 2));
        let err = MatrixStore::create(
            dir.path().join("a.loom"),
            &m,
            BTreeMap::new(),
            attrs(&[("Cell", Attribute::from(vec!["a", "b"]))]),
        )
        .unwrap_err();
        assert!(matches!(err, LoomError::Schema(_)));
    }

    #[test]
    fn create_rejects_length_mismatch_and_nan() {
        let dir = tempfile::tempdir().unwrap();
        let m = Array2::<f32>::zeros((2, 2));
        let err = MatrixStore::create(
            dir.path().join("a.loom"),
            &m,
            attrs(&[("Gene", Attribute::from(vec!["a"]))]),
            attrs(&[("Cell", Attribute::from(vec!["a", "b"]))]),
        )
        .unwrap_err();
        assert!(matches!(err, LoomError::Schema(_)));

        let mut bad = m.clone();
        bad[[0, 0]] = f32::NAN;
        let err = MatrixStore::create(
            dir.path().join("b.loom"),
            &bad,
            attrs(&[("Gene", Attribute::from(vec!["a", "b"]))]),
            attrs(&[("Cell", Attribute::from(vec!["a", "b"]))]),
        )
        .unwrap_err();
        assert!(matches!(err, LoomError::Schema(_)));
        assert!(!dir.path().join("b.loom").exists());
    }

    #[test]
    fn connect_missing_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let err = MatrixStore::connect(dir.path().join("nope.loom"), OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, LoomError::NotFound(_)));

        let file = dir.path().join("plain.loom");
        std::fs::write(&file, b"not a container").unwrap();
        let err = MatrixStore::connect(&file, OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, LoomError::Format(_)));

        let empty = dir.path().join("empty.loom");
        std::fs::create_dir(&empty).unwrap();
        let err = MatrixStore::connect(&empty, OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, LoomError::Format(_)));
    }

    #[test]
    fn append_extends_matrix_and_column_attrs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let before = store.modification_marker().unwrap();
        store
            .add_columns(
                &array![[13.0f32], [14.0], [15.0]],
                attrs(&[("Cell", Attribute::from(vec!["c5"]))]),
            )
            .unwrap();
        assert_ne!(store.modification_marker().unwrap(), before);

        let path = store.path().to_path_buf();
        store.close();
        let store = MatrixStore::connect(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(store.shape().unwrap(), (3, 5));
        assert_eq!(store.column(4).unwrap(), vec![13.0, 14.0, 15.0]);
        assert_eq!(store.row(0).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 13.0]);
        assert_eq!(
            store.attr(Axis::Column, "Cell").unwrap(),
            &Attribute::from(vec!["c1", "c2", "c3", "c4", "c5"])
        );
        assert_eq!(
            store.attr(Axis::Row, "Gene").unwrap(),
            &Attribute::from(vec!["A", "B", "C"])
        );
    }

    #[test]
    fn append_wrong_rows_leaves_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let err = store
            .add_columns(
                &array![[1.0f32], [2.0]],
                attrs(&[("Cell", Attribute::from(vec!["c5"]))]),
            )
            .unwrap_err();
        assert!(matches!(err, LoomError::Shape(_)));
        let store = MatrixStore::connect(store.path(), OpenMode::ReadOnly).unwrap();
        assert_eq!(store.shape().unwrap(), (3, 4));
    }

    #[test]
    fn append_requires_exact_attribute_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let col = array![[1.0f32], [2.0], [3.0]];
        let err = store.add_columns(&col, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, LoomError::Schema(_)));
        let err = store
            .add_columns(
                &col,
                attrs(&[
                    ("Cell", Attribute::from(vec!["c5"])),
                    ("Extra", Attribute::from(vec!["e"])),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, LoomError::Schema(_)));
        assert_eq!(store.shape().unwrap(), (3, 4));
    }

    #[test]
    fn closed_connection_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        store.close();
        assert!(store.is_closed());
        assert!(matches!(store.shape(), Err(LoomError::Closed(_))));
        assert!(matches!(store.row(0), Err(LoomError::Closed(_))));
        let err = store
            .set_attr("X", Attribute::from(vec!["a", "b", "c"]), Axis::Row, None)
            .unwrap_err();
        assert!(matches!(err, LoomError::Closed(_)));
    }

    #[test]
    fn read_only_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = example(dir.path()).path().to_path_buf();
        let mut store = MatrixStore::connect(&path, OpenMode::ReadOnly).unwrap();
        let err = store.set_metadata("title", "x").unwrap_err();
        assert!(matches!(err, LoomError::ReadOnly(_)));
    }

    #[test]
    fn set_attr_validates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let err = store
            .set_attr("Score", Attribute::Float64(vec![1.0, 2.0]), Axis::Row, None)
            .unwrap_err();
        assert!(matches!(err, LoomError::Schema(_)));
        let err = store
            .set_attr(
                "Score",
                Attribute::Float64(vec![1.0, f64::INFINITY, 2.0]),
                Axis::Row,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, LoomError::Schema(_)));

        store
            .set_attr(
                "Score",
                Attribute::Float64(vec![1.0, 2.0, 3.0]),
                Axis::Row,
                Some(AttrType::Int),
            )
            .unwrap();
        store
            .set_attr("Score", Attribute::Int(vec![4, 5, 6]), Axis::Row, None)
            .unwrap();
        let store = MatrixStore::connect(store.path(), OpenMode::ReadOnly).unwrap();
        assert_eq!(
            store.attr(Axis::Row, "Score").unwrap(),
            &Attribute::Int(vec![4, 5, 6])
        );
        assert_eq!(store.schema().unwrap().dtype(Axis::Row, "Score"), Some(AttrType::Int));
    }

    #[test]
    fn failed_overwrite_keeps_old_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let group = store.path().join("row_attrs");
        // A plain file where the staging array would go makes the write fail.
        std::fs::write(group.join(".Gene.staging"), b"").unwrap();
        let err = store.set_attr("Gene", Attribute::from(vec!["x", "y", "z"]), Axis::Row, None);
        assert!(err.is_err());
        assert_eq!(
            store.attr(Axis::Row, "Gene").unwrap(),
            &Attribute::from(vec!["A", "B", "C"])
        );
        let reopened = MatrixStore::connect(store.path(), OpenMode::ReadOnly).unwrap();
        assert_eq!(
            reopened.attr(Axis::Row, "Gene").unwrap(),
            &Attribute::from(vec!["A", "B", "C"])
        );
        drop(reopened);

        std::fs::remove_file(group.join(".Gene.staging")).unwrap();
        store
            .set_attr("Gene", Attribute::from(vec!["x", "y", "z"]), Axis::Row, None)
            .unwrap();
        assert!(!group.join(".Gene.staging").exists());
        assert!(!group.join(".Gene.retired").exists());
        let reopened = MatrixStore::connect(store.path(), OpenMode::ReadOnly).unwrap();
        assert_eq!(
            reopened.attr(Axis::Row, "Gene").unwrap(),
            &Attribute::from(vec!["x", "y", "z"])
        );
    }

    #[test]
    fn delete_attr_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        assert!(matches!(
            store.delete_attr("Nope", Axis::Row),
            Err(LoomError::NotFound(_))
        ));
        assert!(matches!(
            store.delete_attr("Gene", Axis::Row),
            Err(LoomError::Schema(_))
        ));
        store
            .set_attr("Chrom", Attribute::from(vec!["1", "1", "X"]), Axis::Row, None)
            .unwrap();
        store.delete_attr("Gene", Axis::Row).unwrap();
        let store = MatrixStore::connect(store.path(), OpenMode::ReadOnly).unwrap();
        assert!(store.attr(Axis::Row, "Gene").is_err());
        assert_eq!(store.row_attrs().unwrap().len(), 1);
    }

    #[test]
    fn mapping_attribute() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let mapping: HashMap<String, String> =
            [("A".to_string(), "alpha".to_string())].into_iter().collect();
        store
            .set_attr_by_mapping("Name", "Gene", &mapping, None, Axis::Row, None)
            .unwrap();
        assert_eq!(
            store.attr(Axis::Row, "Name").unwrap(),
            &Attribute::from(vec!["alpha", "B", "C"])
        );
        store
            .set_attr_by_mapping("Name", "Gene", &mapping, None, Axis::Row, Some("?"))
            .unwrap();
        assert_eq!(
            store.attr(Axis::Row, "Name").unwrap(),
            &Attribute::from(vec!["alpha", "?", "?"])
        );
    }

    #[test]
    fn permute_rows_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        store.permute(&[2, 0, 1], Axis::Row).unwrap();
        assert_eq!(store.row(0).unwrap(), vec![9.0, 10.0, 11.0, 12.0]);
        assert_eq!(
            store.attr(Axis::Row, "Gene").unwrap(),
            &Attribute::from(vec!["C", "A", "B"])
        );
        store.permute(&[3, 2, 1, 0], Axis::Column).unwrap();
        assert_eq!(store.row(1).unwrap(), vec![4.0, 3.0, 2.0, 1.0]);
        assert!(matches!(
            store.permute(&[0, 0, 1], Axis::Row),
            Err(LoomError::Shape(_))
        ));
        assert!(matches!(
            store.permute(&[0, 1], Axis::Row),
            Err(LoomError::Shape(_))
        ));
    }

    #[test]
    fn add_loom_appends_all_columns() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let other = MatrixStore::create(
            dir.path().join("other.loom"),
            &array![[0.5f32, 0.25], [1.5, 1.25], [2.5, 2.25]],
            attrs(&[("Gene", Attribute::from(vec!["A", "B", "C"]))]),
            attrs(&[("Cell", Attribute::from(vec!["d1", "d2"]))]),
        )
        .unwrap();
        let other_path = other.path().to_path_buf();
        drop(other);
        store.add_loom(&other_path).unwrap();
        assert_eq!(store.shape().unwrap(), (3, 6));
        assert_eq!(store.column(5).unwrap(), vec![0.25, 1.25, 2.25]);
    }

    #[test]
    fn stats_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        store.compute_stats().unwrap();
        let total = store.attr(Axis::Row, "_Total").unwrap().to_f64().unwrap();
        assert_eq!(total, vec![10.0, 26.0, 42.0]);
        let mean = store.attr(Axis::Column, "_LogMean").unwrap().to_f64().unwrap();
        assert!((mean[0] - 5.0f64.log2()).abs() < 1e-12);
        assert!(store.attr(Axis::Row, "_LogCV").is_ok());
    }

    #[test]
    fn map_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = example(dir.path());
        let sums = store.map_rows(2, |r| r.sum()).unwrap();
        assert_eq!(sums, vec![10.0, 26.0, 42.0]);
        let maxes = store
            .map_columns(3, |c| c.iter().cloned().fold(f32::MIN, f32::max))
            .unwrap();
        assert_eq!(maxes, vec![9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn out_of_bounds_read_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = example(dir.path());
        assert!(matches!(store.row(3), Err(LoomError::NotFound(_))));
        assert!(matches!(
            store.read_region(0..1, 2..9),
            Err(LoomError::NotFound(_))
        ));
    }

    #[test]
    fn marker_readable_without_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        let before = MatrixStore::read_modification_marker(store.path()).unwrap();
        assert_eq!(before, store.modification_marker().unwrap());
        store.set_metadata("title", "t").unwrap();
        let after = MatrixStore::read_modification_marker(store.path()).unwrap();
        assert_ne!(before, after);
        assert_eq!(after, store.modification_marker().unwrap());
        assert!(matches!(
            MatrixStore::read_modification_marker(dir.path().join("none.loom")),
            Err(LoomError::NotFound(_))
        ));
    }

    #[test]
    fn file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        store.set_metadata("title", "Mouse brain").unwrap();
        assert!(matches!(
            store.set_metadata("schema", "{}"),
            Err(LoomError::Schema(_))
        ));
        let store = MatrixStore::connect(store.path(), OpenMode::ReadOnly).unwrap();
        assert_eq!(store.metadata("title").unwrap().as_deref(), Some("Mouse brain"));
        assert!(store.metadata("creation_date").unwrap().is_some());
        assert!(store.summary().starts_with("MatrixStore: 3 rows"));
    }

    #[test]
    fn legacy_file_without_schema_is_inferred() {
        let dir = tempfile::tempdir().unwrap();
        let path = example(dir.path()).path().to_path_buf();
        let store = zarr::open_store(&path).unwrap();
        let mut root = zarr::read_group_attributes(&store, "/").unwrap();
        root.remove(SCHEMA_KEY);
        zarr::write_group(&store, "/", root).unwrap();

        let conn = MatrixStore::connect(&path, OpenMode::ReadWrite).unwrap();
        assert_eq!(
            conn.schema().unwrap().dtype(Axis::Row, "Gene"),
            Some(AttrType::String)
        );
        let root = zarr::read_group_attributes(&store, "/").unwrap();
        assert!(root.contains_key(SCHEMA_KEY));
    }
}
