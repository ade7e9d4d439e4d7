//! Gzipped JSON snapshots of a loom file.
//!
//! [`ExpansionCache`] extracts four facets of a dataset and stores each
//! one next to the file so later requests skip the container entirely:
//!
//! ```text
//! <file>.file_md.json.gzip   global metadata
//! <file>.attrs.json.gzip     all attributes, through metadata_array
//! <file>.rows/NNNNNN.json.gzip
//! <file>.cols/NNNNNN.json.gzip
//! <file>.expanded            marker of the matrix the facets came from
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use loom_core::compress::{load_gzipped_json_string, save_gzipped_json};
use loom_core::{LoomError, Result};
use loom_store::{Axis, MatrixStore};
use loom_tiles::ZoomRange;

use crate::metadata::{matrix_metadata, metadata_array, MetadataArray};

/// Rows or columns read per step during a full expansion.
pub const DEFAULT_EXPANSION_CHUNK: usize = 64;

/// Locations of the expansion files of one loom file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarPaths {
    file: PathBuf,
}

impl SidecarPaths {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self { file: file.into() }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = self.file.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn metadata(&self) -> PathBuf {
        self.with_suffix(".file_md.json.gzip")
    }

    pub fn attributes(&self) -> PathBuf {
        self.with_suffix(".attrs.json.gzip")
    }

    pub fn stamp(&self) -> PathBuf {
        self.with_suffix(".expanded")
    }

    pub fn axis_dir(&self, axis: Axis) -> PathBuf {
        match axis {
            Axis::Row => self.with_suffix(".rows"),
            Axis::Column => self.with_suffix(".cols"),
        }
    }

    pub fn entry(&self, axis: Axis, index: usize) -> PathBuf {
        self.axis_dir(axis).join(format!("{index:06}.json.gzip"))
    }
}

/// Global metadata of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub project: String,
    pub filename: String,
    pub dataset: String,
    pub title: String,
    pub description: String,
    pub url: String,
    pub doi: String,
    pub creation_date: String,
    pub last_modified: String,
    pub total_cells: usize,
    pub total_genes: usize,
}

/// Every attribute of a dataset, with the deep-zoom geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttributes {
    pub project: String,
    pub filename: String,
    pub dataset: String,
    pub shape: [usize; 2],
    pub zoom_range: [i32; 3],
    pub full_zoom_height: u64,
    pub full_zoom_width: u64,
    pub row_attrs: BTreeMap<String, MetadataArray>,
    pub col_attrs: BTreeMap<String, MetadataArray>,
}

/// One expanded row or column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisEntry {
    pub idx: usize,
    pub data: MetadataArray,
}

/// Join already-serialized JSON values into a JSON array.
pub fn json_array<I>(items: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut out = String::from("[");
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(item.as_ref());
    }
    out.push(']');
    out
}

/// `2024/01/31 12:00:00` from an RFC 3339 timestamp; other text is kept.
fn display_time(rfc3339: &str) -> String {
    DateTime::parse_from_rfc3339(rfc3339)
        .map(|t| t.format("%Y/%m/%d %H:%M:%S").to_string())
        .unwrap_or_else(|_| rfc3339.to_string())
}

fn remove_file(path: &Path) -> Result<()> {
    if path.is_file() {
        debug!(path = %path.display(), "removing expansion file");
        fs::remove_file(path).map_err(|e| LoomError::io_at(path, e))?;
    }
    Ok(())
}

/// Extracts and caches JSON facets of one open loom file.
pub struct ExpansionCache<'a> {
    store: &'a MatrixStore,
    project: String,
    filename: String,
    paths: SidecarPaths,
    marker: String,
    chunk: usize,
}

impl<'a> ExpansionCache<'a> {
    /// Wrap `store`, discarding facets built from an older version of it.
    pub fn new(
        store: &'a MatrixStore,
        project: impl Into<String>,
        filename: impl Into<String>,
    ) -> Result<Self> {
        let cache = Self {
            store,
            project: project.into(),
            filename: filename.into(),
            paths: SidecarPaths::new(store.path()),
            marker: store.modification_marker()?,
            chunk: DEFAULT_EXPANSION_CHUNK,
        };
        let stamp = cache.paths.stamp();
        let current = fs::read_to_string(&stamp).ok();
        if current.as_deref().map(str::trim) != Some(cache.marker.as_str()) {
            if current.is_some() {
                info!(path = %store.path().display(), "matrix changed, clearing expansion cache");
            }
            cache.clear_all()?;
            fs::write(&stamp, &cache.marker).map_err(|e| LoomError::io_at(&stamp, e))?;
        }
        Ok(cache)
    }

    /// Whether the facets next to `file` were built from its current
    /// contents. Reads only the stamp and the container's root attributes.
    pub fn is_current(file: &Path) -> Result<bool> {
        let marker = MatrixStore::read_modification_marker(file)?;
        let stamp = fs::read_to_string(SidecarPaths::new(file).stamp()).ok();
        Ok(stamp.as_deref().map(str::trim) == Some(marker.as_str()))
    }

    /// Modification marker of the matrix the facets describe.
    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub fn paths(&self) -> &SidecarPaths {
        &self.paths
    }

    /// Remove every facet.
    pub fn clear_all(&self) -> Result<()> {
        self.clear_metadata()?;
        self.clear_attributes()?;
        self.clear_rows()?;
        self.clear_columns()
    }

    pub fn clear_metadata(&self) -> Result<()> {
        remove_file(&self.paths.metadata())
    }

    pub fn clear_attributes(&self) -> Result<()> {
        remove_file(&self.paths.attributes())
    }

    pub fn clear_rows(&self) -> Result<()> {
        self.clear_axis(Axis::Row)
    }

    pub fn clear_columns(&self) -> Result<()> {
        self.clear_axis(Axis::Column)
    }

    fn clear_axis(&self, axis: Axis) -> Result<()> {
        let dir = self.paths.axis_dir(axis);
        if dir.is_dir() {
            debug!(dir = %dir.display(), "removing expanded {axis}s");
            fs::remove_dir_all(&dir).map_err(|e| LoomError::io_at(&dir, e))?;
        }
        Ok(())
    }

    /// JSON of the global metadata, from cache unless `truncate` is set.
    pub fn metadata(&self, truncate: bool) -> Result<String> {
        let path = self.paths.metadata();
        if truncate {
            self.clear_metadata()?;
        } else if let Some(json) = load_gzipped_json_string(&path)? {
            debug!(path = %path.display(), "metadata cache hit");
            return Ok(json);
        }

        let store = self.store;
        let (genes, cells) = store.shape()?;
        let last_modified = display_time(&store.last_modified()?);
        let md = FileMetadata {
            project: self.project.clone(),
            filename: self.filename.clone(),
            dataset: self.filename.clone(),
            title: store.metadata("title")?.unwrap_or_else(|| self.filename.clone()),
            description: store.metadata("description")?.unwrap_or_default(),
            url: store.metadata("url")?.unwrap_or_default(),
            doi: store.metadata("doi")?.unwrap_or_default(),
            creation_date: store
                .metadata("creation_date")?
                .map(|d| display_time(&d))
                .unwrap_or_else(|| last_modified.clone()),
            last_modified,
            total_cells: cells,
            total_genes: genes,
        };
        info!(path = %path.display(), "expanded metadata");
        save_gzipped_json(&path, &md)
    }

    /// JSON of all attributes, from cache unless `truncate` is set.
    pub fn attributes(&self, truncate: bool) -> Result<String> {
        let path = self.paths.attributes();
        if truncate {
            self.clear_attributes()?;
        } else if let Some(json) = load_gzipped_json_string(&path)? {
            debug!(path = %path.display(), "attribute cache hit");
            return Ok(json);
        }

        let store = self.store;
        let (rows, cols) = store.shape()?;
        let range = ZoomRange::for_shape(rows, cols);
        let (width, height) = range.dimensions();
        let (zmin, zmid, zmax) = range.as_tuple();
        let encode = |attrs: &BTreeMap<String, loom_store::Attribute>| {
            attrs
                .iter()
                .map(|(k, v)| (k.clone(), metadata_array(v)))
                .collect::<BTreeMap<_, _>>()
        };
        let attrs = FileAttributes {
            project: self.project.clone(),
            filename: self.filename.clone(),
            dataset: self.filename.clone(),
            shape: [rows, cols],
            zoom_range: [zmin, zmid, zmax],
            full_zoom_height: height,
            full_zoom_width: width,
            row_attrs: encode(store.row_attrs()?),
            col_attrs: encode(store.col_attrs()?),
        };
        info!(path = %path.display(), "expanded attributes");
        save_gzipped_json(&path, &attrs)
    }

    /// Expand every row. Rows already on disk are kept unless `truncate`
    /// is set; returns the number of rows written.
    pub fn rows(&self, truncate: bool) -> Result<usize> {
        self.expand_axis(Axis::Row, truncate)
    }

    /// Expand every column. See [`rows`](Self::rows).
    pub fn columns(&self, truncate: bool) -> Result<usize> {
        self.expand_axis(Axis::Column, truncate)
    }

    fn axis_len(&self, axis: Axis) -> Result<usize> {
        let (rows, cols) = self.store.shape()?;
        Ok(match axis {
            Axis::Row => rows,
            Axis::Column => cols,
        })
    }

    fn save_entry(&self, axis: Axis, idx: usize, values: &[f32]) -> Result<String> {
        let entry = AxisEntry {
            idx,
            data: matrix_metadata(values),
        };
        save_gzipped_json(&self.paths.entry(axis, idx), &entry)
    }

    fn expand_axis(&self, axis: Axis, truncate: bool) -> Result<usize> {
        let dir = self.paths.axis_dir(axis);
        if truncate {
            self.clear_axis(axis)?;
        }
        fs::create_dir_all(&dir).map_err(|e| LoomError::io_at(&dir, e))?;

        let len = self.axis_len(axis)?;
        let mut written = 0;
        let mut start = 0;
        while start < len {
            let end = (start + self.chunk).min(len);
            let missing: Vec<usize> = (start..end)
                .filter(|&i| !self.paths.entry(axis, i).is_file())
                .collect();
            if !missing.is_empty() {
                let block = match axis {
                    Axis::Row => self.store.read_rows(start..end)?,
                    Axis::Column => self.store.read_columns(start..end)?.reversed_axes(),
                };
                for &i in &missing {
                    self.save_entry(axis, i, &block.row(i - start).to_vec())?;
                }
                written += missing.len();
            }
            start = end;
        }
        if written == 0 {
            debug!(dir = %dir.display(), "{axis}s already expanded");
        } else {
            info!(dir = %dir.display(), count = written, "expanded {axis}s");
        }
        Ok(written)
    }

    /// Serialized entries for `indices`: deduplicated, sorted, with
    /// out-of-range indices dropped. Missing entries are computed and
    /// persisted.
    pub fn selected_entries(&self, axis: Axis, indices: &[usize]) -> Result<Vec<(usize, String)>> {
        let len = self.axis_len(axis)?;
        let mut wanted: Vec<usize> = indices.iter().copied().filter(|&i| i < len).collect();
        wanted.sort_unstable();
        wanted.dedup();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let dir = self.paths.axis_dir(axis);
        fs::create_dir_all(&dir).map_err(|e| LoomError::io_at(&dir, e))?;
        let mut out = Vec::with_capacity(wanted.len());
        for i in wanted {
            let path = self.paths.entry(axis, i);
            let json = match load_gzipped_json_string(&path)? {
                Some(json) => json,
                None => {
                    let values = match axis {
                        Axis::Row => self.store.row(i)?,
                        Axis::Column => self.store.column(i)?,
                    };
                    self.save_entry(axis, i, &values)?
                }
            };
            out.push((i, json));
        }
        Ok(out)
    }

    /// JSON array of the requested rows.
    pub fn selected_rows(&self, indices: &[usize]) -> Result<String> {
        let entries = self.selected_entries(Axis::Row, indices)?;
        Ok(json_array(entries.iter().map(|(_, json)| json)))
    }

    /// JSON array of the requested columns.
    pub fn selected_columns(&self, indices: &[usize]) -> Result<String> {
        let entries = self.selected_entries(Axis::Column, indices)?;
        Ok(json_array(entries.iter().map(|(_, json)| json)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use loom_store::{Attribute, OpenMode};
    use ndarray::array;
    use serde_json::Value;

    use crate::metadata::Datum;

    fn example(dir: &Path) -> MatrixStore {
        let mut rows = BTreeMap::new();
        rows.insert("Gene".to_string(), Attribute::from(vec!["A", "B", "C"]));
        let mut cols = BTreeMap::new();
        cols.insert("Cell".to_string(), Attribute::from(vec!["c1", "c2", "c3", "c4"]));
        cols.insert("Age".to_string(), Attribute::Int(vec![3, 3, 7, 1]));
        let m = array![
            [1.0f32, 2.0, 3.0, 4.0],
            [5.0, 6.0, 7.0, 8.0],
            [9.0, 10.0, 11.5, 12.0]
        ];
        MatrixStore::create(dir.join("example.loom"), &m, rows, cols).unwrap()
    }

    #[test]
    fn metadata_facet() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = example(dir.path());
        store.set_metadata("title", "Midbrain").unwrap();
        let cache = ExpansionCache::new(&store, "proj", "example.loom").unwrap();
        let json: Value = serde_json::from_str(&cache.metadata(false).unwrap()).unwrap();
        assert_eq!(json["title"], "Midbrain");
        assert_eq!(json["totalGenes"], 3);
        assert_eq!(json["totalCells"], 4);
        assert_eq!(json["project"], "proj");
        assert!(cache.paths().metadata().is_file());
        // Served from disk the second time.
        let md: FileMetadata = serde_json::from_str(&cache.metadata(false).unwrap()).unwrap();
        assert_eq!(md.dataset, "example.loom");
    }

    #[test]
    fn attributes_facet() {
        let dir = tempfile::tempdir().unwrap();
        let store = example(dir.path());
        let cache = ExpansionCache::new(&store, "proj", "example.loom").unwrap();
        let attrs: FileAttributes = serde_json::from_str(&cache.attributes(false).unwrap()).unwrap();
        assert_eq!(attrs.shape, [3, 4]);
        assert_eq!(attrs.zoom_range, [6, 8, 10]);
        assert_eq!((attrs.full_zoom_width, attrs.full_zoom_height), (16, 12));
        assert_eq!(
            attrs.row_attrs["Gene"].indexed_val,
            Some(vec!["A".to_string(), "B".to_string(), "C".to_string()])
        );
        assert_eq!(attrs.col_attrs["Age"].data[2], Datum::Int(7));
    }

    #[test]
    fn full_axis_expansion_uses_true_indices() {
        let dir = tempfile::tempdir().unwrap();
        let store = example(dir.path());
        let cache = ExpansionCache::new(&store, "p", "example.loom")
            .unwrap()
            .with_chunk(2);
        assert_eq!(cache.rows(false).unwrap(), 3);
        assert_eq!(cache.rows(false).unwrap(), 0);
        assert_eq!(cache.columns(false).unwrap(), 4);

        let text = load_gzipped_json_string(&cache.paths().entry(Axis::Column, 3))
            .unwrap()
            .unwrap();
        let col: AxisEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(col.idx, 3);
        assert_eq!(col.data.data, vec![Datum::Int(4), Datum::Int(8), Datum::Int(12)]);

        let text = load_gzipped_json_string(&cache.paths().entry(Axis::Row, 2))
            .unwrap()
            .unwrap();
        let row: AxisEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(row.data.data[2], Datum::Float(11.5));
        assert_eq!(cache.rows(true).unwrap(), 3);
    }

    #[test]
    fn full_expansion_fills_in_after_partial_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = example(dir.path());
        let cache = ExpansionCache::new(&store, "p", "example.loom").unwrap();
        cache.selected_entries(Axis::Row, &[1]).unwrap();
        assert_eq!(cache.rows(false).unwrap(), 2);
        for i in 0..3 {
            assert!(cache.paths().entry(Axis::Row, i).is_file());
        }
        let text = load_gzipped_json_string(&cache.paths().entry(Axis::Row, 0))
            .unwrap()
            .unwrap();
        let row: AxisEntry = serde_json::from_str(&text).unwrap();
        assert_eq!(row.data.data[3], Datum::Int(4));
        assert_eq!(cache.rows(false).unwrap(), 0);
    }

    #[test]
    fn selected_rows_dedup_and_drop_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let store = example(dir.path());
        let cache = ExpansionCache::new(&store, "p", "example.loom").unwrap();
        let json: Value = serde_json::from_str(&cache.selected_rows(&[2, 0, 2, 99]).unwrap()).unwrap();
        let idx: Vec<u64> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["idx"].as_u64().unwrap())
            .collect();
        assert_eq!(idx, vec![0, 2]);
        assert!(cache.paths().entry(Axis::Row, 2).is_file());
        assert!(!cache.paths().entry(Axis::Row, 1).is_file());
        assert_eq!(cache.selected_rows(&[]).unwrap(), "[]");
        assert_eq!(cache.selected_columns(&[7]).unwrap(), "[]");
    }

    #[test]
    fn modification_clears_facets() {
        let dir = tempfile::tempdir().unwrap();
        let path = example(dir.path()).path().to_path_buf();
        let paths = SidecarPaths::new(&path);
        {
            let store = MatrixStore::connect(&path, OpenMode::ReadOnly).unwrap();
            let cache = ExpansionCache::new(&store, "p", "example.loom").unwrap();
            cache.metadata(false).unwrap();
            cache.selected_columns(&[0]).unwrap();
        }
        assert!(paths.metadata().is_file());

        let mut store = MatrixStore::connect(&path, OpenMode::ReadWrite).unwrap();
        store.set_metadata("doi", "10.1000/xyz").unwrap();
        let cache = ExpansionCache::new(&store, "p", "example.loom").unwrap();
        assert!(!paths.metadata().is_file());
        assert!(!paths.axis_dir(Axis::Column).exists());
        let json: Value = serde_json::from_str(&cache.metadata(false).unwrap()).unwrap();
        assert_eq!(json["doi"], "10.1000/xyz");
    }

    #[test]
    fn stamp_tracks_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let path = example(dir.path()).path().to_path_buf();
        assert!(!ExpansionCache::is_current(&path).unwrap());
        let mut store = MatrixStore::connect(&path, OpenMode::ReadWrite).unwrap();
        let marker = ExpansionCache::new(&store, "p", "example.loom")
            .unwrap()
            .marker()
            .to_string();
        assert_eq!(marker, store.modification_marker().unwrap());
        assert!(ExpansionCache::is_current(&path).unwrap());
        store
            .set_attr("Score", Attribute::Int(vec![1, 2, 3]), Axis::Row, None)
            .unwrap();
        assert!(!ExpansionCache::is_current(&path).unwrap());
    }

    #[test]
    fn json_array_joins() {
        assert_eq!(json_array(Vec::<String>::new()), "[]");
        assert_eq!(json_array(["1", "{\"a\":2}"]), "[1,{\"a\":2}]");
    }
}
