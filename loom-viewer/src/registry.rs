//! The dataset registry.
//!
//! [`DatasetRegistry`] indexes the loom files under the dataset root (one
//! sub-directory per project), checks access through an
//! [`AuthorizationPolicy`] and hands out exclusive, lease-guarded
//! connections. The JSON facet accessors serve cached expansion files when
//! they exist and still match the container's modification marker, and
//! only take the per-file lock when the container has to be opened.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use loom_core::compress::load_gzipped_json_string;
use loom_core::{LoomError, Result};
use loom_store::{Axis, MatrixStore, OpenMode};
use loom_tiles::TileEngine;

use crate::auth::{AccessMode, AuthorizationPolicy, Credentials, FlatFileAuth};
use crate::config::ViewerConfig;
use crate::expand::{json_array, ExpansionCache, SidecarPaths};
use crate::lock::{FileLease, LockTable};

/// File-name extension of loom containers.
pub const LOOM_EXTENSION: &str = "loom";

/// `(project, filename, absolute path)`.
pub type DatasetEntry = (String, String, PathBuf);

/// A connection that holds its file's lock for as long as it lives.
pub struct LeasedStore {
    store: MatrixStore,
    _lease: FileLease,
}

impl Deref for LeasedStore {
    type Target = MatrixStore;

    fn deref(&self) -> &MatrixStore {
        &self.store
    }
}

impl DerefMut for LeasedStore {
    fn deref_mut(&mut self) -> &mut MatrixStore {
        &mut self.store
    }
}

fn is_visible_dir(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| !n.starts_with('.'))
            .unwrap_or(false)
}

fn is_loom(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(LOOM_EXTENSION)
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| LoomError::io_at(dir, e))? {
        let entry = entry.map_err(|e| LoomError::io_at(dir, e))?;
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Index of projects and loom files under one dataset root.
pub struct DatasetRegistry {
    config: ViewerConfig,
    root: PathBuf,
    auth: Box<dyn AuthorizationPolicy>,
    projects: RwLock<BTreeMap<String, BTreeSet<String>>>,
    locks: LockTable,
    metadata_entries: Mutex<HashMap<String, FacetEntry>>,
    attribute_entries: Mutex<HashMap<String, FacetEntry>>,
}

/// An in-memory facet and the marker of the matrix it was built from.
struct FacetEntry {
    marker: String,
    json: String,
}

impl DatasetRegistry {
    /// Open the dataset root named by `config` with [`FlatFileAuth`],
    /// creating the directory if needed.
    pub fn open(config: ViewerConfig) -> Result<Self> {
        Self::with_policy(config, Box::new(FlatFileAuth))
    }

    pub fn with_policy(config: ViewerConfig, auth: Box<dyn AuthorizationPolicy>) -> Result<Self> {
        let root = &config.dataset_path;
        if !root.exists() {
            info!(path = %root.display(), "creating dataset folder");
            fs::create_dir_all(root).map_err(|e| LoomError::io_at(root, e))?;
        }
        let root = fs::canonicalize(root).map_err(|e| LoomError::io_at(root, e))?;
        info!(path = %root.display(), "dataset folder");
        let registry = Self {
            config,
            root,
            auth,
            projects: RwLock::new(BTreeMap::new()),
            locks: LockTable::new(),
            metadata_entries: Mutex::new(HashMap::new()),
            attribute_entries: Mutex::new(HashMap::new()),
        };
        registry.update_dataset_list()?;
        Ok(registry)
    }

    pub fn dataset_path(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    /// Rescan the dataset root for projects and loom files.
    pub fn update_dataset_list(&self) -> Result<()> {
        debug!(path = %self.root.display(), "updating file index");
        let mut projects: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for dir in read_dir_sorted(&self.root)? {
            if !is_visible_dir(&dir) {
                continue;
            }
            let project = file_name(&dir);
            let files = self
                .files_in_project(&project)?
                .into_iter()
                .map(|(_, filename, _)| filename)
                .collect();
            projects.insert(project, files);
        }
        *self.projects.write() = projects;
        Ok(())
    }

    /// Project names from the last scan.
    pub fn projects(&self) -> Vec<String> {
        self.projects.read().keys().cloned().collect()
    }

    /// Every `(project, filename)` from the last scan.
    pub fn list_files(&self) -> Vec<(String, String)> {
        self.projects
            .read()
            .iter()
            .flat_map(|(p, files)| files.iter().map(move |f| (p.clone(), f.clone())))
            .collect()
    }

    /// Loom files currently on disk in `project`.
    pub fn files_in_project(&self, project: &str) -> Result<Vec<DatasetEntry>> {
        let dir = self.root.join(project);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        Ok(read_dir_sorted(&dir)?
            .into_iter()
            .filter(|p| is_loom(p))
            .map(|p| (project.to_string(), file_name(&p), p))
            .collect())
    }

    /// Files named `filename` in any project. An absolute path inside the
    /// dataset root matches at most that one file.
    pub fn matching_filenames(&self, filename: &str) -> Result<Vec<DatasetEntry>> {
        let path = Path::new(filename);
        if path.is_absolute() {
            let Ok(path) = fs::canonicalize(path) else {
                return Ok(Vec::new());
            };
            let project_dir = path.parent().filter(|p| p.parent() == Some(self.root.as_path()));
            return Ok(match project_dir {
                Some(dir) if is_loom(&path) => {
                    vec![(file_name(dir), file_name(&path), path.clone())]
                }
                _ => Vec::new(),
            });
        }
        if !is_loom(path) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for dir in read_dir_sorted(&self.root)? {
            let candidate = dir.join(filename);
            if is_visible_dir(&dir) && candidate.exists() {
                out.push((file_name(&dir), filename.to_string(), candidate));
            }
        }
        Ok(out)
    }

    /// Absolute path of a registered file.
    pub fn absolute_file_path(&self, project: &str, filename: &str) -> Option<PathBuf> {
        let known = self
            .projects
            .read()
            .get(project)
            .map(|files| files.contains(filename))
            .unwrap_or(false);
        known.then(|| self.root.join(project).join(filename))
    }

    fn require_path(&self, project: &str, filename: &str) -> Result<PathBuf> {
        self.absolute_file_path(project, filename)
            .ok_or_else(|| LoomError::NotFound(format!("{project}/{filename}")))
    }

    /// Whether `credentials` grant `mode` access to `project`. Unknown
    /// projects are never authorized.
    pub fn authorize(&self, project: &str, credentials: &Credentials, mode: AccessMode) -> bool {
        if !self.projects.read().contains_key(project) {
            debug!(project, "authorization for unknown project");
            return false;
        }
        self.auth
            .authorize(&self.root.join(project), credentials, mode)
    }

    /// Open a registered file under its lock.
    ///
    /// Fails with [`LoomError::LockTimeout`] if another connection holds
    /// the file for longer than the configured timeout.
    pub fn connect(&self, project: &str, filename: &str, mode: OpenMode) -> Result<LeasedStore> {
        let path = self.require_path(project, filename)?;
        let lease = self.locks.acquire(&path, self.config.lock_timeout())?;
        let store = MatrixStore::connect(&path, mode)?;
        Ok(LeasedStore {
            store,
            _lease: lease,
        })
    }

    /// Whether a connection to the file is currently open.
    pub fn is_locked(&self, project: &str, filename: &str) -> bool {
        self.absolute_file_path(project, filename)
            .map(|p| self.locks.is_locked(&p))
            .unwrap_or(false)
    }

    fn with_expander<T>(
        &self,
        project: &str,
        filename: &str,
        f: impl FnOnce(&ExpansionCache<'_>) -> Result<T>,
    ) -> Result<T> {
        let store = self.connect(project, filename, OpenMode::ReadOnly)?;
        let cache = ExpansionCache::new(&store, project, filename)?
            .with_chunk(self.config.expansion_chunk);
        f(&cache)
    }

    fn cached_facet(
        &self,
        entries: &Mutex<HashMap<String, FacetEntry>>,
        project: &str,
        filename: &str,
        facet: fn(&SidecarPaths) -> PathBuf,
        truncate: bool,
        expand: impl Fn(&ExpansionCache<'_>, bool) -> Result<String>,
    ) -> Result<String> {
        let key = format!("{project}/{filename}");
        let path = self.require_path(project, filename)?;
        let file = facet(&SidecarPaths::new(&path));
        let marker = MatrixStore::read_modification_marker(&path)?;
        if !truncate {
            if let Some(entry) = entries.lock().get(&key).filter(|e| e.marker == marker) {
                return Ok(entry.json.clone());
            }
            if ExpansionCache::is_current(&path)? {
                if let Some(json) = load_gzipped_json_string(&file)? {
                    debug!(path = %file.display(), "loaded expanded facet");
                    entries.lock().insert(key, FacetEntry { marker, json: json.clone() });
                    return Ok(json);
                }
            }
        }
        entries.lock().remove(&key);
        let (marker, json) = self.with_expander(project, filename, |cache| {
            Ok((cache.marker().to_string(), expand(cache, truncate)?))
        })?;
        entries.lock().insert(key, FacetEntry { marker, json: json.clone() });
        Ok(json)
    }

    /// Metadata JSON of one file.
    pub fn metadata_json(&self, project: &str, filename: &str, truncate: bool) -> Result<String> {
        self.cached_facet(
            &self.metadata_entries,
            project,
            filename,
            SidecarPaths::metadata,
            truncate,
            |cache, truncate| cache.metadata(truncate),
        )
    }

    /// Attribute JSON of one file.
    pub fn attributes_json(&self, project: &str, filename: &str, truncate: bool) -> Result<String> {
        self.cached_facet(
            &self.attribute_entries,
            project,
            filename,
            SidecarPaths::attributes,
            truncate,
            |cache, truncate| cache.attributes(truncate),
        )
    }

    fn axis_json(&self, axis: Axis, project: &str, filename: &str, indices: &[usize]) -> Result<String> {
        let path = self.require_path(project, filename)?;
        let paths = SidecarPaths::new(&path);
        let mut wanted = indices.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        if wanted.is_empty() {
            return Ok("[]".to_string());
        }

        let marker = MatrixStore::read_modification_marker(&path)?;
        let current = ExpansionCache::is_current(&path)?;
        let mut found = Vec::with_capacity(wanted.len());
        let mut missing = Vec::new();
        for &i in &wanted {
            let cached = if current {
                load_gzipped_json_string(&paths.entry(axis, i))?
            } else {
                None
            };
            match cached {
                Some(json) => found.push((i, json)),
                None => missing.push(i),
            }
        }
        if !missing.is_empty() {
            debug!(count = missing.len(), "expanding missing {axis}s");
            let fresh = self.with_expander(project, filename, |cache| {
                if current && cache.marker() != marker {
                    // Changed since the entries above were read.
                    found.clear();
                    cache.selected_entries(axis, &wanted)
                } else {
                    cache.selected_entries(axis, &missing)
                }
            })?;
            found.extend(fresh);
            found.sort_by_key(|(i, _)| *i);
        }
        Ok(json_array(found.iter().map(|(_, json)| json)))
    }

    /// JSON array of the requested rows; out-of-range indices are dropped.
    pub fn rows_json(&self, project: &str, filename: &str, indices: &[usize]) -> Result<String> {
        self.axis_json(Axis::Row, project, filename, indices)
    }

    /// JSON array of the requested columns; out-of-range indices are dropped.
    pub fn columns_json(&self, project: &str, filename: &str, indices: &[usize]) -> Result<String> {
        self.axis_json(Axis::Column, project, filename, indices)
    }

    /// JSON array of the metadata of every file `credentials` may read.
    /// Files that cannot be expanded right now are left out.
    pub fn metadata_list(&self, credentials: &Credentials) -> Result<String> {
        self.update_dataset_list()?;
        let mut items = Vec::new();
        for (project, filename) in self.list_files() {
            if !self.authorize(&project, credentials, AccessMode::Read) {
                continue;
            }
            match self.metadata_json(&project, &filename, false) {
                Ok(json) => items.push(json),
                Err(e) => warn!(project = %project, filename = %filename, error = %e, "skipping dataset"),
            }
        }
        Ok(json_array(items))
    }

    /// Build the full tile pyramid of one file under its lock. Returns the
    /// number of tiles generated.
    pub fn prepare_tiles(&self, project: &str, filename: &str, truncate: bool) -> Result<usize> {
        let store = self.connect(project, filename, OpenMode::ReadOnly)?;
        let mut engine = TileEngine::open(&store)?
            .with_extrema_chunk_rows(self.config.extrema_chunk_rows)
            .with_png_compression(self.config.png_compression);
        engine.prepare(truncate)
    }
}
