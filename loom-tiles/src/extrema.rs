//! Per-row minimum and maximum, used by the contrast stretch.

use serde::{Deserialize, Serialize};
use tracing::info;

use loom_core::Result;
use loom_store::MatrixStore;

/// Row count read per step when scanning the matrix.
pub const DEFAULT_CHUNK_ROWS: usize = 64;

/// Minimum and maximum of every matrix row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowExtrema {
    pub mins: Vec<f64>,
    pub maxes: Vec<f64>,
}

impl RowExtrema {
    /// Scan the whole matrix, `chunk_rows` rows at a time.
    pub fn compute(store: &MatrixStore, chunk_rows: usize) -> Result<Self> {
        let (n_rows, n_cols) = store.shape()?;
        info!(rows = n_rows, cols = n_cols, chunk_rows, "computing row extrema");
        let pairs = store.map_rows(chunk_rows, |row| {
            let mut mn = f64::INFINITY;
            let mut mx = f64::NEG_INFINITY;
            for &v in row.iter() {
                let v = v as f64;
                if v.is_nan() {
                    continue;
                }
                mn = mn.min(v);
                mx = mx.max(v);
            }
            if mn > mx {
                (0.0, 0.0)
            } else {
                (mn, mx)
            }
        })?;
        let (mins, maxes) = pairs.into_iter().unzip();
        Ok(Self { mins, maxes })
    }

    pub fn len(&self) -> usize {
        self.mins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mins.is_empty()
    }

    /// Extrema for rows `start..start + len`, zero-padded past the end.
    pub fn window(&self, start: usize, len: usize) -> (Vec<f64>, Vec<f64>) {
        let take = |v: &[f64]| -> Vec<f64> {
            (start..start + len)
                .map(|i| v.get(i).copied().unwrap_or(0.0))
                .collect()
        };
        (take(&self.mins), take(&self.maxes))
    }
}
