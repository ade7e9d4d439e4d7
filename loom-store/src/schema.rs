//! The persisted attribute schema.
//!
//! Stored as a single JSON string under the root group's `schema` attribute:
//! `{"matrix": "float32", "row_attrs": {...}, "col_attrs": {...}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use loom_core::{LoomError, Result};

use crate::attribute::{AttrType, Axis};

/// Element type of the main matrix. Only `float32` is written.
pub const MATRIX_DTYPE: &str = "float32";

/// Declared type of every attribute on both axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub matrix: String,
    pub row_attrs: BTreeMap<String, AttrType>,
    pub col_attrs: BTreeMap<String, AttrType>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            matrix: MATRIX_DTYPE.to_string(),
            row_attrs: BTreeMap::new(),
            col_attrs: BTreeMap::new(),
        }
    }
}

impl Schema {
    /// Parse the JSON blob stored in the file.
    pub fn from_json(text: &str) -> Result<Self> {
        let schema: Schema = serde_json::from_str(text)
            .map_err(|e| LoomError::Format(format!("unreadable schema: {e}")))?;
        if schema.matrix != MATRIX_DTYPE {
            return Err(LoomError::Format(format!(
                "unsupported matrix type '{}'",
                schema.matrix
            )));
        }
        Ok(schema)
    }

    /// Serialize to the JSON blob stored in the file.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Attribute types for one axis.
    pub fn axis(&self, axis: Axis) -> &BTreeMap<String, AttrType> {
        match axis {
            Axis::Row => &self.row_attrs,
            Axis::Column => &self.col_attrs,
        }
    }

    /// Mutable attribute types for one axis.
    pub fn axis_mut(&mut self, axis: Axis) -> &mut BTreeMap<String, AttrType> {
        match axis {
            Axis::Row => &mut self.row_attrs,
            Axis::Column => &mut self.col_attrs,
        }
    }

    /// Declared type of `name` on `axis`.
    pub fn dtype(&self, axis: Axis, name: &str) -> Option<AttrType> {
        self.axis(axis).get(name).copied()
    }
}
