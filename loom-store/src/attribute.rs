//! Typed row and column attributes.
//!
//! Every attribute is a vector aligned to one axis of the matrix. Its
//! declared type is persisted in the file schema, so values never have to
//! be re-sniffed on connect.

use std::fmt;

use serde::{Deserialize, Serialize};

use loom_core::{LoomError, Result};

/// The matrix axis an attribute is aligned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Row attributes (genes), length R.
    Row,
    /// Column attributes (cells), length C.
    Column,
}

impl Axis {
    /// Name of the group holding this axis' attributes.
    pub fn group(self) -> &'static str {
        match self {
            Axis::Row => "row_attrs",
            Axis::Column => "col_attrs",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Row => write!(f, "row"),
            Axis::Column => write!(f, "column"),
        }
    }
}

/// Declared attribute type, as persisted in the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    Float64,
    Int,
    String,
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttrType::Float64 => "float64",
            AttrType::Int => "int",
            AttrType::String => "string",
        };
        f.write_str(s)
    }
}

/// A named vector of metadata values.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float64(Vec<f64>),
    Int(Vec<i64>),
    String(Vec<String>),
}

impl Attribute {
    /// Build an attribute from raw text, storing it as `float64` if every
    /// value parses as a number and as `string` otherwise.
    pub fn infer(values: Vec<String>) -> Self {
        let parsed: Option<Vec<f64>> = values.iter().map(|v| v.trim().parse().ok()).collect();
        match parsed {
            Some(nums) if !values.is_empty() => Attribute::Float64(nums),
            _ => Attribute::String(values),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Attribute::Float64(v) => v.len(),
            Attribute::Int(v) => v.len(),
            Attribute::String(v) => v.len(),
        }
    }

    /// Whether the attribute has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type this attribute would be persisted as.
    pub fn dtype(&self) -> AttrType {
        match self {
            Attribute::Float64(_) => AttrType::Float64,
            Attribute::Int(_) => AttrType::Int,
            Attribute::String(_) => AttrType::String,
        }
    }

    /// Values as `f64`, or `None` for string attributes.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            Attribute::Float64(v) => Some(v.clone()),
            Attribute::Int(v) => Some(v.iter().map(|&x| x as f64).collect()),
            Attribute::String(_) => None,
        }
    }

    /// The string slice, or `None` for numeric attributes.
    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Attribute::String(v) => Some(v),
            _ => None,
        }
    }

    /// Text form of the value at `i`.
    pub fn value_string(&self, i: usize) -> Option<String> {
        match self {
            Attribute::Float64(v) => v.get(i).map(|x| x.to_string()),
            Attribute::Int(v) => v.get(i).map(|x| x.to_string()),
            Attribute::String(v) => v.get(i).cloned(),
        }
    }

    /// Whether every numeric value is finite. String attributes always pass.
    pub fn is_finite(&self) -> bool {
        match self {
            Attribute::Float64(v) => v.iter().all(|x| x.is_finite()),
            _ => true,
        }
    }

    /// Convert to `dtype`. Fails with [`LoomError::Schema`] when a value
    /// cannot be represented in the target type.
    pub fn cast(self, dtype: AttrType) -> Result<Attribute> {
        match (self, dtype) {
            (a @ Attribute::Float64(_), AttrType::Float64)
            | (a @ Attribute::Int(_), AttrType::Int)
            | (a @ Attribute::String(_), AttrType::String) => Ok(a),
            (Attribute::Int(v), AttrType::Float64) => {
                Ok(Attribute::Float64(v.into_iter().map(|x| x as f64).collect()))
            }
            (Attribute::Float64(v), AttrType::Int) => {
                let ints = v
                    .iter()
                    .map(|&x| {
                        if x.is_finite() && x.fract() == 0.0 {
                            Ok(x as i64)
                        } else {
                            Err(LoomError::Schema(format!("{x} is not an integer")))
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Attribute::Int(ints))
            }
            (Attribute::String(v), AttrType::Float64) => {
                let nums = v
                    .iter()
                    .map(|s| {
                        s.trim().parse::<f64>().map_err(|_| {
                            LoomError::Schema(format!("'{s}' is not a float64 value"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Attribute::Float64(nums))
            }
            (Attribute::String(v), AttrType::Int) => {
                let ints = v
                    .iter()
                    .map(|s| {
                        s.trim()
                            .parse::<i64>()
                            .map_err(|_| LoomError::Schema(format!("'{s}' is not an int value")))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Attribute::Int(ints))
            }
            (a, AttrType::String) => {
                let strings = (0..a.len()).filter_map(|i| a.value_string(i)).collect();
                Ok(Attribute::String(strings))
            }
        }
    }

    /// Convert to the canonical on-create representation: `float64` when
    /// the values are losslessly castable, `string` otherwise.
    pub fn normalized(self) -> Attribute {
        match self {
            Attribute::Int(v) => Attribute::Float64(v.into_iter().map(|x| x as f64).collect()),
            Attribute::String(v) => Attribute::infer(v),
            a => a,
        }
    }

    /// Subset to the given indices.
    pub fn subset(&self, indices: &[usize]) -> Attribute {
        match self {
            Attribute::Float64(v) => Attribute::Float64(indices.iter().map(|&i| v[i]).collect()),
            Attribute::Int(v) => Attribute::Int(indices.iter().map(|&i| v[i]).collect()),
            Attribute::String(v) => {
                Attribute::String(indices.iter().map(|&i| v[i].clone()).collect())
            }
        }
    }

    /// Append the values of `other`, which must have the same type.
    pub fn extend(&mut self, other: &Attribute) -> Result<()> {
        match (self, other) {
            (Attribute::Float64(a), Attribute::Float64(b)) => a.extend_from_slice(b),
            (Attribute::Int(a), Attribute::Int(b)) => a.extend_from_slice(b),
            (Attribute::String(a), Attribute::String(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(LoomError::Schema(format!(
                    "cannot extend {} attribute with {} values",
                    a.dtype(),
                    b.dtype()
                )))
            }
        }
        Ok(())
    }
}

impl From<Vec<f64>> for Attribute {
    fn from(v: Vec<f64>) -> Self {
        Attribute::Float64(v)
    }
}

impl From<Vec<i64>> for Attribute {
    fn from(v: Vec<i64>) -> Self {
        Attribute::Int(v)
    }
}

impl From<Vec<String>> for Attribute {
    fn from(v: Vec<String>) -> Self {
        Attribute::String(v)
    }
}

impl From<Vec<&str>> for Attribute {
    fn from(v: Vec<&str>) -> Self {
        Attribute::String(v.into_iter().map(String::from).collect())
    }
}

/// Reject names that cannot live as a node under `row_attrs/` or `col_attrs/`.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.starts_with('.')
        || name.starts_with("__")
        || name == "zarr.json"
    {
        return Err(LoomError::Schema(format!("invalid attribute name '{name}'")));
    }
    Ok(())
}
