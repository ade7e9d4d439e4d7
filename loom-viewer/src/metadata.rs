//! Compact JSON encoding of attribute and matrix vectors.
//!
//! [`metadata_array`] classifies a vector and wraps it with the summary a
//! client needs to draw legends without scanning the data:
//!
//! - integers are tagged with the narrowest `uint8`..`int32` type holding
//!   their range,
//! - other numbers are rounded to `float32` precision,
//! - strings with fewer than 256 distinct values are dictionary encoded as
//!   1-based indices into `indexedVal` (0 is left for "no value").
//!
//! `uniques` lists every value occurring more than once, sorted by value,
//! and is left empty when all values are distinct.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use loom_store::Attribute;

/// Distinct-string limit for dictionary encoding.
pub const MAX_INDEXED_VALUES: usize = 256;

/// Storage class reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayType {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float32,
    String,
}

/// One JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Datum {
    /// An integer if `v` has no fractional part, a float otherwise.
    fn number(v: f64) -> Self {
        if v.fract() == 0.0 && v.abs() < 9.0e15 {
            Datum::Int(v as i64)
        } else {
            Datum::Float(v)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unique {
    pub val: Datum,
    pub count: usize,
}

/// A vector with precomputed summary, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataArray {
    pub array_type: ArrayType,
    pub data: Vec<Datum>,
    pub uniques: Vec<Unique>,
    pub min: Datum,
    pub max: Datum,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_val: Option<Vec<String>>,
}

/// Encode an attribute vector.
pub fn metadata_array(attr: &Attribute) -> MetadataArray {
    match attr {
        Attribute::String(values) => string_metadata(values),
        Attribute::Float64(values) => numeric_metadata(values),
        Attribute::Int(values) => {
            numeric_metadata(&values.iter().map(|&v| v as f64).collect::<Vec<_>>())
        }
    }
}

/// Encode one matrix row or column.
pub fn matrix_metadata(values: &[f32]) -> MetadataArray {
    numeric_metadata(&values.iter().map(|&v| v as f64).collect::<Vec<_>>())
}

/// Shortest decimal that round-trips through `f32`.
fn round_f32(v: f64) -> f64 {
    let f = v as f32;
    f.to_string().parse().unwrap_or(f as f64)
}

fn integer_type(min: f64, max: f64) -> ArrayType {
    if min >= 0.0 {
        if max < 256.0 {
            ArrayType::Uint8
        } else if max < 65535.0 {
            ArrayType::Uint16
        } else {
            ArrayType::Uint32
        }
    } else if min > -128.0 && max < 128.0 {
        ArrayType::Int8
    } else if min > -32769.0 && max < 32768.0 {
        ArrayType::Int16
    } else {
        ArrayType::Int32
    }
}

/// Values occurring more than once, with counts, sorted ascending.
fn repeated<T: Clone>(sorted: &[T], eq: impl Fn(&T, &T) -> bool) -> (usize, Vec<(T, usize)>) {
    let mut distinct = 0;
    let mut out = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && eq(&sorted[i], &sorted[j]) {
            j += 1;
        }
        distinct += 1;
        if j - i > 1 {
            out.push((sorted[i].clone(), j - i));
        }
        i = j;
    }
    (distinct, out)
}

/// Encode a numeric vector. Non-finite values become 0.
pub fn numeric_metadata(values: &[f64]) -> MetadataArray {
    let clean: Vec<f64> = values
        .iter()
        .map(|&v| if v.is_finite() { v } else { 0.0 })
        .collect();
    let all_integer = clean.iter().all(|v| v.fract() == 0.0);
    let clean: Vec<f64> = if all_integer {
        clean
    } else {
        clean.into_iter().map(round_f32).collect()
    };

    let min = clean.iter().copied().fold(f64::INFINITY, f64::min);
    let max = clean.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let (min, max) = if clean.is_empty() { (0.0, 0.0) } else { (min, max) };

    let array_type = if all_integer {
        integer_type(min, max)
    } else {
        ArrayType::Float32
    };

    let mut sorted = clean.clone();
    sorted.sort_by(f64::total_cmp);
    let (distinct, reps) = repeated(&sorted, |a, b| a.total_cmp(b) == Ordering::Equal);
    let uniques = if distinct < clean.len() {
        reps.into_iter()
            .map(|(v, count)| Unique {
                val: Datum::number(v),
                count,
            })
            .collect()
    } else {
        Vec::new()
    };

    MetadataArray {
        array_type,
        data: clean.into_iter().map(Datum::number).collect(),
        uniques,
        min: Datum::number(min),
        max: Datum::number(max),
        indexed_val: None,
    }
}

/// Encode a string vector, dictionary encoding it when it has few
/// distinct values.
pub fn string_metadata(values: &[String]) -> MetadataArray {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v.as_str()).or_default() += 1;
    }
    let distinct = counts.len();
    let show_uniques = distinct < values.len();

    if distinct < MAX_INDEXED_VALUES {
        let index: BTreeMap<&str, i64> = counts
            .keys()
            .enumerate()
            .map(|(i, &k)| (k, i as i64 + 1))
            .collect();
        let data = values
            .iter()
            .map(|v| Datum::Int(index.get(v.as_str()).copied().unwrap_or(0)))
            .collect();
        let uniques = if show_uniques {
            counts
                .values()
                .enumerate()
                .filter(|(_, &c)| c > 1)
                .map(|(i, &count)| Unique {
                    val: Datum::Int(i as i64 + 1),
                    count,
                })
                .collect()
        } else {
            Vec::new()
        };
        return MetadataArray {
            array_type: ArrayType::String,
            data,
            uniques,
            min: Datum::Int(1),
            max: Datum::Int(distinct as i64),
            indexed_val: Some(counts.keys().map(|k| k.to_string()).collect()),
        };
    }

    let uniques = if show_uniques {
        counts
            .iter()
            .filter(|(_, &c)| c > 1)
            .map(|(&k, &count)| Unique {
                val: Datum::Str(k.to_string()),
                count,
            })
            .collect()
    } else {
        Vec::new()
    };
    MetadataArray {
        array_type: ArrayType::String,
        data: values.iter().cloned().map(Datum::Str).collect(),
        uniques,
        min: Datum::Int(1),
        max: Datum::Int(distinct as i64),
        indexed_val: None,
    }
}
