//! Shared primitives for the loom matrix toolkit.
//!
//! `loom-core` provides the foundation the other loom crates build on:
//!
//! - **Error types**: [`LoomError`] and [`Result`] for structured error handling
//! - **Compression**: zstd and gzip, and the gzipped-JSON helpers used by
//!   the derived caches
//! - **Traits**: [`Summarizable`]

pub mod compress;
pub mod error;
pub mod traits;

pub use error::{LoomError, Result};
pub use traits::*;
