//! Dataset serving support for loom files.
//!
//! - **Registry**: [`DatasetRegistry`] indexes projects, authorizes access
//!   and hands out lock-guarded connections
//! - **Expansion**: [`ExpansionCache`] writes gzipped JSON facets of a file
//!   and [`metadata_array`] encodes vectors for the client
//! - **Configuration**: [`ViewerConfig`] and the shared [`ServerContext`]
//!
//! # Quick start
//!
//! ```no_run
//! use loom_viewer::{Credentials, ServerContext};
//!
//! let ctx = ServerContext::from_env()?;
//! let listing = ctx.registry().metadata_list(&Credentials::anonymous())?;
//! println!("{listing}");
//! # Ok::<(), loom_core::LoomError>(())
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod expand;
pub mod lock;
pub mod metadata;
pub mod registry;

pub use auth::{AccessMode, AuthorizationPolicy, Credentials, FlatFileAuth};
pub use config::ViewerConfig;
pub use context::ServerContext;
pub use expand::{ExpansionCache, FileAttributes, FileMetadata, SidecarPaths};
pub use lock::{FileLease, LockTable};
pub use metadata::{metadata_array, ArrayType, Datum, MetadataArray};
pub use registry::{DatasetRegistry, LeasedStore};
