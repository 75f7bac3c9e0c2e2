//! Reproducible multi-omic single-cell dataset manager.
//!
//! Fetches encrypted remote count archives, verifies and caches their
//! preprocessed form, and exposes them through [`OmicStore`], a container
//! that keeps every measurement layer aligned to one ordered set of cell
//! identities across filtering, corruption, normalization and splitting.

pub mod annot;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod crypto;
pub mod datasets;
pub mod domain;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod loader;
pub mod model_config;
pub mod reduce;
pub mod store;
pub mod transforms;

pub use annot::{Artifact, Column};
pub use domain::{ArchiveDescriptor, ClusterAlgo, CorruptionKind, OmicKind, ReduceAlgo};
pub use error::OmicError;
pub use loader::{DatasetSpec, LoadOptions, Workspace, load_dataset};
pub use store::OmicStore;
