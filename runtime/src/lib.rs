//! ocifold Runtime - manifest flattening.
//!
//! Reads image manifests and indices from registries or OCI layouts,
//! collapses every image to a single layer, and writes the rewritten tree
//! back.

#![allow(clippy::result_large_err)]

pub mod oci;

// Re-export common types
pub use oci::{flatten_layout, flatten_remote, head, read_platform_image, Format, SourceRef};
pub use oci::{CredentialStore, ImageReference, RegistryAuth};
pub use oci::{Flattener, Image, ImageIndex, ImageSource, ImageWriter, Node};

/// ocifold runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
