//! OCI manifest trees and layer flattening.
//!
//! Images and indices are read from a registry or an OCI layout into a
//! [`Node`] tree, flattened so every image carries a single merged layer,
//! and written back through an [`ImageWriter`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ ImageSource  │────▶│  Flattener   │────▶│ ImageWriter  │
//! │              │     │              │     │              │
//! │ RegistrySrc  │     │ merge_layers │     │ RemoteWriter │
//! │ LayoutSource │     │ StreamLayer  │     │ LocalWriter  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

mod api;
pub mod credentials;
pub mod digest;
pub mod extract;
pub mod flatten;
pub mod fold;
pub mod layer;
pub mod layout;
pub mod media;
pub mod reference;
pub mod registry;
pub mod source;
pub mod tree;
pub mod walk;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use credentials::CredentialStore;
pub use flatten::{FlattenOptions, Flattener};
pub use fold::{
    destination_references, flatten_layout, flatten_remote, head, read_platform_image, Format,
    SourceRef,
};
pub use layer::{Layer, LayerContent, StreamLayer};
pub use layout::{LayoutSource, LocalWriter};
pub use media::{MediaFamily, NodeKind};
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistrySource, RemoteWriter};
pub use source::ImageSource;
pub use tree::{Addendum, Image, ImageIndex, Node};
pub use walk::{find_image, platform_matcher, walk};
pub use writer::ImageWriter;
