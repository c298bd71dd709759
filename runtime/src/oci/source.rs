//! ImageSource - where manifest trees are read from.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_spec::image::{Descriptor, ImageManifest};
use ocifold_core::error::{FoldError, Result};

use super::media::NodeKind;
use super::tree::{Image, ImageIndex, Node};

/// Read access to a store holding a manifest tree.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Root node of the bound reference or layout.
    async fn resolve(&self) -> Result<Node>;

    /// Raw manifest bytes addressed by `descriptor`. Implementations verify
    /// the bytes against the descriptor digest.
    async fn read_manifest(&self, descriptor: &Descriptor) -> Result<Vec<u8>>;

    /// Raw config blob of an image.
    async fn read_config(&self, descriptor: &Descriptor) -> Result<Vec<u8>>;

    /// Local path of a layer blob. Remote stores download into `scratch`.
    async fn fetch_blob(&self, descriptor: &Descriptor, scratch: &Path) -> Result<PathBuf>;

    /// Descriptor of the root manifest.
    async fn head(&self) -> Result<Descriptor>;

    /// Read the child node a descriptor points at.
    async fn read_child(&self, descriptor: &Descriptor) -> Result<Node> {
        let raw = self.read_manifest(descriptor).await?;
        let hint = descriptor.media_type().to_string();
        self.node_from_raw(raw, Some(&hint), descriptor.digest())
            .await
    }

    /// Build a node from manifest bytes, loading the config of image nodes.
    ///
    /// `hint` is the media type the node was addressed with; it is used when
    /// the body itself does not name one.
    async fn node_from_raw(
        &self,
        raw: Vec<u8>,
        hint: Option<&str>,
        subject: &str,
    ) -> Result<Node> {
        let (kind, sniffed) = NodeKind::sniff(&raw, subject)?;
        let media_type = match hint {
            Some(hint) if NodeKind::classify(hint, subject).ok() == Some(kind) => hint.to_string(),
            _ => sniffed,
        };

        match kind {
            NodeKind::Index => Ok(Node::Index(ImageIndex::from_raw(raw, &media_type)?)),
            NodeKind::Image => {
                let manifest: ImageManifest = serde_json::from_slice(&raw).map_err(|e| {
                    FoldError::read(subject, format!("invalid image manifest: {}", e))
                })?;
                let config = self.read_config(manifest.config()).await?;
                Ok(Node::Image(Image::from_raw(raw, &media_type, config)?))
            }
        }
    }
}
