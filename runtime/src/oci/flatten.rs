//! Flatten engine.
//!
//! Rewrites a manifest tree so that every image in it carries exactly one
//! layer holding the merged filesystem of its original layers. Indices are
//! rebuilt around their flattened children with descriptor metadata,
//! annotations and media type carried over.

use std::collections::HashMap;
use std::io::Write;

use futures::future::{BoxFuture, FutureExt};
use oci_spec::image::{Descriptor, HistoryBuilder};
use serde_json::Value;
use ocifold_core::config::{FoldConfig, DEFAULT_COMPRESSION_LEVEL, DEFAULT_TOOL_NAME};
use ocifold_core::error::{FoldError, Result};

use super::extract::merge_layers;
use super::layer::StreamLayer;
use super::media::NodeKind;
use super::source::ImageSource;
use super::tree::{Addendum, Image, ImageIndex, Node};
use super::writer::ImageWriter;

/// Knobs for a flatten run.
#[derive(Debug, Clone)]
pub struct FlattenOptions {
    /// Recorded as `<tool_name> flatten <digest>` in the new history entry
    pub tool_name: String,
    /// Gzip level of the merged layer (0-9)
    pub compression_level: u32,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            tool_name: DEFAULT_TOOL_NAME.to_string(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl From<&FoldConfig> for FlattenOptions {
    fn from(config: &FoldConfig) -> Self {
        Self {
            tool_name: config.tool_name.clone(),
            compression_level: config.compression_level,
        }
    }
}

/// Flattens nodes read from `source`, sending output through `writer`.
pub struct Flattener<'a> {
    source: &'a dyn ImageSource,
    writer: &'a dyn ImageWriter,
    options: FlattenOptions,
}

impl<'a> Flattener<'a> {
    pub fn new(
        source: &'a dyn ImageSource,
        writer: &'a dyn ImageWriter,
        options: FlattenOptions,
    ) -> Self {
        Self {
            source,
            writer,
            options,
        }
    }

    /// Flatten any node.
    pub fn flatten<'s>(&'s self, node: &'s Node) -> BoxFuture<'s, Result<Node>> {
        async move {
            match node {
                Node::Image(img) => Ok(Node::Image(self.flatten_image(img).await?)),
                Node::Index(idx) => Ok(Node::Index(self.flatten_index(idx).await?)),
            }
        }
        .boxed()
    }

    /// Collapse an image's layers into one.
    ///
    /// The new image keeps the original config (minus layer history), the
    /// manifest annotations and the media type family. Its single history
    /// entry names the original digest and carries the original history as
    /// JSON in `comment`.
    pub async fn flatten_image(&self, img: &Image) -> Result<Image> {
        let old_digest = img.digest().to_string();
        tracing::info!(
            digest = %old_digest,
            layers = img.layers().len(),
            "Flattening image"
        );

        let annotations = img.annotations().cloned();
        let mut config = img.config_document().clone();
        let old_history = match config.insert("history".to_string(), Value::Array(Vec::new())) {
            Some(history) => serde_json::to_string(&history)?,
            None => "[]".to_string(),
        };

        // The empty image has no layers, so diff_ids are cleared on rebuild.
        let family = img.family();
        let flat = Image::empty(family)?.with_config(config)?;

        let scratch = tempfile::TempDir::new()?;
        let mut blobs = Vec::with_capacity(img.layers().len());
        for layer in img.layers() {
            let path = match layer.local_path() {
                Some(path) => path.to_path_buf(),
                None => {
                    self.source
                        .fetch_blob(layer.descriptor(), scratch.path())
                        .await?
                }
            };
            tracing::debug!(digest = %layer.digest(), path = %path.display(), "Layer blob ready");
            blobs.push(path);
        }

        let mut layer = StreamLayer::new(
            family.layer(),
            self.options.compression_level,
            Box::new(move |out: &mut dyn Write| {
                let merged = merge_layers(&blobs, out);
                drop(scratch);
                merged
            }),
        );

        self.writer.upload_layer(&mut layer).await?;
        layer.consume().await?;

        let history = HistoryBuilder::default()
            .created_by(format!("{} flatten {}", self.options.tool_name, old_digest))
            .comment(old_history)
            .build()
            .map_err(|e| FoldError::Other(format!("failed to build history: {}", e)))?;
        let mut flat = flat.append_layer(layer.into_layer()?, history)?;

        if let Some(annotations) = non_empty(annotations) {
            flat = flat.with_annotations(annotations)?;
        }

        self.writer.commit_image(&flat).await?;

        tracing::info!(
            old = %old_digest,
            new = %flat.digest(),
            "Flattened image"
        );
        Ok(flat)
    }

    /// Flatten every child of an index, in order.
    ///
    /// Attestation entries (platform `unknown/unknown`) are dropped. Each kept
    /// descriptor is copied with only its digest and size replaced.
    pub async fn flatten_index(&self, idx: &ImageIndex) -> Result<ImageIndex> {
        tracing::info!(
            digest = %idx.digest(),
            children = idx.descriptors().len(),
            "Flattening index"
        );

        let mut addenda = Vec::with_capacity(idx.descriptors().len());
        for descriptor in idx.descriptors() {
            if is_attestation(descriptor) {
                tracing::debug!(digest = %descriptor.digest(), "Skipping attestation manifest");
                continue;
            }
            NodeKind::classify(&descriptor.media_type().to_string(), descriptor.digest())?;

            let child = self.source.read_child(descriptor).await?;
            let flat = self.flatten(&child).await?;

            let mut kept = descriptor.clone();
            kept.set_digest(flat.digest().to_string());
            kept.set_size(flat.size());
            addenda.push(Addendum {
                descriptor: kept,
                node: flat,
            });
        }

        let mut out = ImageIndex::from_addenda(addenda)?;
        if let Some(annotations) = non_empty(idx.annotations().cloned()) {
            out = out.with_annotations(annotations)?;
        }
        out.with_media_type(idx.media_type())
    }
}

fn is_attestation(descriptor: &Descriptor) -> bool {
    descriptor.platform().as_ref().map_or(false, |p| {
        p.os().to_string() == "unknown" && p.architecture().to_string() == "unknown"
    })
}

fn non_empty(annotations: Option<HashMap<String, String>>) -> Option<HashMap<String, String>> {
    annotations.filter(|a| !a.is_empty())
}
