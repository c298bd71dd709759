//! Manifest tree model.
//!
//! A tree node is either an [`Image`] (one platform: manifest, config and
//! layers) or an [`ImageIndex`] (a list of descriptors pointing at further
//! nodes). Nodes read from a store keep their exact manifest bytes so the
//! digest always matches what the store returned. Mutations consume the node
//! and return a new one with every derived field recomputed.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use oci_spec::image::{
    Descriptor, History, ImageConfiguration, ImageIndex as IndexManifest, ImageIndexBuilder,
    ImageManifest, ImageManifestBuilder, MediaType, Platform, PlatformBuilder, SCHEMA_VERSION,
};
use ocifold_core::error::{FoldError, Result};

use super::digest::sha256_digest;
use super::layer::Layer;
use super::media::{MediaFamily, NodeKind, OCI_INDEX};

/// A single-platform image.
///
/// The config is held twice: as the JSON document it was read from, which
/// is what gets edited and written back, and as a typed view of it.
#[derive(Debug, Clone)]
pub struct Image {
    manifest: ImageManifest,
    raw_manifest: Vec<u8>,
    digest: String,
    media_type: String,
    config: ImageConfiguration,
    config_document: Map<String, Value>,
    raw_config: Vec<u8>,
    layers: Vec<Layer>,
}

impl Image {
    /// Build an image from manifest and config bytes exactly as stored.
    ///
    /// `media_type` is the manifest media type, used when the body omits it.
    pub fn from_raw(raw_manifest: Vec<u8>, media_type: &str, raw_config: Vec<u8>) -> Result<Self> {
        let digest = sha256_digest(&raw_manifest);
        let manifest: ImageManifest = serde_json::from_slice(&raw_manifest)
            .map_err(|e| FoldError::read(&digest, format!("invalid image manifest: {}", e)))?;
        let invalid_config = |e: serde_json::Error| {
            FoldError::read(
                manifest.config().digest(),
                format!("invalid image config: {}", e),
            )
        };
        let config: ImageConfiguration =
            serde_json::from_slice(&raw_config).map_err(invalid_config)?;
        let config_document: Map<String, Value> =
            serde_json::from_slice(&raw_config).map_err(invalid_config)?;

        let diff_ids = config.rootfs().diff_ids();
        if diff_ids.len() != manifest.layers().len() {
            return Err(FoldError::read(
                &digest,
                format!(
                    "config lists {} diff_ids but manifest has {} layers",
                    diff_ids.len(),
                    manifest.layers().len()
                ),
            ));
        }
        let layers = manifest
            .layers()
            .iter()
            .zip(diff_ids)
            .map(|(desc, diff_id)| Layer::from_source(desc.clone(), diff_id.clone()))
            .collect();

        let media_type = manifest
            .media_type()
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| media_type.to_string());

        Ok(Self {
            manifest,
            raw_manifest,
            digest,
            media_type,
            config,
            config_document,
            raw_config,
            layers,
        })
    }

    /// An image with no layers and a default config, in the given media type family.
    pub fn empty(family: MediaFamily) -> Result<Self> {
        let config = ImageConfiguration::default();
        let raw_config = serde_json::to_vec(&config)?;
        let config_document: Map<String, Value> = serde_json::from_slice(&raw_config)?;
        let config_descriptor = Descriptor::new(
            MediaType::from(family.config()),
            raw_config.len() as i64,
            sha256_digest(&raw_config),
        );
        let manifest = ImageManifestBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::from(family.manifest()))
            .config(config_descriptor)
            .layers(Vec::new())
            .build()
            .map_err(|e| FoldError::Other(format!("failed to build image manifest: {}", e)))?;
        let raw_manifest = serde_json::to_vec(&manifest)?;

        Ok(Self {
            digest: sha256_digest(&raw_manifest),
            manifest,
            raw_manifest,
            media_type: family.manifest().to_string(),
            config,
            config_document,
            raw_config,
            layers: Vec::new(),
        })
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    pub fn raw_manifest(&self) -> &[u8] {
        &self.raw_manifest
    }

    pub fn config(&self) -> &ImageConfiguration {
        &self.config
    }

    /// The config as a JSON object, including fields the typed view omits.
    pub fn config_document(&self) -> &Map<String, Value> {
        &self.config_document
    }

    pub fn raw_config(&self) -> &[u8] {
        &self.raw_config
    }

    pub fn config_descriptor(&self) -> &Descriptor {
        self.manifest.config()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// `sha256` of the manifest bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn size(&self) -> i64 {
        self.raw_manifest.len() as i64
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn family(&self) -> MediaFamily {
        MediaFamily::of_manifest(&self.media_type)
    }

    pub fn annotations(&self) -> Option<&HashMap<String, String>> {
        self.manifest.annotations().as_ref()
    }

    /// Platform recorded in the image config.
    pub fn platform(&self) -> Result<Platform> {
        let mut builder = PlatformBuilder::default()
            .architecture(self.config.architecture().clone())
            .os(self.config.os().clone());
        if let Some(variant) = self.config.variant() {
            builder = builder.variant(variant.clone());
        }
        builder
            .build()
            .map_err(|e| FoldError::Other(format!("failed to build platform: {}", e)))
    }

    /// Descriptor addressing this image's manifest.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            MediaType::from(self.media_type.as_str()),
            self.size(),
            self.digest.clone(),
        )
    }

    /// Replace the config document. Its `rootfs.diff_ids` are rewritten to
    /// match the image's current layers; every other field is kept as given.
    pub fn with_config(mut self, document: Map<String, Value>) -> Result<Self> {
        self.config_document = document;
        self.rebuild()
    }

    /// Append a layer and its history entry.
    pub fn append_layer(mut self, layer: Layer, history: History) -> Result<Self> {
        let entry = serde_json::to_value(&history)?;
        match self.config_document.get_mut("history") {
            Some(Value::Array(entries)) => entries.push(entry),
            _ => {
                self.config_document
                    .insert("history".to_string(), Value::Array(vec![entry]));
            }
        }
        self.layers.push(layer);
        self.rebuild()
    }

    /// Merge `annotations` into the manifest annotations. New keys win.
    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Result<Self> {
        let mut merged = self.manifest.annotations().clone().unwrap_or_default();
        merged.extend(annotations);
        self.manifest.set_annotations(Some(merged));
        self.rebuild()
    }

    /// Re-derive config bytes, manifest and digest from the owned values.
    fn rebuild(mut self) -> Result<Self> {
        let family = self.family();

        let diff_ids: Vec<Value> = self
            .layers
            .iter()
            .map(|l| Value::String(l.diff_id().to_string()))
            .collect();
        match self.config_document.get_mut("rootfs") {
            Some(Value::Object(rootfs)) => {
                rootfs
                    .entry("type")
                    .or_insert_with(|| Value::String("layers".to_string()));
                rootfs.insert("diff_ids".to_string(), Value::Array(diff_ids));
            }
            _ => {
                self.config_document.insert(
                    "rootfs".to_string(),
                    json!({ "type": "layers", "diff_ids": diff_ids }),
                );
            }
        }
        self.raw_config = serde_json::to_vec(&self.config_document)?;
        self.config = serde_json::from_slice(&self.raw_config)?;

        let config_descriptor = Descriptor::new(
            MediaType::from(family.config()),
            self.raw_config.len() as i64,
            sha256_digest(&self.raw_config),
        );
        self.manifest.set_config(config_descriptor);
        self.manifest
            .set_layers(self.layers.iter().map(|l| l.descriptor().clone()).collect());
        self.manifest
            .set_media_type(Some(MediaType::from(self.media_type.as_str())));

        self.raw_manifest = serde_json::to_vec(&self.manifest)?;
        self.digest = sha256_digest(&self.raw_manifest);
        Ok(self)
    }
}

/// A multi-platform index.
#[derive(Debug, Clone)]
pub struct ImageIndex {
    manifest: IndexManifest,
    raw_manifest: Vec<u8>,
    digest: String,
    media_type: String,
    children: Vec<Node>,
}

/// A descriptor paired with the node it points at.
#[derive(Debug, Clone)]
pub struct Addendum {
    pub descriptor: Descriptor,
    pub node: Node,
}

impl ImageIndex {
    /// Build an index from its manifest bytes exactly as stored.
    pub fn from_raw(raw_manifest: Vec<u8>, media_type: &str) -> Result<Self> {
        let digest = sha256_digest(&raw_manifest);
        let manifest: IndexManifest = serde_json::from_slice(&raw_manifest)
            .map_err(|e| FoldError::read(&digest, format!("invalid image index: {}", e)))?;
        let media_type = manifest
            .media_type()
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| media_type.to_string());

        Ok(Self {
            manifest,
            raw_manifest,
            digest,
            media_type,
            children: Vec::new(),
        })
    }

    /// A fresh OCI index holding `addenda` in order.
    pub fn from_addenda(addenda: Vec<Addendum>) -> Result<Self> {
        let (descriptors, children): (Vec<_>, Vec<_>) = addenda
            .into_iter()
            .map(|a| (a.descriptor, a.node))
            .unzip();
        let manifest = ImageIndexBuilder::default()
            .schema_version(SCHEMA_VERSION)
            .media_type(MediaType::from(OCI_INDEX))
            .manifests(descriptors)
            .build()
            .map_err(|e| FoldError::Other(format!("failed to build image index: {}", e)))?;

        Self {
            manifest,
            raw_manifest: Vec::new(),
            digest: String::new(),
            media_type: OCI_INDEX.to_string(),
            children,
        }
        .rebuild()
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn raw_manifest(&self) -> &[u8] {
        &self.raw_manifest
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        self.manifest.manifests()
    }

    /// Nodes owned by an index built in memory, in manifest order. Empty for
    /// indices read from a store.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn size(&self) -> i64 {
        self.raw_manifest.len() as i64
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn annotations(&self) -> Option<&HashMap<String, String>> {
        self.manifest.annotations().as_ref()
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            MediaType::from(self.media_type.as_str()),
            self.size(),
            self.digest.clone(),
        )
    }

    /// Merge `annotations` into the index annotations. New keys win.
    pub fn with_annotations(mut self, annotations: HashMap<String, String>) -> Result<Self> {
        let mut merged = self.manifest.annotations().clone().unwrap_or_default();
        merged.extend(annotations);
        self.manifest.set_annotations(Some(merged));
        self.rebuild()
    }

    pub fn with_media_type(mut self, media_type: &str) -> Result<Self> {
        self.media_type = media_type.to_string();
        self.rebuild()
    }

    fn rebuild(mut self) -> Result<Self> {
        self.manifest
            .set_media_type(Some(MediaType::from(self.media_type.as_str())));
        self.raw_manifest = serde_json::to_vec(&self.manifest)?;
        self.digest = sha256_digest(&self.raw_manifest);
        Ok(self)
    }
}

/// A manifest tree node.
#[derive(Debug, Clone)]
pub enum Node {
    Image(Image),
    Index(ImageIndex),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Image(_) => NodeKind::Image,
            Node::Index(_) => NodeKind::Index,
        }
    }

    pub fn digest(&self) -> &str {
        match self {
            Node::Image(img) => img.digest(),
            Node::Index(idx) => idx.digest(),
        }
    }

    pub fn size(&self) -> i64 {
        match self {
            Node::Image(img) => img.size(),
            Node::Index(idx) => idx.size(),
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            Node::Image(img) => img.media_type(),
            Node::Index(idx) => idx.media_type(),
        }
    }

    pub fn raw_manifest(&self) -> &[u8] {
        match self {
            Node::Image(img) => img.raw_manifest(),
            Node::Index(idx) => idx.raw_manifest(),
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        match self {
            Node::Image(img) => img.descriptor(),
            Node::Index(idx) => idx.descriptor(),
        }
    }
}
