//! OCI image layout directories.
//!
//! A layout is a directory holding:
//! - `oci-layout`
//! - `index.json`
//! - `blobs/<algorithm>/<hex>`
//!
//! [`LayoutSource`] reads one; [`LocalWriter`] creates or extends one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_spec::image::{Descriptor, ImageIndex as IndexManifest, ImageIndexBuilder, SCHEMA_VERSION};
use ocifold_core::error::{FoldError, Result};

use super::digest::{sha256_digest, split_digest, verify};
use super::layer::StreamLayer;
use super::media::{NodeKind, OCI_INDEX};
use super::source::ImageSource;
use super::tree::{Image, Node};
use super::writer::ImageWriter;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

/// Path of a blob inside a layout rooted at `root`.
pub fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    let (algorithm, encoded) = split_digest(digest)?;
    Ok(root.join("blobs").join(algorithm).join(encoded))
}

/// Reads a manifest tree out of an OCI layout.
#[derive(Debug, Clone)]
pub struct LayoutSource {
    root: PathBuf,
}

impl LayoutSource {
    /// Open a layout. Fails unless `index.json` is present.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.join(INDEX_FILE).is_file() {
            return Err(FoldError::read(
                root.display().to_string(),
                "not an OCI layout: missing index.json",
            ));
        }
        Ok(Self { root })
    }

    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = blob_path(&self.root, digest)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| FoldError::read(digest, format!("{}: {}", path.display(), e)))
    }

    async fn read_index_json(&self) -> Result<Vec<u8>> {
        let path = self.root.join(INDEX_FILE);
        tokio::fs::read(&path)
            .await
            .map_err(|e| FoldError::read(path.display().to_string(), e))
    }
}

#[async_trait]
impl ImageSource for LayoutSource {
    async fn resolve(&self) -> Result<Node> {
        let raw = self.read_index_json().await?;
        let subject = self.root.join(INDEX_FILE).display().to_string();
        self.node_from_raw(raw, Some(OCI_INDEX), &subject).await
    }

    async fn read_manifest(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let raw = self.read_blob(descriptor.digest()).await?;
        verify(&raw, descriptor.digest())?;
        Ok(raw)
    }

    async fn read_config(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        let raw = self.read_blob(descriptor.digest()).await?;
        verify(&raw, descriptor.digest())?;
        Ok(raw)
    }

    async fn fetch_blob(&self, descriptor: &Descriptor, _scratch: &Path) -> Result<PathBuf> {
        let path = blob_path(&self.root, descriptor.digest())?;
        if !path.is_file() {
            return Err(FoldError::read(
                descriptor.digest(),
                format!("blob missing from layout {}", self.root.display()),
            ));
        }
        Ok(path)
    }

    async fn head(&self) -> Result<Descriptor> {
        let raw = self.read_index_json().await?;
        let subject = self.root.join(INDEX_FILE).display().to_string();
        let (_, media_type) = NodeKind::sniff(&raw, &subject)?;
        Ok(Descriptor::new(
            media_type.as_str().into(),
            raw.len() as i64,
            sha256_digest(&raw),
        ))
    }
}

/// Writes committed images into an OCI layout.
///
/// Each committed image is appended to `index.json` on its own. When a
/// flatten of several siblings fails part way, the images committed before
/// the failure stay in the layout.
#[derive(Debug, Clone)]
pub struct LocalWriter {
    root: PathBuf,
}

impl LocalWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn ensure_layout(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.root.join("blobs").join("sha256"))
            .await
            .map_err(|e| self.commit_error(format!("creating layout: {}", e)))?;

        let marker = self.root.join(OCI_LAYOUT_FILE);
        if !marker.exists() {
            tokio::fs::write(&marker, OCI_LAYOUT_CONTENT).await?;
        }
        if !self.root.join(INDEX_FILE).exists() {
            let empty = empty_index()?;
            self.write_index(&empty).await?;
        }
        Ok(())
    }

    /// Write a blob unless the layout already holds it.
    async fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = blob_path(&self.root, digest)?;
        if path.exists() {
            return Ok(());
        }
        write_atomic(&path, data).await
    }

    async fn copy_blob(&self, digest: &str, from: &Path) -> Result<()> {
        let path = blob_path(&self.root, digest)?;
        if path.exists() {
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::copy(from, &tmp).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_index(&self) -> Result<IndexManifest> {
        let raw = tokio::fs::read(self.root.join(INDEX_FILE)).await?;
        serde_json::from_slice(&raw)
            .map_err(|e| self.commit_error(format!("invalid index.json: {}", e)))
    }

    async fn write_index(&self, index: &IndexManifest) -> Result<()> {
        let data = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.root.join(INDEX_FILE), &data).await
    }

    fn commit_error(&self, message: String) -> FoldError {
        FoldError::Commit {
            subject: self.root.display().to_string(),
            message,
        }
    }
}

#[async_trait]
impl ImageWriter for LocalWriter {
    async fn upload_layer(&self, _layer: &mut StreamLayer) -> Result<()> {
        Ok(())
    }

    async fn commit_image(&self, image: &Image) -> Result<()> {
        self.ensure_layout().await?;

        self.write_blob(image.config_descriptor().digest(), image.raw_config())
            .await?;
        for layer in image.layers() {
            match layer.local_path() {
                Some(path) => self.copy_blob(layer.digest(), path).await?,
                None => {
                    if !blob_path(&self.root, layer.digest())?.exists() {
                        return Err(self.commit_error(format!(
                            "layer {} is not available locally",
                            layer.digest()
                        )));
                    }
                }
            }
        }
        self.write_blob(image.digest(), image.raw_manifest()).await?;

        let mut index = self.read_index().await?;
        let mut manifests = index.manifests().clone();
        if manifests.iter().any(|d| d.digest() == image.digest()) {
            tracing::debug!(digest = %image.digest(), "Image already in layout index");
            return Ok(());
        }
        let mut descriptor = image.descriptor();
        descriptor.set_platform(Some(image.platform()?));
        manifests.push(descriptor);
        index.set_manifests(manifests);
        self.write_index(&index).await?;

        tracing::debug!(
            digest = %image.digest(),
            layout = %self.root.display(),
            "Committed image to layout"
        );
        Ok(())
    }
}

fn empty_index() -> Result<IndexManifest> {
    ImageIndexBuilder::default()
        .schema_version(SCHEMA_VERSION)
        .manifests(Vec::new())
        .build()
        .map_err(|e| FoldError::Other(format!("failed to build image index: {}", e)))
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
