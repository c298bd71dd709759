//! Image layers and lazily produced layer streams.

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use oci_spec::image::{Descriptor, MediaType};
use ocifold_core::error::{FoldError, Result};
use tempfile::{NamedTempFile, TempPath};

use super::digest::HashingWriter;

/// Where a layer's compressed bytes live.
#[derive(Debug, Clone)]
pub enum LayerContent {
    /// Still in the store the image was read from.
    Source,
    /// Spooled to a local temporary file, removed when the last handle drops.
    Spooled(Arc<TempPath>),
}

/// One layer of an image: its descriptor, uncompressed diff-ID, and content.
#[derive(Debug, Clone)]
pub struct Layer {
    descriptor: Descriptor,
    diff_id: String,
    content: LayerContent,
}

impl Layer {
    /// A layer whose blob stays in the source store.
    pub fn from_source(descriptor: Descriptor, diff_id: impl Into<String>) -> Self {
        Self {
            descriptor,
            diff_id: diff_id.into(),
            content: LayerContent::Source,
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn digest(&self) -> &str {
        self.descriptor.digest()
    }

    pub fn size(&self) -> i64 {
        self.descriptor.size()
    }

    pub fn media_type(&self) -> &MediaType {
        self.descriptor.media_type()
    }

    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    pub fn content(&self) -> &LayerContent {
        &self.content
    }

    /// Path of the spooled blob, if the layer was produced locally.
    pub fn local_path(&self) -> Option<&Path> {
        match &self.content {
            LayerContent::Spooled(path) => {
                let path: &Path = path;
                Some(path)
            }
            LayerContent::Source => None,
        }
    }
}

/// Writes an uncompressed tar stream into the given sink.
pub type LayerProducer = Box<dyn FnOnce(&mut dyn Write) -> Result<()> + Send>;

#[derive(Debug)]
struct Spooled {
    digest: String,
    diff_id: String,
    size: u64,
    path: TempPath,
}

/// A layer whose bytes are produced on demand.
///
/// The producer runs once, inside [`StreamLayer::consume`], feeding
/// `tar → sha256 (diff-ID) → gzip → sha256 (digest) → temp file`. Until then
/// the digest, diff-ID and size are unknown.
pub struct StreamLayer {
    producer: Option<LayerProducer>,
    media_type: String,
    level: u32,
    spooled: Option<Spooled>,
}

impl StreamLayer {
    pub fn new(media_type: impl Into<String>, level: u32, producer: LayerProducer) -> Self {
        Self {
            producer: Some(producer),
            media_type: media_type.into(),
            level,
            spooled: None,
        }
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Run the producer to completion. Calling again after success is a no-op.
    pub async fn consume(&mut self) -> Result<()> {
        if self.spooled.is_some() {
            return Ok(());
        }
        let producer = self
            .producer
            .take()
            .ok_or_else(|| FoldError::Other("layer stream already failed".to_string()))?;
        let level = self.level;

        let spooled = tokio::task::spawn_blocking(move || spool(producer, level))
            .await
            .map_err(|e| FoldError::Other(format!("layer task failed: {}", e)))??;

        tracing::debug!(
            digest = %spooled.digest,
            diff_id = %spooled.diff_id,
            size = spooled.size,
            "Layer stream consumed"
        );
        self.spooled = Some(spooled);
        Ok(())
    }

    fn finished(&self) -> Result<&Spooled> {
        self.spooled.as_ref().ok_or(FoldError::LayerNotFinalized)
    }

    pub fn digest(&self) -> Result<&str> {
        Ok(self.finished()?.digest.as_str())
    }

    pub fn diff_id(&self) -> Result<&str> {
        Ok(self.finished()?.diff_id.as_str())
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.finished()?.size)
    }

    /// Local path of the compressed blob.
    pub fn path(&self) -> Result<&Path> {
        let path: &Path = &self.finished()?.path;
        Ok(path)
    }

    /// Turn a consumed stream into a regular layer.
    pub fn into_layer(self) -> Result<Layer> {
        let spooled = self.spooled.ok_or(FoldError::LayerNotFinalized)?;
        let descriptor = Descriptor::new(
            MediaType::from(self.media_type.as_str()),
            spooled.size as i64,
            spooled.digest,
        );
        Ok(Layer {
            descriptor,
            diff_id: spooled.diff_id,
            content: LayerContent::Spooled(Arc::new(spooled.path)),
        })
    }
}

impl std::fmt::Debug for StreamLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLayer")
            .field("media_type", &self.media_type)
            .field("level", &self.level)
            .field("spooled", &self.spooled)
            .finish()
    }
}

fn spool(producer: LayerProducer, level: u32) -> Result<Spooled> {
    let file = NamedTempFile::new()?;
    let compressed = HashingWriter::new(BufWriter::new(file));
    let gzip = GzEncoder::new(compressed, Compression::new(level));
    let mut uncompressed = HashingWriter::new(gzip);

    producer(&mut uncompressed)?;

    let (gzip, diff_id, _) = uncompressed.finish();
    let compressed = gzip.finish()?;
    let (buffered, digest, size) = compressed.finish();
    let file = buffered.into_inner().map_err(|e| e.into_error())?;

    Ok(Spooled {
        digest,
        diff_id,
        size,
        path: file.into_temp_path(),
    })
}
