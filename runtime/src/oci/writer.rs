//! ImageWriter - where flattened output goes.

use async_trait::async_trait;
use ocifold_core::error::Result;

use super::layer::StreamLayer;
use super::tree::Image;

/// Sink for the flatten engine.
///
/// The engine calls [`upload_layer`](ImageWriter::upload_layer) for every new
/// layer before it reads the layer's digest, and
/// [`commit_image`](ImageWriter::commit_image) once per finished image.
#[async_trait]
pub trait ImageWriter: Send + Sync {
    /// Consume the layer stream and make its blob available at the destination.
    async fn upload_layer(&self, layer: &mut StreamLayer) -> Result<()>;

    /// Record a finished image at the destination.
    async fn commit_image(&self, image: &Image) -> Result<()>;
}
