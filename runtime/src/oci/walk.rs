//! Locating one platform's image inside a manifest tree.

use futures::future::{BoxFuture, FutureExt};
use oci_spec::image::Descriptor;
use ocifold_core::config::TargetPlatform;
use ocifold_core::error::{FoldError, Result};

use super::media::NodeKind;
use super::source::ImageSource;
use super::tree::{Image, ImageIndex, Node};

/// Descriptor filter used while walking.
pub type Matcher<'a> = dyn Fn(&Descriptor) -> bool + Send + Sync + 'a;

/// Walk `index` looking for an image whose descriptor satisfies `matcher`.
///
/// The first nested index met is descended into and its result returned,
/// without looking at later siblings. Image children are tested in order.
/// Children of any other media type are ignored. Fails once `depth` reaches
/// `max_depth`.
pub fn walk<'a>(
    source: &'a dyn ImageSource,
    index: &'a ImageIndex,
    matcher: &'a Matcher<'a>,
    depth: usize,
    max_depth: usize,
) -> BoxFuture<'a, Result<Option<Image>>> {
    async move {
        if depth >= max_depth {
            return Err(FoldError::MaxDepthExceeded { depth });
        }

        for descriptor in index.descriptors() {
            let media_type = descriptor.media_type().to_string();
            match NodeKind::classify(&media_type, descriptor.digest()) {
                Ok(NodeKind::Index) => {
                    tracing::debug!(digest = %descriptor.digest(), depth, "Descending into index");
                    let child = expect_index(source.read_child(descriptor).await?, descriptor)?;
                    return walk(source, &child, matcher, depth + 1, max_depth).await;
                }
                Ok(NodeKind::Image) if matcher(descriptor) => {
                    let img = expect_image(source.read_child(descriptor).await?, descriptor)?;
                    return Ok(Some(img));
                }
                _ => {}
            }
        }
        Ok(None)
    }
    .boxed()
}

/// Resolve the source and find an image satisfying `matcher`.
///
/// An image root is tested against the platform in its config.
pub async fn find_image(
    source: &dyn ImageSource,
    matcher: &Matcher<'_>,
    max_depth: usize,
) -> Result<Option<Image>> {
    match source.resolve().await? {
        Node::Index(idx) => walk(source, &idx, matcher, 0, max_depth).await,
        Node::Image(img) => {
            let mut descriptor = img.descriptor();
            descriptor.set_platform(Some(img.platform()?));
            Ok(matcher(&descriptor).then_some(img))
        }
    }
}

/// Matcher accepting descriptors whose platform equals `wanted`. The variant
/// is only compared when `wanted` names one.
pub fn platform_matcher(wanted: &TargetPlatform) -> impl Fn(&Descriptor) -> bool + Send + Sync {
    let wanted = wanted.clone();
    move |descriptor: &Descriptor| {
        let Some(platform) = descriptor.platform().as_ref() else {
            return false;
        };
        if platform.os().to_string() != wanted.os
            || platform.architecture().to_string() != wanted.architecture
        {
            return false;
        }
        match &wanted.variant {
            Some(variant) => platform.variant().as_deref() == Some(variant.as_str()),
            None => true,
        }
    }
}

fn expect_index(node: Node, descriptor: &Descriptor) -> Result<ImageIndex> {
    match node {
        Node::Index(idx) => Ok(idx),
        Node::Image(_) => Err(FoldError::read(
            descriptor.digest(),
            "descriptor names an index but the manifest is an image",
        )),
    }
}

fn expect_image(node: Node, descriptor: &Descriptor) -> Result<Image> {
    match node {
        Node::Image(img) => Ok(img),
        Node::Index(_) => Err(FoldError::read(
            descriptor.digest(),
            "descriptor names an image but the manifest is an index",
        )),
    }
}
