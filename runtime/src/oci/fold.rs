//! Entry points used by the command line.
//!
//! Each function binds a source and a writer for one kind of destination and
//! runs the flatten engine or the platform walker over them.

use std::path::{Path, PathBuf};

use oci_spec::image::Descriptor;
use ocifold_core::config::{FoldConfig, TargetPlatform};
use ocifold_core::error::{FoldError, Result};

use super::flatten::{FlattenOptions, Flattener};
use super::layout::{LayoutSource, LocalWriter};
use super::reference::ImageReference;
use super::registry::{RegistryAuth, RegistrySource, RemoteWriter};
use super::source::ImageSource;
use super::tree::Image;
use super::walk::{find_image, platform_matcher};

/// Where a flatten reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Registry reference (default)
    #[default]
    Tarball,
    /// Registry reference
    Legacy,
    /// OCI layout directory
    Oci,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Tarball => write!(f, "tarball"),
            Format::Legacy => write!(f, "legacy"),
            Format::Oci => write!(f, "oci"),
        }
    }
}

impl std::str::FromStr for Format {
    type Err = FoldError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tarball" => Ok(Format::Tarball),
            "legacy" => Ok(Format::Legacy),
            "oci" => Ok(Format::Oci),
            other => Err(FoldError::Config(format!(
                "unknown format '{}' (expected tarball, legacy or oci)",
                other
            ))),
        }
    }
}

/// A parsed flatten source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Layout(PathBuf),
    Registry(ImageReference),
}

impl SourceRef {
    pub fn parse(source: &str, format: Format) -> Result<Self> {
        match format {
            Format::Oci => Ok(SourceRef::Layout(PathBuf::from(source))),
            Format::Tarball | Format::Legacy => {
                Ok(SourceRef::Registry(ImageReference::parse(source)?))
            }
        }
    }
}

/// References for a finished remote flatten: where the tree is pushed and
/// what is reported back.
///
/// A source addressed by digest is pushed by the new digest, since its old
/// digest cannot name the new content. The reported reference always names
/// the new digest.
pub fn destination_references(
    src: &ImageReference,
    dst: &ImageReference,
    digest: &str,
) -> (ImageReference, ImageReference) {
    let by_digest = dst.with_digest(digest);
    let push = if src.is_digest() {
        by_digest.clone()
    } else {
        dst.clone()
    };
    (push, by_digest)
}

/// Flatten a registry image or index and push the result.
///
/// `dst` defaults to `src`. Reads use `src_auth` and pushes use `dst_auth`.
/// Returns `repository@<new digest>`.
pub async fn flatten_remote(
    src: &ImageReference,
    dst: Option<&ImageReference>,
    src_auth: &RegistryAuth,
    dst_auth: &RegistryAuth,
    config: &FoldConfig,
) -> Result<ImageReference> {
    let dst = dst.unwrap_or(src);
    tracing::info!(source = %src, destination = %dst, "Flattening remote image");

    let source = RegistrySource::new(src.clone(), src_auth, config);
    let writer = RemoteWriter::new(dst, dst_auth, config);
    let root = source.resolve().await?;

    let flattener = Flattener::new(&source, &writer, FlattenOptions::from(config));
    let flat = flattener.flatten(&root).await?;

    let (push, reported) = destination_references(src, dst, flat.digest());
    writer.push_tree(&flat, &push).await?;
    Ok(reported)
}

/// Flatten every image in the layout at `src` into the layout at `dst`.
pub async fn flatten_layout(src: &Path, dst: Option<&Path>, config: &FoldConfig) -> Result<PathBuf> {
    let dst = dst.ok_or_else(|| {
        FoldError::Config("a destination directory is required for the oci format".to_string())
    })?;
    if same_location(src, dst) {
        return Err(FoldError::DestructiveWrite {
            path: dst.display().to_string(),
        });
    }

    tracing::info!(
        source = %src.display(),
        destination = %dst.display(),
        "Flattening OCI layout"
    );
    let source = LayoutSource::open(src)?;
    let writer = LocalWriter::new(dst);
    let root = source.resolve().await?;

    Flattener::new(&source, &writer, FlattenOptions::from(config))
        .flatten(&root)
        .await?;
    Ok(dst.to_path_buf())
}

/// Find the image for `platform` in the layout at `path`.
pub async fn read_platform_image(
    path: &Path,
    platform: &TargetPlatform,
    config: &FoldConfig,
) -> Result<Image> {
    let source = LayoutSource::open(path)?;
    let matcher = platform_matcher(platform);
    find_image(&source, &matcher, config.max_depth)
        .await?
        .ok_or_else(|| FoldError::PlatformNotFound {
            platform: platform.to_string(),
        })
}

/// Descriptor of the manifest `reference` points at.
pub async fn head(
    reference: &ImageReference,
    auth: &RegistryAuth,
    config: &FoldConfig,
) -> Result<Descriptor> {
    RegistrySource::new(reference.clone(), auth, config)
        .head()
        .await
}

fn same_location(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
