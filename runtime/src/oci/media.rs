//! Media type classification for manifest tree nodes.
//!
//! Every node in a manifest tree is either image-shaped (a single-platform
//! manifest) or index-shaped (a manifest list). Anything else is rejected.

use ocifold_core::error::{FoldError, Result};

pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Media types accepted when fetching manifests from a registry.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_INDEX,
    OCI_MANIFEST,
    DOCKER_MANIFEST_LIST,
    DOCKER_MANIFEST,
];

/// Shape of a manifest tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Image,
    Index,
}

impl NodeKind {
    /// Classify a media type. `subject` names the node in the error.
    pub fn classify(media_type: &str, subject: &str) -> Result<Self> {
        match media_type {
            OCI_MANIFEST | DOCKER_MANIFEST => Ok(NodeKind::Image),
            OCI_INDEX | DOCKER_MANIFEST_LIST => Ok(NodeKind::Index),
            other => Err(FoldError::UnsupportedMediaType {
                subject: subject.to_string(),
                media_type: other.to_string(),
            }),
        }
    }

    /// Classify a raw manifest body, returning its kind and media type.
    ///
    /// OCI allows `mediaType` to be omitted; such bodies are classified by
    /// shape and assumed to carry the OCI media type.
    pub fn sniff(body: &[u8], subject: &str) -> Result<(Self, String)> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| FoldError::read(subject, e))?;

        if let Some(media_type) = value.get("mediaType").and_then(|m| m.as_str()) {
            let kind = Self::classify(media_type, subject)?;
            return Ok((kind, media_type.to_string()));
        }

        if value.get("manifests").is_some() {
            Ok((NodeKind::Index, OCI_INDEX.to_string()))
        } else if value.get("config").is_some() && value.get("layers").is_some() {
            Ok((NodeKind::Image, OCI_MANIFEST.to_string()))
        } else {
            Err(FoldError::UnsupportedMediaType {
                subject: subject.to_string(),
                media_type: "<none>".to_string(),
            })
        }
    }
}

/// Media type family of a synthesised image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFamily {
    Oci,
    Docker,
}

impl MediaFamily {
    /// Family of an image manifest media type. Unknown types count as OCI.
    pub fn of_manifest(media_type: &str) -> Self {
        if media_type == DOCKER_MANIFEST {
            MediaFamily::Docker
        } else {
            MediaFamily::Oci
        }
    }

    pub fn manifest(self) -> &'static str {
        match self {
            MediaFamily::Oci => OCI_MANIFEST,
            MediaFamily::Docker => DOCKER_MANIFEST,
        }
    }

    pub fn config(self) -> &'static str {
        match self {
            MediaFamily::Oci => OCI_CONFIG,
            MediaFamily::Docker => DOCKER_CONFIG,
        }
    }

    pub fn layer(self) -> &'static str {
        match self {
            MediaFamily::Oci => OCI_LAYER_GZIP,
            MediaFamily::Docker => DOCKER_LAYER_GZIP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_types() {
        assert_eq!(NodeKind::classify(OCI_MANIFEST, "x").unwrap(), NodeKind::Image);
        assert_eq!(NodeKind::classify(DOCKER_MANIFEST, "x").unwrap(), NodeKind::Image);
        assert_eq!(NodeKind::classify(OCI_INDEX, "x").unwrap(), NodeKind::Index);
        assert_eq!(
            NodeKind::classify(DOCKER_MANIFEST_LIST, "x").unwrap(),
            NodeKind::Index
        );
    }

    #[test]
    fn test_classify_unknown_type() {
        let err = NodeKind::classify(OCI_CONFIG, "sha256:abc").unwrap_err();
        match err {
            FoldError::UnsupportedMediaType {
                subject,
                media_type,
            } => {
                assert_eq!(subject, "sha256:abc");
                assert_eq!(media_type, OCI_CONFIG);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sniff_explicit_media_type() {
        let body = format!(r#"{{"schemaVersion":2,"mediaType":"{DOCKER_MANIFEST_LIST}","manifests":[]}}"#);
        let (kind, mt) = NodeKind::sniff(body.as_bytes(), "x").unwrap();
        assert_eq!(kind, NodeKind::Index);
        assert_eq!(mt, DOCKER_MANIFEST_LIST);
    }

    #[test]
    fn test_sniff_by_shape() {
        let (kind, mt) = NodeKind::sniff(br#"{"schemaVersion":2,"manifests":[]}"#, "x").unwrap();
        assert_eq!(kind, NodeKind::Index);
        assert_eq!(mt, OCI_INDEX);

        let (kind, mt) =
            NodeKind::sniff(br#"{"schemaVersion":2,"config":{},"layers":[]}"#, "x").unwrap();
        assert_eq!(kind, NodeKind::Image);
        assert_eq!(mt, OCI_MANIFEST);
    }

    #[test]
    fn test_sniff_rejects_unknown_shape() {
        assert!(NodeKind::sniff(br#"{"schemaVersion":2}"#, "x").is_err());
        assert!(NodeKind::sniff(b"not json", "x").is_err());
    }

    #[test]
    fn test_family_types() {
        assert_eq!(MediaFamily::of_manifest(DOCKER_MANIFEST), MediaFamily::Docker);
        assert_eq!(MediaFamily::of_manifest(OCI_MANIFEST), MediaFamily::Oci);
        assert_eq!(MediaFamily::Docker.layer(), DOCKER_LAYER_GZIP);
        assert_eq!(MediaFamily::Oci.config(), OCI_CONFIG);
    }
}
