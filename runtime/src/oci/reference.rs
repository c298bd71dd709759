//! Registry image reference parsing.
//!
//! Turns strings like `ghcr.io/org/app:v1` or `registry.example/repo@sha256:...`
//! into a structured [`ImageReference`].

use ocifold_core::error::{FoldError, Result};
use oci_distribution::Reference;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, with port when present
    pub registry: String,
    /// Repository path within the registry
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest (`algorithm:hex`)
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `alpine` → `docker.io/library/alpine:latest`
    /// - `org/app:1.2` → `docker.io/org/app:1.2`
    /// - `localhost:5000/app` → `localhost:5000/app:latest`
    /// - `ghcr.io/org/app@sha256:...` → by digest, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(FoldError::Reference("empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(FoldError::Reference(format!(
                        "'{}': digest must be algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        if tag.as_deref() == Some("") {
            return Err(FoldError::Reference(format!("'{}': empty tag", reference)));
        }
        let (registry, repository) = split_registry(name, reference)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository` without tag or digest.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Same repository, addressed by `digest` only.
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }

    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Tag or digest as used in a `/manifests/` path. A digest wins over a tag.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Convert to an `oci-distribution` reference. A digest wins over a tag.
    pub fn to_oci_reference(&self) -> Result<Reference> {
        let reference = match (&self.digest, &self.tag) {
            (Some(digest), _) => {
                Reference::with_digest(self.registry.clone(), self.repository.clone(), digest.clone())
            }
            (None, Some(tag)) => {
                Reference::with_tag(self.registry.clone(), self.repository.clone(), tag.clone())
            }
            (None, None) => Reference::with_tag(
                self.registry.clone(),
                self.repository.clone(),
                DEFAULT_TAG.to_string(),
            ),
        };
        Ok(reference)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = FoldError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `name[:tag]`. A colon only starts a tag after the last `/`, so a
/// registry port is never mistaken for one.
fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    let last = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
    match name_tag[last..].rfind(':') {
        Some(colon) => {
            let at = last + colon;
            (&name_tag[..at], Some(name_tag[at + 1..].to_string()))
        }
        None => (name_tag, None),
    }
}

fn split_registry(name: &str, reference: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(FoldError::Reference(format!(
                    "'{}': empty repository",
                    reference
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    if name.is_empty() {
        return Err(FoldError::Reference(format!(
            "'{}': empty repository",
            reference
        )));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}
