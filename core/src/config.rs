use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FoldError, Result};

/// Default ceiling for nested index traversal.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Default gzip level for flattened layers (best compression).
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

/// Default tool name recorded in flatten history entries.
pub const DEFAULT_TOOL_NAME: &str = "ocifold";

/// ocifold configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FoldConfig {
    /// Maximum index nesting depth before a walk fails
    pub max_depth: usize,

    /// Gzip compression level (0-9) for flattened layers
    pub compression_level: u32,

    /// Platform used when a caller does not name one
    pub default_platform: TargetPlatform,

    /// Name recorded in the `created_by` field of flatten history
    pub tool_name: String,

    /// Registries reached over plain HTTP
    pub insecure_registries: Vec<String>,
}

impl Default for FoldConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            default_platform: TargetPlatform::default(),
            tool_name: DEFAULT_TOOL_NAME.to_string(),
            insecure_registries: Vec::new(),
        }
    }
}

impl FoldConfig {
    /// Load configuration from a YAML file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            FoldError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: FoldConfig = serde_yaml::from_str(&data)?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load `~/.ocifold/config.yaml` if it exists, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Path of the per-user configuration file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ocifold").join("config.yaml"))
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(FoldError::Config(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.max_depth == 0 {
            return Err(FoldError::Config(
                "max_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the registry should be reached over plain HTTP.
    pub fn is_insecure(&self, registry: &str) -> bool {
        self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// An `os/architecture[/variant]` platform selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetPlatform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Default for TargetPlatform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

impl std::fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for TargetPlatform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(format!(
                "invalid platform '{}' (expected os/arch[/variant])",
                s
            )),
        }
    }
}

impl TryFrom<String> for TargetPlatform {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TargetPlatform> for String {
    fn from(platform: TargetPlatform) -> Self {
        platform.to_string()
    }
}
