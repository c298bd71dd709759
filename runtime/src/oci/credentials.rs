//! Per-user registry credentials.
//!
//! Credentials live in `~/.ocifold/auth/credentials.json` and are rewritten
//! atomically (temp file, then rename).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ocifold_core::error::{FoldError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Login {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LoginFile {
    #[serde(default)]
    registries: BTreeMap<String, Login>,
}

/// File-backed credential store keyed by registry host.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.ocifold/auth/credentials.json`.
    pub fn open_default() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            FoldError::Config("cannot locate home directory for credentials".to_string())
        })?;
        Ok(Self::new(home.join(".ocifold").join("auth").join("credentials.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save a login, replacing any previous one for the registry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.read()?;
        file.registries.insert(
            registry_key(registry),
            Login {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.write(&file)
    }

    /// Look up `(username, password)` for a registry.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        Ok(self
            .read()?
            .registries
            .remove(&registry_key(registry))
            .map(|login| (login.username, login.password)))
    }

    /// Forget a registry. Returns whether a login was stored.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.read()?;
        if file.registries.remove(&registry_key(registry)).is_none() {
            return Ok(false);
        }
        self.write(&file)?;
        Ok(true)
    }

    fn read(&self) -> Result<LoginFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LoginFile::default())
            }
            Err(e) => {
                return Err(FoldError::Config(format!(
                    "Failed to read credentials {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&data).map_err(|e| {
            FoldError::Config(format!(
                "Failed to parse credentials {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write(&self, file: &LoginFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Docker Hub goes by several host names; they share one entry.
fn registry_key(registry: &str) -> String {
    let host = registry.trim().to_ascii_lowercase();
    match host.as_str() {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        _ => host,
    }
}
