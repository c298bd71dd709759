//! Merging a stack of layer tarballs into one filesystem stream.
//!
//! Layers are read top-down. An entry is emitted the first time its path is
//! seen, so upper layers shadow lower ones. Whiteouts follow the OCI image
//! layer rules:
//! - `.wh.<name>` hides `<name>` (and everything below it) in lower layers.
//! - `.wh..wh..opq` hides the lower-layer contents of its directory.
//!
//! Whiteout markers themselves never reach the output.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use ocifold_core::error::{FoldError, Result};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Paths already decided by an upper layer.
#[derive(Debug, Default)]
struct Shadow {
    /// Paths emitted so far
    emitted: HashSet<String>,
    /// Paths hidden together with their subtree
    hidden: HashSet<String>,
    /// Directories whose lower-layer children are hidden
    opaque: HashSet<String>,
}

impl Shadow {
    fn is_hidden(&self, path: &str) -> bool {
        if self.emitted.contains(path) || self.hidden.contains(path) {
            return true;
        }
        // An opaque marker at the layer root is recorded as "".
        self.opaque.contains("")
            || ancestors(path).any(|dir| self.hidden.contains(dir) || self.opaque.contains(dir))
    }
}

/// Strict ancestors of a slash separated path, nearest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').rev().map(move |(i, _)| &path[..i])
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_start_matches("./").trim_start_matches('/');
    trimmed.trim_end_matches('/').to_string()
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Open a layer blob, undoing gzip when the magic bytes say so.
fn open_layer(path: &Path) -> Result<Box<dyn Read>> {
    let mut file = File::open(path)
        .map_err(|e| FoldError::read(path.display().to_string(), e))?;
    let mut magic = [0u8; 4];
    let n = read_prefix(&mut file, &mut magic)?;
    file.rewind()?;
    let file = BufReader::new(file);

    if n >= 2 && magic[..2] == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(file)))
    } else if n == 4 && magic == ZSTD_MAGIC {
        Err(FoldError::UnsupportedMediaType {
            subject: path.display().to_string(),
            media_type: "application/vnd.oci.image.layer.v1.tar+zstd".to_string(),
        })
    } else {
        Ok(Box::new(file))
    }
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write the merged filesystem of `layers` (bottom layer first) as a tar
/// stream into `out`.
pub fn merge_layers(layers: &[PathBuf], out: &mut dyn Write) -> Result<()> {
    let mut builder = tar::Builder::new(out);
    let mut shadow = Shadow::default();

    for path in layers.iter().rev() {
        let mut layer_hidden = Vec::new();
        let mut layer_opaque = Vec::new();
        let mut archive = tar::Archive::new(open_layer(path)?);

        let entries = archive
            .entries()
            .map_err(|e| FoldError::read(path.display().to_string(), e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| FoldError::read(path.display().to_string(), e))?;
            let raw = entry.path()?.to_string_lossy().into_owned();
            let name = normalize(&raw);
            if name.is_empty() {
                continue;
            }

            let (dir, base) = split_parent(&name);
            if base == OPAQUE_WHITEOUT {
                layer_opaque.push(dir.to_string());
                continue;
            }
            if let Some(target) = base.strip_prefix(WHITEOUT_PREFIX) {
                layer_hidden.push(join(dir, target));
                continue;
            }

            if shadow.is_hidden(&name) {
                continue;
            }

            let mut header = entry.header().clone();
            let kind = header.entry_type();
            if kind.is_hard_link() || kind.is_symlink() {
                let target = entry
                    .link_name()?
                    .map(|t| t.into_owned())
                    .unwrap_or_default();
                builder.append_link(&mut header, &name, target)?;
            } else {
                builder.append_data(&mut header, &name, &mut entry)?;
            }

            if !kind.is_dir() {
                layer_hidden.push(name.clone());
            }
            shadow.emitted.insert(name);
        }

        tracing::debug!(
            layer = %path.display(),
            whiteouts = layer_hidden.len(),
            opaque = layer_opaque.len(),
            "Merged layer"
        );
        shadow.hidden.extend(layer_hidden);
        shadow.opaque.extend(layer_opaque);
    }

    builder.finish()?;
    Ok(())
}
