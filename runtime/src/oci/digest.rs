//! Content digests.

use std::io::{self, Read, Write};
use std::path::Path;

use ocifold_core::error::{FoldError, Result};
use sha2::{Digest, Sha256};

/// `sha256:<hex>` of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// `sha256:<hex>` of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Split `algorithm:hex`, rejecting anything that could escape a blob directory.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let (algorithm, encoded) = digest
        .split_once(':')
        .ok_or_else(|| FoldError::read(digest, "digest must be algorithm:hex"))?;
    let valid_alg = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
    let valid_hex = !encoded.is_empty() && encoded.chars().all(|c| c.is_ascii_alphanumeric());
    if !valid_alg || !valid_hex {
        return Err(FoldError::read(digest, "malformed digest"));
    }
    Ok((algorithm, encoded))
}

/// Fail unless `data` hashes to `expected`.
pub fn verify(data: &[u8], expected: &str) -> Result<()> {
    let (algorithm, _) = split_digest(expected)?;
    if algorithm != "sha256" {
        return Err(FoldError::read(
            expected,
            format!("unsupported digest algorithm {}", algorithm),
        ));
    }
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(FoldError::read(
            expected,
            format!("content digest mismatch (got {})", actual),
        ));
    }
    Ok(())
}

/// Writer adapter that hashes and counts everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Return the inner writer, the `sha256:` digest and byte count.
    pub fn finish(self) -> (W, String, u64) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_sha256_digest_empty() {
        assert_eq!(sha256_digest(b""), EMPTY);
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_digest(b"hello"));
    }

    #[test]
    fn test_split_digest() {
        assert_eq!(split_digest("sha256:abc").unwrap(), ("sha256", "abc"));
        assert!(split_digest("sha256").is_err());
        assert!(split_digest("sha256:../../etc").is_err());
        assert!(split_digest(":abc").is_err());
    }

    #[test]
    fn test_verify() {
        assert!(verify(b"", EMPTY).is_ok());
        let err = verify(b"x", EMPTY).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
        assert!(verify(b"", "sha512:abc").is_err());
    }

    #[test]
    fn test_hashing_writer_counts_and_hashes() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hel").unwrap();
        writer.write_all(b"lo").unwrap();
        let (inner, digest, written) = writer.finish();
        assert_eq!(inner, b"hello");
        assert_eq!(written, 5);
        assert_eq!(digest, sha256_digest(b"hello"));
    }
}
