//! Checksums of finished artifacts, computed off the hot path in 1 MiB
//! chunks.

use crate::error::Result;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Hex MD5 of a file.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut hasher = Md5::new();
    digest_file(path, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a file.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    digest_file(path, |chunk| hasher.update(chunk))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Both digests in a single pass over the file.
pub fn file_md5_sha256(path: &Path) -> Result<(String, String)> {
    let mut md5 = Md5::new();
    let mut sha = Sha256::new();
    digest_file(path, |chunk| {
        md5.update(chunk);
        sha.update(chunk);
    })?;
    Ok((hex::encode(md5.finalize()), hex::encode(sha.finalize())))
}

fn digest_file(path: &Path, mut update: impl FnMut(&[u8])) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        update(&buf[..n]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello");
        std::fs::write(&path, b"hello world!").unwrap();

        assert_eq!(file_md5(&path).unwrap(), "fc3ff98e8c6a0d3087d515c0473f8677");
        assert_eq!(
            file_sha256(&path).unwrap(),
            "7509e5bda0c762d2bac7f90d758b5b2263fa01ccbc542ab5e3df163be08e6ca9"
        );

        let (md5, sha) = file_md5_sha256(&path).unwrap();
        assert_eq!(md5, file_md5(&path).unwrap());
        assert_eq!(sha, file_sha256(&path).unwrap());
    }
}
