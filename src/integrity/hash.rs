use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// Chunk size for streaming hashes, bounding memory for multi-GiB inputs.
const CHUNK: usize = 1 << 20;

/// Lowercase hex SHA-256 over the byte stream of `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open for hash {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over `key || NUL || value || NUL` for each key in lexicographic
/// order. The ordering and separator are part of the wire contract.
pub fn bundle_checksum(map: &std::collections::BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in map {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Take the first whitespace-separated token from a `.sha256` sidecar file's
/// text content; require 64 hex chars; lowercase.
pub fn parse_sha256_file(text: &str) -> Result<String> {
    let token = text.split_whitespace().next().unwrap_or("");
    if token.len() != 64 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("Invalid sha256 file content for dataset package.");
    }
    Ok(token.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;

    #[test]
    fn sha256_file_matches_known_digest() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        let digest = sha256_file(f.path()).unwrap();
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde"
        );
    }

    #[test]
    fn bundle_checksum_is_deterministic_under_key_permutation() {
        let mut a = BTreeMap::new();
        a.insert("b.txt".to_string(), "deadbeef".to_string());
        a.insert("a.txt".to_string(), "cafebabe".to_string());

        let mut b = BTreeMap::new();
        b.insert("a.txt".to_string(), "cafebabe".to_string());
        b.insert("b.txt".to_string(), "deadbeef".to_string());

        assert_eq!(bundle_checksum(&a), bundle_checksum(&b));
    }

    #[test]
    fn bundle_checksum_changes_with_values() {
        let mut a = BTreeMap::new();
        a.insert("a.txt".to_string(), "cafebabe".to_string());
        let mut b = BTreeMap::new();
        b.insert("a.txt".to_string(), "deadbeef".to_string());
        assert_ne!(bundle_checksum(&a), bundle_checksum(&b));
    }

    #[test]
    fn parse_sha256_file_takes_first_token_and_lowercases() {
        let digest = "A".repeat(64);
        let text = format!("{digest}  dataset_package.tar.gz\n");
        let parsed = parse_sha256_file(&text).unwrap();
        assert_eq!(parsed, "a".repeat(64));
    }

    #[test]
    fn parse_sha256_file_rejects_wrong_length() {
        assert!(parse_sha256_file("deadbeef").is_err());
    }

    #[test]
    fn parse_sha256_file_rejects_non_hex() {
        let bad = "g".repeat(64);
        assert!(parse_sha256_file(&bad).is_err());
    }
}
