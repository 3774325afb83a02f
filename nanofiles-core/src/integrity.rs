//! Integrity: SHA-256 digest of full file contents, rendered as lowercase hex.

use sha2::{Digest, Sha256};

/// Hash file contents. Returns the lowercase hex digest used as the file's identifier.
pub fn digest_hex(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    hex::encode(hasher.finalize())
}

/// Incremental digest for content read in blocks.
#[derive(Default)]
pub struct DigestWriter {
    hasher: Sha256,
    len: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finish_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// True if `target` identifies `digest`: a non-empty, case-insensitive hex prefix of it.
/// Publish-time lookup and download-time verification both go through here.
pub fn matches_target(digest: &str, target: &str) -> bool {
    let target = target.trim();
    if target.is_empty() || target.len() > digest.len() {
        return false;
    }
    digest
        .get(..target.len())
        .map(|head| head.eq_ignore_ascii_case(target))
        .unwrap_or(false)
}

/// Verify downloaded contents against the requested target.
pub fn verify_contents(contents: &[u8], target: &str) -> bool {
    matches_target(&digest_hex(contents), target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        assert_eq!(
            digest_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_digest_matches_one_shot() {
        let mut w = DigestWriter::new();
        w.update(b"hello ");
        w.update(b"world");
        assert_eq!(w.len(), 11);
        assert_eq!(w.finish_hex(), digest_hex(b"hello world"));
    }

    #[test]
    fn prefix_matching() {
        let d = digest_hex(b"abc");
        assert!(matches_target(&d, &d));
        assert!(matches_target(&d, "ba7816"));
        assert!(matches_target(&d, "BA7816BF"));
        assert!(!matches_target(&d, ""));
        assert!(!matches_target(&d, "ba7817"));
        assert!(!matches_target(&d, &format!("{}00", d)));
    }

    #[test]
    fn verify_rejects_tampered() {
        let target = digest_hex(b"hello chunk");
        assert!(verify_contents(b"hello chunk", &target));
        assert!(!verify_contents(b"hello chunK", &target));
    }
}
