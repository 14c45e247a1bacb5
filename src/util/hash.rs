//! Content hashing for idempotent archive uploads.
//!
//! Each validated document part is hashed before hand-off; the archive
//! collaborator uses the hash to de-duplicate repeated uploads of the same
//! shipment across runs.

use sha3::{Digest, Sha3_256};

/// Compute the SHA3-256 hash of a document's bytes.
pub fn content_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex encoding of [`content_hash`], the form carried in archive metadata.
pub fn content_hash_hex(data: &[u8]) -> String {
    hex::encode(content_hash(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let h1 = content_hash(b"%PDF-1.4 document");
        let h2 = content_hash(b"%PDF-1.4 document");
        assert_eq!(h1, h2);
        assert_ne!(h1, [0u8; 32]);
    }

    #[test]
    fn test_hex_form() {
        let hex = content_hash_hex(b"abc");
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
