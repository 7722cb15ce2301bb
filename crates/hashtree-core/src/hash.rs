//! SHA256 content hashing

use sha2::{Digest, Sha256};

use crate::types::Hash;

/// Compute the SHA256 digest of `data`
pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Check that `data` hashes to `hash`
pub fn verify(hash: &Hash, data: &[u8]) -> bool {
    sha256(data) == *hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::to_hex;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            to_hex(&sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify() {
        let hash = sha256(b"hello");
        assert!(verify(&hash, b"hello"));
        assert!(!verify(&hash, b"hellO"));
    }
}
