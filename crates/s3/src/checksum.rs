//! SHA-256 object checksums, base64-encoded as S3 stores them

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bucketry_core::{Error, Result};
use sha2::{Digest, Sha256};

pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Check `data` against the checksum the server returned for `key`
pub fn verify_sha256(key: &str, expected: Option<&str>, data: &[u8]) -> Result<()> {
    let expected = expected
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Integrity(format!("missing SHA256 checksum for '{key}'")))?;
    let actual = sha256_base64(data);
    if actual != expected {
        return Err(Error::Integrity(format!(
            "SHA256 checksum mismatch for '{key}': expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha256("hello world")
        assert_eq!(
            sha256_base64(b"hello world"),
            "uU0nuZNNPgilLlLX2n2r+sSE7+N6U4DukIj3rOLvzek="
        );
    }

    #[test]
    fn test_verify() {
        let sum = sha256_base64(b"data");
        verify_sha256("k", Some(&sum), b"data").unwrap();

        let missing = verify_sha256("k", None, b"data").unwrap_err();
        assert!(missing.to_string().contains("missing SHA256 checksum"));

        let err = verify_sha256("k", Some(&sum), b"other").unwrap_err().to_string();
        assert!(err.contains(&sum));
        assert!(err.contains(&sha256_base64(b"other")));
    }
}
