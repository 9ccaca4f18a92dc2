use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hex-encoded SHA-256 of a secret such as an API key.
pub fn sha256_hex(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Compare two digests without leaking the position of the first mismatch.
pub fn constant_time_eq(expected: &str, actual: &str) -> bool {
    let expected_bytes = expected.as_bytes();
    let actual_bytes = actual.as_bytes();

    if expected_bytes.len() != actual_bytes.len() {
        return false;
    }

    expected_bytes.ct_eq(actual_bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        let digest = sha256_hex("sk_live_123");
        assert!(constant_time_eq(&digest, &sha256_hex("sk_live_123")));
        assert!(!constant_time_eq(&digest, &sha256_hex("sk_live_124")));
        assert!(!constant_time_eq(&digest, "short"));
    }
}
