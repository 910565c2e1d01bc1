use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Hashes a presented API key secret for directory and cache lookups.
///
/// Deterministic, one-way and collision resistant: lowercase hex SHA-256 of
/// the trimmed secret. This is the same digest provisioning stores in
/// `api_keys.key`.
pub fn hash_api_key(raw_key: &str) -> String {
    let digest = Sha256::digest(raw_key.trim().as_bytes());
    hex::encode(digest)
}

/// Compares two strings in constant time to prevent timing attacks
pub fn constant_time_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_matches_known_digest() {
        assert_eq!(
            hash_api_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_is_deterministic_and_hex() {
        let a = hash_api_key("DEV_KEY_123");
        let b = hash_api_key("DEV_KEY_123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, hash_api_key("TEST_KEY_456"));
    }

    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        assert_eq!(hash_api_key("  DEV_KEY_123\t"), hash_api_key("DEV_KEY_123"));
    }

    #[test]
    fn test_constant_time_equal_same_strings() {
        assert!(constant_time_equal("test_string", "test_string"));
    }

    #[test]
    fn test_constant_time_equal_different_lengths() {
        assert!(!constant_time_equal("short", "much_longer_string"));
    }
}
