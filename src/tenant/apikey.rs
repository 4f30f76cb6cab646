//! API key generation and hashing.
//!
//! Keys are `tfa_live_` + 64 lowercase hex characters. Only the
//! HMAC-SHA256 of the raw key (keyed by the server salt) and a 16-char
//! display prefix are ever persisted.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed key namespace prefix.
pub const KEY_PREFIX: &str = "tfa_live_";
/// Characters of the raw key shown back to the owner.
pub const DISPLAY_PREFIX_LEN: usize = 16;

/// Generate a fresh raw API key.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", KEY_PREFIX, hex::encode(bytes))
}

/// Shape check for incoming keys, before any hashing work.
pub fn has_valid_shape(raw_key: &str) -> bool {
    let Some(body) = raw_key.strip_prefix(KEY_PREFIX) else {
        return false;
    };
    body.len() == 64 && body.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// `hex(HMAC-SHA256(salt, raw_key))`, the only persisted form.
pub fn hash_key(salt: &str, raw_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(salt.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(raw_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Display prefix of a raw key.
pub fn display_prefix(raw_key: &str) -> String {
    raw_key.chars().take(DISPLAY_PREFIX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_the_documented_shape() {
        let key = generate_key();
        assert!(key.starts_with(KEY_PREFIX));
        assert_eq!(key.len(), KEY_PREFIX.len() + 64);
        assert!(has_valid_shape(&key));
    }

    #[test]
    fn shape_check_rejects_malformed_keys() {
        assert!(!has_valid_shape("tfa_live_short"));
        assert!(!has_valid_shape(&format!("tfa_test_{}", "a".repeat(64))));
        // uppercase hex is not part of the grammar
        assert!(!has_valid_shape(&format!("tfa_live_{}", "A".repeat(64))));
        assert!(!has_valid_shape(""));
    }

    #[test]
    fn hashing_is_deterministic_and_salt_dependent() {
        let key = generate_key();
        let h1 = hash_key("salt-one-at-least-32-characters!", &key);
        let h2 = hash_key("salt-one-at-least-32-characters!", &key);
        let h3 = hash_key("salt-two-at-least-32-characters!", &key);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn display_prefix_is_sixteen_chars() {
        let key = generate_key();
        let prefix = display_prefix(&key);
        assert_eq!(prefix.len(), 16);
        assert!(prefix.starts_with("tfa_live_"));
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn distinct_keys_are_generated() {
        assert_ne!(generate_key(), generate_key());
    }
}
