//! Access key generation, hashing and log masking.

use base64::Engine;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_PREFIX: &str = "ak_";
/// `ak_` plus six characters of the random part.
const DISPLAY_PREFIX_LEN: usize = 9;

/// HMAC-SHA256 of raw access keys. Only the hex digest is stored.
#[derive(Clone)]
pub struct KeyHasher {
    secret: Vec<u8>,
}

impl KeyHasher {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    pub fn hash(&self, raw_key: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC can take key of any size");
        mac.update(raw_key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn verify(&self, raw_key: &str, expected_hash: &str) -> bool {
        self.hash(raw_key)
            .as_bytes()
            .ct_eq(expected_hash.as_bytes())
            .into()
    }
}

pub struct GeneratedKey {
    pub raw_key: String,
    pub key_prefix: String,
}

pub struct KeyGenerator;

impl KeyGenerator {
    /// `ak_` + URL-safe base64 (no padding) of 32 random bytes.
    pub fn generate() -> GeneratedKey {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw_key = format!(
            "{}{}",
            KEY_PREFIX,
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
        );
        let key_prefix = raw_key.chars().take(DISPLAY_PREFIX_LEN).collect();
        GeneratedKey { raw_key, key_prefix }
    }
}

static ACCESS_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"ak_[A-Za-z0-9_-]+").unwrap());
static BEARER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Bearer\s+[A-Za-z0-9._~+/=-]+").unwrap());

/// Scrubs credentials from strings before they reach the logs.
pub struct KeyMasker;

impl KeyMasker {
    pub fn mask(text: &str) -> String {
        let masked = ACCESS_KEY_RE.replace_all(text, "ak_***");
        BEARER_RE.replace_all(&masked, "Bearer ***").into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic_and_keyed() {
        let a = KeyHasher::new("secret-a");
        let b = KeyHasher::new("secret-b");
        assert_eq!(a.hash("ak_test"), a.hash("ak_test"));
        assert_ne!(a.hash("ak_test"), b.hash("ak_test"));
        assert_eq!(a.hash("ak_test").len(), 64);
        assert!(a.verify("ak_test", &a.hash("ak_test")));
        assert!(!a.verify("ak_other", &a.hash("ak_test")));
    }

    #[test]
    fn test_generated_key_shape() {
        let key = KeyGenerator::generate();
        assert!(key.raw_key.starts_with("ak_"));
        // 32 bytes → 43 base64 chars without padding
        assert_eq!(key.raw_key.len(), 3 + 43);
        assert_eq!(key.key_prefix.len(), 9);
        assert!(key.raw_key.starts_with(&key.key_prefix));
        assert_ne!(KeyGenerator::generate().raw_key, key.raw_key);
    }

    #[test]
    fn test_mask() {
        let line = "POST /ak/ak_AbC-12_x/v1/messages Authorization: Bearer sk-ant-xyz.123";
        assert_eq!(
            KeyMasker::mask(line),
            "POST /ak/ak_***/v1/messages Authorization: Bearer ***"
        );
    }
}
