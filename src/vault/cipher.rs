use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for Bedrock API keys at rest.
///
/// The key is SHA-256 of the configured secret. Blobs are laid out as
/// `nonce(12) || ciphertext`.
pub struct KeyCipher {
    key: Zeroizing<[u8; 32]>,
}

impl KeyCipher {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.is_empty() {
            anyhow::bail!("encryption key must not be empty");
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    fn cipher(&self) -> anyhow::Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(self.key.as_ref())
            .map_err(|e| anyhow::anyhow!("invalid key length: {:?}", e))
    }

    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<Vec<u8>> {
        let nonce_bytes = generate_nonce();
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("encryption failed: {}", e))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> anyhow::Result<Zeroizing<String>> {
        if blob.len() <= NONCE_LEN {
            anyhow::bail!("encrypted blob too short ({} bytes)", blob.len());
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow::anyhow!("decryption failed: {}", e))?;
        Ok(Zeroizing::new(String::from_utf8(plaintext)?))
    }
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_roundtrip() {
        let cipher = KeyCipher::new("local-secret").unwrap();
        let blob = cipher.encrypt("bedrock-api-key-123").unwrap();

        assert!(blob.len() > NONCE_LEN);
        assert_eq!(cipher.decrypt(&blob).unwrap().as_str(), "bedrock-api-key-123");
    }

    #[test]
    fn test_nonce_is_random() {
        let cipher = KeyCipher::new("local-secret").unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = KeyCipher::new("one").unwrap().encrypt("secret").unwrap();
        assert!(KeyCipher::new("two").unwrap().decrypt(&blob).is_err());
        assert!(KeyCipher::new("one").unwrap().decrypt(&blob[..8]).is_err());
        assert!(KeyCipher::new("").is_err());
    }
}
