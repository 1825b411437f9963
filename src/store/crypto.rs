use crate::error::{AppError, AppResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use sha2::Digest;

const NONCE_LEN: usize = 12;

/// Source of the per-install master key. The production implementation asks
/// the host OS keyring; tests inject a fixed key.
pub trait MasterKeySource: Send + Sync {
    fn master_key(&self) -> AppResult<[u8; 32]>;
}

// Fallback source deriving the key from the machine identifier when no
// keyring entry exists yet.
pub struct DeviceKeySource;

impl MasterKeySource for DeviceKeySource {
    fn master_key(&self) -> AppResult<[u8; 32]> {
        let device_id = machine_uid::get().unwrap_or_else(|_| "default".to_string());
        let mut key = [0u8; 32];
        let hash = sha2::Sha256::digest(device_id.as_bytes());
        key.copy_from_slice(&hash);
        Ok(key)
    }
}

pub struct FixedKeySource(pub [u8; 32]);

impl MasterKeySource for FixedKeySource {
    fn master_key(&self) -> AppResult<[u8; 32]> {
        Ok(self.0)
    }
}

// AES-256-GCM with a random nonce packed ahead of the ciphertext:
// base64(nonce || ciphertext+tag). The format is self-describing so rows can
// be decrypted without any out-of-band state.
pub struct CipherBox {
    cipher: Aes256Gcm,
}

impl CipherBox {
    pub fn new(source: &dyn MasterKeySource) -> AppResult<Self> {
        let key = source.master_key()?;
        Ok(Self {
            cipher: Aes256Gcm::new(&key.into()),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Decrypt(format!("encryption failed: {}", e)))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(packed))
    }

    pub fn decrypt(&self, packed: &str) -> AppResult<String> {
        let decoded = general_purpose::STANDARD
            .decode(packed)
            .map_err(|e| AppError::Decrypt(format!("base64 decode failed: {}", e)))?;

        if decoded.len() <= NONCE_LEN {
            return Err(AppError::Decrypt("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| AppError::Decrypt(format!("decryption failed: {}", e)))?;
        String::from_utf8(plaintext).map_err(|e| AppError::Decrypt(format!("utf-8 conversion failed: {}", e)))
    }
}

// Plaintext JSON leaking into an encrypted column is a migration bug; rows
// are detected by their leading brace and re-encrypted in place.
pub fn looks_plaintext(value: &str) -> bool {
    value.trim_start().starts_with('{')
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    fn test_box() -> CipherBox {
        CipherBox::new(&FixedKeySource([7u8; 32])).unwrap()
    }

    #[test]
    fn round_trip() {
        let cb = test_box();
        let packed = cb.encrypt(r#"{"access_token":"abc"}"#).unwrap();
        assert!(!looks_plaintext(&packed));
        assert_eq!(cb.decrypt(&packed).unwrap(), r#"{"access_token":"abc"}"#);
    }

    #[test]
    fn nonces_differ_between_calls() {
        let cb = test_box();
        let a = cb.encrypt("same").unwrap();
        let b = cb.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cb = test_box();
        let packed = cb.encrypt("secret").unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD.decode(&packed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(matches!(cb.decrypt(&tampered), Err(AppError::Decrypt(_))));
    }

    #[test]
    fn wrong_key_is_a_decrypt_error_not_a_panic() {
        let cb = test_box();
        let packed = cb.encrypt("secret").unwrap();
        let other = CipherBox::new(&FixedKeySource([9u8; 32])).unwrap();
        assert!(matches!(other.decrypt(&packed), Err(AppError::Decrypt(_))));
    }

    #[test]
    fn plaintext_detection() {
        assert!(looks_plaintext(r#"{"refresh_token":"x"}"#));
        assert!(looks_plaintext("  {\"a\":1}"));
        assert!(!looks_plaintext("c29tZSBjaXBoZXJ0ZXh0"));
    }
}
