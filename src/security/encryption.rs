//! Symmetric and asymmetric payload encryption.
//!
//! - Symmetric: XChaCha20-Poly1305, output is `nonce (24 bytes) || ciphertext+tag`.
//! - Asymmetric: age X25519, output is a binary age file.
//! - Password keys: PBKDF2-HMAC-SHA256 over a caller-supplied salt.

use std::io::{Read, Write};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::SecurityError;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// Minimum accepted salt length for password-derived keys.
pub const MIN_SALT_LEN: usize = 8;

/// Owns all key material for one orchestrator instance.
pub struct EncryptionManager {
    key: Zeroizing<[u8; KEY_LEN]>,
    identity: age::x25519::Identity,
    recipient: age::x25519::Recipient,
    salt: Option<Vec<u8>>,
}

impl EncryptionManager {
    /// Fresh random symmetric key and X25519 identity.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self::with_key(key, None)
    }

    /// Derive the symmetric key from a password with PBKDF2-HMAC-SHA256.
    ///
    /// The asymmetric identity is still random; only the symmetric key is
    /// reproducible from `(password, salt, iterations)`.
    ///
    /// # Errors
    ///
    /// [`SecurityError::KeyDerivation`] for an empty password, a salt shorter
    /// than [`MIN_SALT_LEN`], or zero iterations.
    pub fn from_password(
        password: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Self, SecurityError> {
        if password.is_empty() {
            return Err(SecurityError::KeyDerivation("empty password".into()));
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(SecurityError::KeyDerivation(format!(
                "salt must be at least {MIN_SALT_LEN} bytes, got {}",
                salt.len()
            )));
        }
        if iterations == 0 {
            return Err(SecurityError::KeyDerivation("iterations must be > 0".into()));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key[..]);
        Ok(Self::with_key(key, Some(salt.to_vec())))
    }

    fn with_key(key: Zeroizing<[u8; KEY_LEN]>, salt: Option<Vec<u8>>) -> Self {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        Self {
            key,
            identity,
            recipient,
            salt,
        }
    }

    /// Public half of the asymmetric key, as an `age1…` string.
    pub fn recipient(&self) -> String {
        self.recipient.to_string()
    }

    /// Salt used for password derivation, if any.
    pub fn salt(&self) -> Option<&[u8]> {
        self.salt.as_deref()
    }

    /// Encrypt `data`. `asymmetric` selects age X25519 instead of the symmetric key.
    pub fn encrypt(&self, data: &[u8], asymmetric: bool) -> Result<Vec<u8>, SecurityError> {
        if asymmetric {
            self.encrypt_asymmetric(data)
        } else {
            self.encrypt_symmetric(data)
        }
    }

    /// Reverse of [`encrypt`](Self::encrypt) with the same `asymmetric` flag.
    pub fn decrypt(&self, data: &[u8], asymmetric: bool) -> Result<Vec<u8>, SecurityError> {
        if asymmetric {
            self.decrypt_asymmetric(data)
        } else {
            self.decrypt_symmetric(data)
        }
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305, SecurityError> {
        XChaCha20Poly1305::new_from_slice(&self.key[..])
            .map_err(|e| SecurityError::Encryption(format!("invalid key: {e}")))
    }

    fn encrypt_symmetric(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let cipher = self.cipher()?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, data)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_symmetric(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if data.len() < NONCE_LEN {
            return Err(SecurityError::Decryption("ciphertext truncated".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecurityError::Decryption("authentication failed".into()))
    }

    fn encrypt_asymmetric(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(self.recipient.clone())])
            .ok_or_else(|| SecurityError::Encryption("no valid encryption recipients".into()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        Ok(encrypted)
    }

    fn decrypt_asymmetric(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let age::Decryptor::Recipients(decryptor) =
            age::Decryptor::new(data).map_err(|e| SecurityError::Decryption(e.to_string()))?
        else {
            return Err(SecurityError::Decryption("unexpected decryptor type".into()));
        };

        let identity: &dyn age::Identity = &self.identity;
        let mut reader = decryptor
            .decrypt(std::iter::once(identity))
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;

        let mut decrypted = vec![];
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;
        Ok(decrypted)
    }
}

impl std::fmt::Debug for EncryptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionManager")
            .field("recipient", &self.recipient.to_string())
            .field("password_derived", &self.salt.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &[u8] = b"0123456789abcdef";

    #[test]
    fn test_symmetric_round_trip() {
        let manager = EncryptionManager::generate();
        let ciphertext = manager.encrypt(b"db_password=hunter2", false).unwrap();
        assert_ne!(ciphertext.as_slice(), b"db_password=hunter2");
        assert_eq!(manager.decrypt(&ciphertext, false).unwrap(), b"db_password=hunter2");
    }

    #[test]
    fn test_asymmetric_round_trip() {
        let manager = EncryptionManager::generate();
        let ciphertext = manager.encrypt(b"session key", true).unwrap();
        assert_eq!(manager.decrypt(&ciphertext, true).unwrap(), b"session key");
    }

    #[test]
    fn test_identical_inputs_encrypt_differently() {
        let manager = EncryptionManager::generate();
        let a = manager.encrypt(b"same", false).unwrap();
        let b = manager.encrypt(b"same", false).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let manager = EncryptionManager::generate();
        let mut ciphertext = manager.encrypt(b"payload", false).unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(matches!(
            manager.decrypt(&ciphertext, false),
            Err(SecurityError::Decryption(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let manager = EncryptionManager::generate();
        assert!(matches!(
            manager.decrypt(&[0u8; 10], false),
            Err(SecurityError::Decryption(_))
        ));
        assert!(manager.decrypt(b"not an age file", true).is_err());
    }

    #[test]
    fn test_other_manager_cannot_decrypt() {
        let alice = EncryptionManager::generate();
        let bob = EncryptionManager::generate();
        let sym = alice.encrypt(b"x", false).unwrap();
        let asym = alice.encrypt(b"x", true).unwrap();
        assert!(bob.decrypt(&sym, false).is_err());
        assert!(bob.decrypt(&asym, true).is_err());
    }

    #[test]
    fn test_password_derivation_is_reproducible() {
        let first = EncryptionManager::from_password("correct horse", SALT, 10_000).unwrap();
        let second = EncryptionManager::from_password("correct horse", SALT, 10_000).unwrap();
        let ciphertext = first.encrypt(b"shared secret", false).unwrap();
        assert_eq!(second.decrypt(&ciphertext, false).unwrap(), b"shared secret");
        assert_eq!(first.salt(), Some(SALT));
    }

    #[test]
    fn test_wrong_password_fails() {
        let right = EncryptionManager::from_password("right", SALT, 10_000).unwrap();
        let wrong = EncryptionManager::from_password("wrong", SALT, 10_000).unwrap();
        let ciphertext = right.encrypt(b"x", false).unwrap();
        assert!(wrong.decrypt(&ciphertext, false).is_err());
    }

    #[test]
    fn test_password_derivation_rejects_bad_inputs() {
        assert!(matches!(
            EncryptionManager::from_password("", SALT, 10_000),
            Err(SecurityError::KeyDerivation(_))
        ));
        assert!(matches!(
            EncryptionManager::from_password("pw", b"short", 10_000),
            Err(SecurityError::KeyDerivation(_))
        ));
        assert!(matches!(
            EncryptionManager::from_password("pw", SALT, 0),
            Err(SecurityError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_debug_hides_key_material() {
        let manager = EncryptionManager::generate();
        let debug = format!("{manager:?}");
        assert!(debug.contains("age1"));
        assert!(!debug.contains("AGE-SECRET-KEY"));
        assert!(manager.recipient().starts_with("age1"));
    }
}
