//! AES-256-GCM payload encryption with key rotation.
//!
//! The encrypt stage seals the serialized payload with the endpoint's active
//! key; the consume side resolves the key named by `x-encryption-key-id`
//! (falling back to the active key when the header is absent) and opens the
//! payload before deserialization.
//!
//! Wire format: a fresh 96-bit nonce is generated per payload and prepended
//! to the ciphertext, so no nonce bookkeeping is needed across messages.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use silverback_core::endpoint::EncryptionSettings;
use silverback_core::error::ConsumeError;
use silverback_core::headers::{HeaderMap, names};

/// Nonce size for AES-GCM (96 bits).
const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` with the settings' active key.
///
/// Returns the nonce-prefixed ciphertext and, when the keyring holds more
/// than one key, the key identifier to write to `x-encryption-key-id`.
///
/// # Errors
///
/// Returns a message describing the failure when the key material is
/// rejected by the cipher or sealing fails.
pub fn encrypt(
    settings: &EncryptionSettings,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Option<String>), String> {
    let active = settings
        .active_key()
        .ok_or_else(|| format!("active key '{}' not in keyring", settings.active_key_id))?;

    let cipher = Aes256Gcm::new_from_slice(&active.key)
        .map_err(|e| format!("invalid key material for '{}': {e}", active.id))?;

    // Each payload gets a fresh random nonce, so key reuse across messages
    // is safe.
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| format!("encryption failed: {e}"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    let key_id = (settings.keys.len() > 1).then(|| active.id.clone());
    Ok((sealed, key_id))
}

/// Decrypt a nonce-prefixed payload, resolving the key from the headers.
///
/// The key named by `x-encryption-key-id` is looked up in the settings'
/// keyring; when the header is absent the active key is used.
///
/// # Errors
///
/// - [`ConsumeError::DecryptionKeyNotFound`] when the named key is unknown
/// - [`ConsumeError::Decryption`] when the payload is malformed or the key
///   does not open it
pub fn decrypt(
    settings: &EncryptionSettings,
    headers: &HeaderMap,
    sealed: &[u8],
) -> Result<Vec<u8>, ConsumeError> {
    let key = match headers.get(names::ENCRYPTION_KEY_ID) {
        Some(id) => settings
            .key(id)
            .ok_or_else(|| ConsumeError::DecryptionKeyNotFound(id.to_string()))?,
        None => settings.active_key().ok_or_else(|| {
            ConsumeError::DecryptionKeyNotFound(settings.active_key_id.clone())
        })?,
    };

    if sealed.len() < NONCE_LEN {
        return Err(ConsumeError::Decryption(format!(
            "payload too short for a nonce: {} bytes",
            sealed.len()
        )));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(&key.key)
        .map_err(|e| ConsumeError::Decryption(format!("invalid key material: {e}")))?;
    let nonce = Nonce::clone_from_slice(nonce_bytes);
    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|e| ConsumeError::Decryption(format!("payload did not open: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use silverback_core::endpoint::EncryptionKey;

    fn settings(active: &str) -> EncryptionSettings {
        EncryptionSettings {
            keys: vec![
                EncryptionKey {
                    id: "k1".to_string(),
                    key: vec![1u8; 32],
                },
                EncryptionKey {
                    id: "k2".to_string(),
                    key: vec![2u8; 32],
                },
            ],
            active_key_id: active.to_string(),
        }
    }

    #[test]
    fn roundtrip_with_key_id_header() {
        let settings = settings("k2");
        let (sealed, key_id) = encrypt(&settings, b"secret payload").unwrap();
        assert_eq!(key_id.as_deref(), Some("k2"));
        assert_ne!(sealed, b"secret payload");

        let mut headers = HeaderMap::new();
        headers.set(names::ENCRYPTION_KEY_ID, "k2");
        let opened = decrypt(&settings, &headers, &sealed).unwrap();
        assert_eq!(opened, b"secret payload");
    }

    #[test]
    fn single_key_keyring_writes_no_key_id() {
        let settings = EncryptionSettings {
            keys: vec![EncryptionKey {
                id: "only".to_string(),
                key: vec![9u8; 32],
            }],
            active_key_id: "only".to_string(),
        };
        let (sealed, key_id) = encrypt(&settings, b"data").unwrap();
        assert!(key_id.is_none());

        // No header: falls back to the active key.
        let opened = decrypt(&settings, &HeaderMap::new(), &sealed).unwrap();
        assert_eq!(opened, b"data");
    }

    #[test]
    fn unknown_key_id_is_reported() {
        let settings = settings("k1");
        let (sealed, _) = encrypt(&settings, b"data").unwrap();

        let mut headers = HeaderMap::new();
        headers.set(names::ENCRYPTION_KEY_ID, "k9");
        let error = decrypt(&settings, &headers, &sealed).unwrap_err();
        assert!(matches!(error, ConsumeError::DecryptionKeyNotFound(id) if id == "k9"));
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let settings_k1 = settings("k1");
        let (sealed, _) = encrypt(&settings_k1, b"data").unwrap();

        let mut headers = HeaderMap::new();
        headers.set(names::ENCRYPTION_KEY_ID, "k2");
        let error = decrypt(&settings_k1, &headers, &sealed).unwrap_err();
        assert!(matches!(error, ConsumeError::Decryption(_)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let settings = settings("k1");
        let error = decrypt(&settings, &HeaderMap::new(), &[1, 2, 3]).unwrap_err();
        assert!(matches!(error, ConsumeError::Decryption(_)));
    }
}
