//! At-rest encryption for chat messages.
//!
//! Each chat gets its own AES-256-GCM key, derived with HKDF-SHA256 from the
//! server master key and the chat id. Stored form is
//! `base64(nonce || ciphertext)`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use sha2::Sha256;

const NONCE_LEN: usize = 12;

pub fn encrypt_message(content: &str, chat_id: &str, master_key: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(&derive_chat_key(master_key, chat_id)?);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, content.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut sealed = nonce.to_vec();
    sealed.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(&sealed))
}

pub fn decrypt_message(sealed: &str, chat_id: &str, master_key: &str) -> Result<String> {
    let data = STANDARD
        .decode(sealed)
        .map_err(|e| anyhow!("Base64 decode failed: {}", e))?;
    if data.len() < NONCE_LEN {
        return Err(anyhow!("Invalid encrypted message: too short"));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new(&derive_chat_key(master_key, chat_id)?);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow!("Decryption failed for chat {}: {}", chat_id, e))?;

    String::from_utf8(plaintext).map_err(|e| anyhow!("Invalid UTF-8 after decryption: {}", e))
}

/// A 64-character master key is read as hex, anything else as raw bytes
/// padded or truncated to 32.
fn derive_chat_key(master_key: &str, chat_id: &str) -> Result<Key<Aes256Gcm>> {
    let master = if master_key.len() == 64 {
        hex::decode(master_key).map_err(|e| anyhow!("Invalid hex master key: {}", e))?
    } else {
        let mut bytes = master_key.as_bytes().to_vec();
        bytes.resize(32, 0);
        bytes
    };

    let hk = Hkdf::<Sha256>::new(None, &master);
    let mut okm = [0u8; 32];
    hk.expand(chat_id.as_bytes(), &mut okm)
        .map_err(|e| anyhow!("HKDF expansion failed: {}", e))?;
    Ok(*Key::<Aes256Gcm>::from_slice(&okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_message_is_sealed_per_chat() {
        let sealed = encrypt_message("Is the flat still available?", "chat-1", KEY).unwrap();
        assert!(!sealed.contains("flat"));
        assert_eq!(
            decrypt_message(&sealed, "chat-1", KEY).unwrap(),
            "Is the flat still available?"
        );
        assert!(decrypt_message(&sealed, "chat-2", KEY).is_err());
    }

    #[test]
    fn test_short_payload_is_rejected() {
        assert!(decrypt_message("AAAA", "chat-1", KEY).is_err());
    }
}
