//! Credential vault: AES-256-GCM encrypted provider credentials.
//!
//! Each user gets a key derived from the master key with HKDF-SHA256, so a
//! blob encrypted for one user cannot be opened under another user's id.
//!
//! Blob format: `v1:<nonce_b64>:<ciphertext_b64>`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::VaultError;

const BLOB_VERSION: &str = "v1";

/// Turns a stored credential blob into the plaintext secret sent upstream.
pub trait CredentialDecryptor: Send + Sync {
    fn decrypt(&self, user_id: &str, blob: &str) -> Result<String, VaultError>;
}

/// Treats the stored value as the secret itself. Local development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextDecryptor;

impl CredentialDecryptor for PlaintextDecryptor {
    fn decrypt(&self, _user_id: &str, blob: &str) -> Result<String, VaultError> {
        if blob.is_empty() {
            return Err(VaultError::InvalidFormat("empty credential".to_string()));
        }
        Ok(blob.to_string())
    }
}

pub struct VaultDecryptor {
    master_key: [u8; 32],
}

impl std::fmt::Debug for VaultDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultDecryptor").finish_non_exhaustive()
    }
}

impl VaultDecryptor {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    /// Build from `VAULT_MASTER_KEY`.
    pub fn from_env() -> Result<Self, VaultError> {
        load_master_key().map(Self::new)
    }

    /// Encrypt a credential for `user_id`, producing a blob for the config file.
    pub fn encrypt(&self, user_id: &str, plaintext: &str) -> Result<String, VaultError> {
        use aes_gcm::aead::OsRng;
        use aes_gcm::AeadCore;

        let key = derive_user_key(&self.master_key, user_id)?;
        let cipher = Aes256Gcm::new((&key).into());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok(format!(
            "{BLOB_VERSION}:{}:{}",
            b64.encode(nonce),
            b64.encode(ciphertext)
        ))
    }
}

impl CredentialDecryptor for VaultDecryptor {
    fn decrypt(&self, user_id: &str, blob: &str) -> Result<String, VaultError> {
        let mut parts = blob.trim().splitn(3, ':');
        let (Some(version), Some(nonce_b64), Some(ciphertext_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(VaultError::InvalidFormat(
                "expected v1:<nonce>:<ciphertext>".to_string(),
            ));
        };
        if version != BLOB_VERSION {
            return Err(VaultError::InvalidFormat(format!(
                "unsupported blob version {version}"
            )));
        }

        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce_bytes = b64
            .decode(nonce_b64)
            .map_err(|e| VaultError::InvalidFormat(format!("base64 nonce: {e}")))?;
        let ciphertext = b64
            .decode(ciphertext_b64)
            .map_err(|e| VaultError::InvalidFormat(format!("base64 ciphertext: {e}")))?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::InvalidFormat(format!(
                "nonce must be 12 bytes, got {}",
                nonce_bytes.len()
            )));
        }

        let key = derive_user_key(&self.master_key, user_id)?;
        let cipher = Aes256Gcm::new((&key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| VaultError::Decryption(e.to_string()))
    }
}

fn derive_user_key(master_key: &[u8; 32], user_id: &str) -> Result<[u8; 32], VaultError> {
    let hk = Hkdf::<Sha256>::new(None, master_key);
    let mut okm = [0u8; 32];
    let info = format!("chatgate-credential-{user_id}");
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| VaultError::Encryption(e.to_string()))?;
    Ok(okm)
}

/// Parse the VAULT_MASTER_KEY env var (64 hex chars → 32 bytes).
pub fn load_master_key() -> Result<[u8; 32], VaultError> {
    let hex_str = std::env::var("VAULT_MASTER_KEY").map_err(|_| VaultError::MasterKeyMissing)?;
    parse_master_key(&hex_str)
}

pub fn parse_master_key(hex_str: &str) -> Result<[u8; 32], VaultError> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(VaultError::MasterKeyMissing);
    }
    let bytes = hex::decode(hex_str).map_err(|_| VaultError::MasterKeyMissing)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
