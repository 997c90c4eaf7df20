//! AES-256-GCM-SIV field cipher.
//!
//! Every encrypted field is carried as a printable token so it can live in a
//! plain string slot of a stored document:
//!
//! ```text
//! v1.<key id>.<base64url nonce>.<base64url ciphertext>
//! ```
//!
//! The key id rides along with the payload so decryption can locate the data
//! key without out-of-band state. Deterministic encryption derives the nonce
//! from the plaintext under the data key (HMAC-SHA-256, truncated), which
//! makes equal plaintexts produce equal tokens; GCM-SIV keeps nonce reuse
//! across distinct plaintexts from becoming a catastrophic failure. Random
//! encryption draws the nonce from the OS.

use aes_gcm_siv::aead::rand_core::RngCore;
use aes_gcm_siv::aead::{Aead, OsRng};
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

/// Required data-key length in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// GCM-SIV nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Version tag prefixed to every serialized token.
pub const VERSION_PREFIX: &str = "v1";

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("data key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("AEAD operation failed (wrong key or corrupted data)")]
    AeadFailure,

    #[error("malformed encrypted token: {0}")]
    InvalidFormat(String),
}

/// An encrypted field value plus the metadata needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedValue {
    pub key_ref: String,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedValue {
    /// Serializes to the `v1.<key>.<nonce>.<ciphertext>` wire form.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            VERSION_PREFIX,
            self.key_ref,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }

    /// Parses the `v1.<key>.<nonce>.<ciphertext>` wire form.
    pub fn from_str_repr(s: &str) -> Result<Self, CipherError> {
        let mut parts = s.splitn(4, '.');
        let version = parts.next().unwrap_or_default();
        if version != VERSION_PREFIX {
            return Err(CipherError::InvalidFormat(format!(
                "unknown version prefix {version:?}"
            )));
        }
        let (key_ref, nonce_b64, ct_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(n), Some(c)) if !k.is_empty() => (k, n, c),
            _ => {
                return Err(CipherError::InvalidFormat(
                    "expected version.key.nonce.ciphertext".into(),
                ))
            }
        };

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|e| CipherError::InvalidFormat(format!("bad nonce encoding: {e}")))?;
        let nonce: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CipherError::InvalidFormat("nonce has wrong length".into()))?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|e| CipherError::InvalidFormat(format!("bad ciphertext encoding: {e}")))?;

        Ok(Self {
            key_ref: key_ref.to_string(),
            nonce,
            ciphertext,
        })
    }
}

/// Looks like an encrypted token without fully parsing it.
pub fn is_encrypted_repr(s: &str) -> bool {
    s.starts_with(VERSION_PREFIX) && s.as_bytes().get(VERSION_PREFIX.len()) == Some(&b'.')
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    Aes256GcmSiv::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

fn derived_nonce(key: &[u8], plaintext: &[u8]) -> Result<[u8; NONCE_LEN], CipherError> {
    // Qualified: `KeyInit` is also in scope and supplies a `new_from_slice`.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    mac.update(plaintext);
    let digest = mac.finalize().into_bytes();
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    Ok(nonce)
}

/// Fresh random data-key material.
pub fn generate_key_material() -> [u8; KEY_LEN] {
    let mut material = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut material);
    material
}

/// Encrypts `plaintext` under `key`, tagging the token with `key_ref`.
///
/// `deterministic` selects the plaintext-derived nonce; pass `false` for a
/// fresh random nonce per call.
pub fn encrypt_value(
    plaintext: &[u8],
    key: &[u8],
    key_ref: &str,
    deterministic: bool,
) -> Result<EncryptedValue, CipherError> {
    let cipher = build_cipher(key)?;

    let nonce = if deterministic {
        derived_nonce(key, plaintext)?
    } else {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    };

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(EncryptedValue {
        key_ref: key_ref.to_string(),
        nonce,
        ciphertext,
    })
}

/// Decrypts a token previously produced by [`encrypt_value`].
pub fn decrypt_value(value: &EncryptedValue, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    cipher
        .decrypt(Nonce::from_slice(&value.nonce), value.ciphertext.as_slice())
        .map_err(|_| CipherError::AeadFailure)
}

// --- data-key wrapping ---

const KEK_REF: &str = "kek";

fn kek_from_master(master: &[u8]) -> [u8; KEY_LEN] {
    let digest = Sha256::digest(master);
    let mut kek = [0u8; KEY_LEN];
    kek.copy_from_slice(&digest);
    kek
}

/// Wraps raw data-key material under a key-encryption key derived from the
/// master key, returning a printable token for storage in the key registry.
pub fn wrap_key(material: &[u8], master: &[u8]) -> Result<String, CipherError> {
    let kek = kek_from_master(master);
    let wrapped = encrypt_value(material, &kek, KEK_REF, false)?;
    Ok(wrapped.to_string_repr())
}

/// Recovers data-key material from a token produced by [`wrap_key`].
pub fn unwrap_key(token: &str, master: &[u8]) -> Result<Vec<u8>, CipherError> {
    let kek = kek_from_master(master);
    let wrapped = EncryptedValue::from_str_repr(token)?;
    decrypt_value(&wrapped, &kek)
}

// --- tests ---
