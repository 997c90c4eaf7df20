//! Key material types: the customer master key, KMS provider map, and
//! data-encryption-key identifiers.

use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Length of a customer master key in bytes.
pub const MASTER_KEY_LEN: usize = 96;

/// Provider tag used when the master key is supplied directly by the caller.
pub const LOCAL_PROVIDER: &str = "local";

/// The supplied master key material has the wrong length.
#[derive(Debug, Error)]
#[error("master key has invalid length: expected {MASTER_KEY_LEN} bytes, got {0}")]
pub struct InvalidKeyLength(pub usize);

/// Fixed-size buffer holding exactly [`MASTER_KEY_LEN`] bytes of master key
/// material.
///
/// Data encryption keys are wrapped with this key before they are written to
/// the key registry. When this type is dropped, the memory is overwritten
/// with zeroes to minimise the window during which plaintext key material
/// lives in RAM.
#[derive(Clone)]
pub struct MasterKey(Box<[u8; MASTER_KEY_LEN]>);

impl MasterKey {
    /// Build a [`MasterKey`] from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidKeyLength`] if the slice is not exactly
    /// [`MASTER_KEY_LEN`] bytes. The caller decides whether that means a
    /// corrupt key file or a truncated secret-store value.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidKeyLength> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(InvalidKeyLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; MASTER_KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Generate a fresh random master key.
    pub fn generate() -> Self {
        let mut buf = Box::new([0u8; MASTER_KEY_LEN]);
        rand::rng().fill_bytes(buf.as_mut_slice());
        Self(buf)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Map from KMS provider tag to the master key that provider supplies.
///
/// A single-provider map with the [`LOCAL_PROVIDER`] tag covers the common
/// case; additional tags can be registered for stores that segregate keys by
/// tenant or environment.
#[derive(Debug, Clone, Default)]
pub struct KmsProviders {
    providers: BTreeMap<String, MasterKey>,
}

impl KmsProviders {
    /// Create an empty provider map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map holding `key` under the [`LOCAL_PROVIDER`] tag.
    pub fn local(key: MasterKey) -> Self {
        Self::new().with_provider(LOCAL_PROVIDER, key)
    }

    /// Register `key` under `tag`, replacing any previous entry.
    pub fn with_provider(mut self, tag: impl Into<String>, key: MasterKey) -> Self {
        self.providers.insert(tag.into(), key);
        self
    }

    /// Look up the master key for a provider tag.
    pub fn get(&self, tag: &str) -> Option<&MasterKey> {
        self.providers.get(tag)
    }

    /// Whether a provider tag is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.providers.contains_key(tag)
    }

    /// Registered provider tags, in sorted order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Whether no providers are registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Identifier of a data encryption key stored in the key registry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DekId(Uuid);

impl DekId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier from its hyphenated string form.
    pub fn parse_str(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Borrow the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DekId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_accepts_exact_length() {
        let key = MasterKey::from_bytes(&[0x42u8; MASTER_KEY_LEN]).unwrap();
        assert_eq!(key.as_bytes(), &[0x42u8; MASTER_KEY_LEN][..]);
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        let err = MasterKey::from_bytes(&[0u8; 32]).unwrap_err();
        assert_eq!(err.0, 32);
        assert!(err.to_string().contains("96"));
    }

    #[test]
    fn generated_keys_differ() {
        let a = MasterKey::generate();
        let b = MasterKey::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn master_key_redacted_in_debug() {
        let key = MasterKey::from_bytes(&[0x42u8; MASTER_KEY_LEN]).unwrap();
        assert!(format!("{key:?}").contains("REDACTED"));
        let providers = KmsProviders::local(key);
        assert!(format!("{providers:?}").contains("REDACTED"));
    }

    #[test]
    fn provider_map_lookup() {
        let providers = KmsProviders::local(MasterKey::generate());
        assert!(providers.contains(LOCAL_PROVIDER));
        assert!(providers.get("aws").is_none());
        assert_eq!(providers.tags().collect::<Vec<_>>(), vec![LOCAL_PROVIDER]);
    }

    #[test]
    fn dek_id_round_trips_through_string() {
        let id = DekId::new();
        let parsed = DekId::parse_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
