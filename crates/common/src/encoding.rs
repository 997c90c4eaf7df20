//! Encryption config encodings and algorithm identifiers.

use std::fmt;

use serde_json::Value;

use crate::schema::Namespace;

/// Algorithm identifier for deterministic field-level encryption.
pub const ALGORITHM_DETERMINISTIC: &str = "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic";

/// Algorithm identifier for randomized field-level encryption.
pub const ALGORITHM_RANDOM: &str = "AEAD_AES_256_CBC_HMAC_SHA_512-Random";

/// Field-level encryption algorithm, as named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Same plaintext and key always produce the same ciphertext.
    Deterministic,
    /// Fresh randomness on every encryption.
    Random,
}

impl Algorithm {
    /// The full wire identifier for this algorithm.
    pub fn identifier(&self) -> &'static str {
        match self {
            Algorithm::Deterministic => ALGORITHM_DETERMINISTIC,
            Algorithm::Random => ALGORITHM_RANDOM,
        }
    }

    /// Parse a wire identifier back into an [`Algorithm`].
    pub fn from_identifier(s: &str) -> Option<Self> {
        match s {
            ALGORITHM_DETERMINISTIC => Some(Algorithm::Deterministic),
            ALGORITHM_RANDOM => Some(Algorithm::Random),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Which of the two config encodings a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    /// Schema-map encoding: per-field algorithm and key id, enforced by the
    /// driver against existing collections.
    FieldLevel,
    /// Encrypted-fields encoding: per-field query capabilities, enforced by
    /// the store for collections created through the engine.
    Queryable,
}

impl EncodingMode {
    /// Short name used in error messages and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncodingMode::FieldLevel => "field-level",
            EncodingMode::Queryable => "encrypted-fields",
        }
    }
}

impl fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A built encryption config document, keyed by collection namespace.
///
/// The two variants correspond to the two [`EncodingMode`]s and are passed
/// verbatim to [`crate::engine::Engine::open_encrypted_connection`]. Values
/// are plain JSON so the same document is reproducible byte-for-byte from
/// the same schema.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedConfig {
    /// A schema map: `{ "db.coll": { "bsonType": "object", "properties": ... } }`.
    SchemaMap(Value),
    /// An encrypted-fields map: `{ "db.coll": { "fields": [...] } }`.
    EncryptedFieldsMap(Value),
}

impl EncodedConfig {
    /// The encoding this config was built for.
    pub fn mode(&self) -> EncodingMode {
        match self {
            EncodedConfig::SchemaMap(_) => EncodingMode::FieldLevel,
            EncodedConfig::EncryptedFieldsMap(_) => EncodingMode::Queryable,
        }
    }

    /// The full config document.
    pub fn document(&self) -> &Value {
        match self {
            EncodedConfig::SchemaMap(doc) | EncodedConfig::EncryptedFieldsMap(doc) => doc,
        }
    }

    /// The entry for one collection namespace, if present.
    pub fn collection_entry(&self, namespace: &Namespace) -> Option<&Value> {
        self.document().get(namespace.to_string())
    }
}
