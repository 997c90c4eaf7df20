//! Boundary traits between the key-lifecycle layer and a concrete document
//! store plus its encryption engine.
//!
//! The session layer is written entirely against these traits, so a real
//! driver, the in-memory engine used in tests, and mock implementations are
//! interchangeable.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::encoding::{Algorithm, EncodedConfig};
use crate::error::EngineError;
use crate::keys::{DekId, KmsProviders};
use crate::schema::{Namespace, ValueType};

/// Opaque encrypted value produced by [`Engine::encrypt`].
///
/// The string form embeds everything [`Engine::decrypt`] needs to reverse
/// it, including a reference to the data key that was used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ciphertext(String);

impl Ciphertext {
    /// Wrap an encoded ciphertext string.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Borrow the encoded form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the encoded form.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Ciphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An index to create on a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    /// Index key document, e.g. `{"keyAltNames": 1}`.
    pub keys: Value,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
    /// Optional partial filter limiting which documents the index covers.
    pub partial_filter: Option<Value>,
}

impl IndexSpec {
    /// A unique index over `keys`.
    pub fn unique_on(keys: Value) -> Self {
        Self {
            keys,
            unique: true,
            partial_filter: None,
        }
    }

    /// Restrict the index to documents matching `filter`.
    pub fn partial(mut self, filter: Value) -> Self {
        self.partial_filter = Some(filter);
        self
    }
}

/// Options for one explicit [`Engine::encrypt`] call.
#[derive(Debug, Clone)]
pub struct EncryptOptions {
    /// The data key to encrypt with.
    pub key_id: DekId,
    /// Encryption algorithm.
    pub algorithm: Algorithm,
    /// Declared type of the plaintext value.
    pub value_type: ValueType,
}

/// Options for [`Engine::open_encrypted_connection`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Namespace of the key registry collection.
    pub key_vault: Namespace,
    /// Master keys available to unwrap data keys.
    pub kms: KmsProviders,
    /// The built encryption config for the connection.
    pub config: EncodedConfig,
    /// Path to a native crypto library, passed through to engines that load
    /// one; ignored by engines that do not.
    pub crypto_lib_path: Option<String>,
}

/// Everything an [`EngineBuilder`] needs to assemble an engine.
#[derive(Clone)]
pub struct EngineContext {
    /// Control-plane handle the engine uses for key registry reads and
    /// writes.
    pub control: Arc<dyn StoreHandle>,
    /// Namespace of the key registry collection.
    pub key_vault: Namespace,
    /// Master keys available to wrap and unwrap data keys.
    pub kms: KmsProviders,
}

/// Opens connections to a document store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Connect to the store at `uri`.
    async fn connect(&self, uri: &str) -> Result<Arc<dyn StoreHandle>, EngineError>;
}

/// A live connection to a document store.
///
/// Handles returned by [`Engine::open_encrypted_connection`] transparently
/// encrypt on write and decrypt on read according to the connection's
/// config; handles from a plain [`StoreConnector`] pass documents through
/// untouched.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// Names of the collections currently present in `database`.
    async fn list_collections(&self, database: &str) -> Result<Vec<String>, EngineError>;

    /// Create an empty collection. Succeeds if it already exists.
    async fn create_collection(&self, database: &str, collection: &str)
        -> Result<(), EngineError>;

    /// Create an index on a collection. Succeeds if an identical index
    /// already exists.
    async fn create_index(&self, namespace: &Namespace, index: IndexSpec)
        -> Result<(), EngineError>;

    /// Insert one document.
    ///
    /// Fails with [`EngineError::DuplicateKey`] when the write violates a
    /// unique index.
    async fn insert_one(&self, namespace: &Namespace, document: Value)
        -> Result<(), EngineError>;

    /// Find the first document matching `filter`.
    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: Value,
    ) -> Result<Option<Value>, EngineError>;

    /// Find all documents matching `filter`.
    async fn find(&self, namespace: &Namespace, filter: Value) -> Result<Vec<Value>, EngineError>;

    /// Close the connection. Further operations on this handle fail with
    /// [`EngineError::Connection`].
    async fn close(&self) -> Result<(), EngineError>;
}

/// Constructs an [`Engine`] once the control connection and master keys are
/// available.
#[async_trait]
pub trait EngineBuilder: Send + Sync {
    /// Assemble an engine bound to the given context.
    async fn build(&self, context: EngineContext) -> Result<Arc<dyn Engine>, EngineError>;
}

/// The encryption engine: data-key lifecycle plus explicit and automatic
/// encryption.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create a new data key wrapped by the named provider's master key and
    /// record it in the key registry.
    ///
    /// Fails with [`EngineError::DuplicateKey`] when another key already
    /// holds one of `alt_names`; callers resolve the race by re-reading the
    /// registry.
    async fn create_data_key(
        &self,
        provider_tag: &str,
        alt_names: &[String],
    ) -> Result<DekId, EngineError>;

    /// Explicitly encrypt a single value.
    async fn encrypt(&self, value: Value, options: EncryptOptions)
        -> Result<Ciphertext, EngineError>;

    /// Explicitly decrypt a value produced by [`Engine::encrypt`].
    async fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Value, EngineError>;

    /// Create `namespace` as an encrypted collection, provisioning data keys
    /// for fields whose config entry does not name one.
    ///
    /// Requires an encrypted-fields config; fails with
    /// [`EngineError::Unsupported`] for a schema-map config.
    async fn create_encrypted_collection(
        &self,
        namespace: &Namespace,
        provider_tag: &str,
        config: &EncodedConfig,
    ) -> Result<(), EngineError>;

    /// Open a store connection that encrypts and decrypts automatically
    /// according to `options.config`.
    async fn open_encrypted_connection(
        &self,
        uri: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn StoreHandle>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ciphertext_serialises_transparently() {
        let ct = Ciphertext::new("v1.abc.def.ghi");
        let json = serde_json::to_value(&ct).unwrap();
        assert_eq!(json, json!("v1.abc.def.ghi"));
        let back: Ciphertext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ct);
    }

    #[test]
    fn index_spec_builder() {
        let index = IndexSpec::unique_on(json!({"keyAltNames": 1}))
            .partial(json!({"keyAltNames": {"$exists": true}}));
        assert!(index.unique);
        assert_eq!(index.keys["keyAltNames"], 1);
        assert!(index.partial_filter.is_some());
    }
}
