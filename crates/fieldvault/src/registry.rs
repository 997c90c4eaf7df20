//! [`KeyVaultManager`]: the key registry collection and data-key lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use common::engine::{Engine, IndexSpec, StoreHandle};
use common::error::EngineError;
use common::keys::DekId;
use common::schema::Namespace;

/// Document field holding a data key's alternate names.
pub const KEY_ALT_NAMES_FIELD: &str = "keyAltNames";

/// Errors produced by the key registry layer.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The underlying store or engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A registry document for the alternate name exists but does not carry
    /// a parseable key id.
    #[error("key document for alternate name {alt_name:?} in {namespace} is malformed")]
    MalformedKeyDocument {
        namespace: Namespace,
        alt_name: String,
    },
}

/// Manages the key registry collection: ensures it exists with its unique
/// index, and resolves alternate names to data keys, creating keys on
/// demand.
///
/// Resolution results are memoized, so repeated lookups for the same
/// alternate name hit the store at most once per manager.
pub struct KeyVaultManager {
    store: Arc<dyn StoreHandle>,
    engine: Arc<dyn Engine>,
    namespace: Namespace,
    resolved: RwLock<BTreeMap<String, DekId>>,
}

impl KeyVaultManager {
    /// Manager for the registry collection at `namespace`, reading through
    /// `store` and creating keys through `engine`.
    pub fn new(store: Arc<dyn StoreHandle>, engine: Arc<dyn Engine>, namespace: Namespace) -> Self {
        Self {
            store,
            engine,
            namespace,
            resolved: RwLock::new(BTreeMap::new()),
        }
    }

    /// The registry collection namespace.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Make sure the registry collection exists and carries the unique
    /// partial index on alternate names.
    ///
    /// The index is what turns concurrent key creation for one alternate
    /// name into a detectable [`EngineError::DuplicateKey`]; the partial
    /// filter keeps keys without alternate names out of the uniqueness
    /// constraint.
    pub async fn ensure_registry(&self) -> Result<(), RegistryError> {
        let existing = self
            .store
            .list_collections(self.namespace.database())
            .await?;
        if !existing.iter().any(|c| c == self.namespace.collection()) {
            self.store
                .create_collection(self.namespace.database(), self.namespace.collection())
                .await?;
            info!(namespace = %self.namespace, "created key registry collection");
        }

        let index = IndexSpec::unique_on(json!({ KEY_ALT_NAMES_FIELD: 1 }))
            .partial(json!({ KEY_ALT_NAMES_FIELD: { "$exists": true } }));
        self.store.create_index(&self.namespace, index).await?;
        Ok(())
    }

    /// Resolve `alt_name` to a data key id, creating the key through the
    /// engine when no registry document holds that name yet.
    ///
    /// Concurrent callers racing to create the same name all converge on a
    /// single key: the unique index rejects the losers, which then re-read
    /// the winner's document.
    pub async fn get_or_create_data_key(
        &self,
        alt_name: &str,
        provider_tag: &str,
    ) -> Result<DekId, RegistryError> {
        if let Some(id) = self.resolved.read().await.get(alt_name) {
            return Ok(*id);
        }

        loop {
            let filter = json!({ KEY_ALT_NAMES_FIELD: alt_name });
            if let Some(doc) = self.store.find_one(&self.namespace, filter).await? {
                let id = self.key_id_from(&doc, alt_name)?;
                self.memoize(alt_name, id).await;
                return Ok(id);
            }

            match self
                .engine
                .create_data_key(provider_tag, &[alt_name.to_owned()])
                .await
            {
                Ok(id) => {
                    info!(alt_name, %id, "created data key");
                    self.memoize(alt_name, id).await;
                    return Ok(id);
                }
                Err(e) if e.is_duplicate_key() => {
                    warn!(alt_name, "data key creation lost a race; re-reading the winner");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn key_id_from(&self, doc: &Value, alt_name: &str) -> Result<DekId, RegistryError> {
        doc.get("_id")
            .and_then(Value::as_str)
            .and_then(|s| DekId::parse_str(s).ok())
            .ok_or_else(|| RegistryError::MalformedKeyDocument {
                namespace: self.namespace.clone(),
                alt_name: alt_name.to_owned(),
            })
    }

    async fn memoize(&self, alt_name: &str, id: DekId) {
        self.resolved.write().await.insert(alt_name.to_owned(), id);
    }
}
