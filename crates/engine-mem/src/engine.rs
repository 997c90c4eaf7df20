//! In-memory encryption engine.
//!
//! Implements the data-key lifecycle against the key registry plus automatic
//! field encryption for store handles. Data keys are wrapped under the
//! provider master key before they touch the registry, deterministic fields
//! answer equality queries over ciphertext, and encrypted collections keep
//! their provisioned field metadata in the store catalog so a later
//! connection can pick it up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use common::encoding::{Algorithm, EncodedConfig, EncodingMode};
use common::engine::{
    Ciphertext, ConnectOptions, EncryptOptions, Engine, EngineBuilder, EngineContext, IndexSpec,
    StoreHandle,
};
use common::error::EngineError;
use common::keys::{DekId, KmsProviders, LOCAL_PROVIDER, MasterKey};
use common::schema::Namespace;

use crate::cipher::{self, CipherError, EncryptedValue};
use crate::store::{matches_filter, MemoryStore};

/// Builds [`MemoryEngine`]s over a shared [`MemoryStore`].
pub struct MemoryEngineBuilder {
    store: MemoryStore,
}

impl MemoryEngineBuilder {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EngineBuilder for MemoryEngineBuilder {
    async fn build(&self, context: EngineContext) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::new(MemoryEngine {
            store: self.store.clone(),
            control: context.control,
            key_vault: context.key_vault,
            kms: context.kms,
        }))
    }
}

/// Engine over a [`MemoryStore`], holding the control connection used for
/// key registry access and the master keys used to wrap data keys.
pub struct MemoryEngine {
    store: MemoryStore,
    control: Arc<dyn StoreHandle>,
    key_vault: Namespace,
    kms: KmsProviders,
}

impl MemoryEngine {
    fn master_for<'a>(
        &'a self,
        kms: Option<&'a KmsProviders>,
        provider_tag: &str,
    ) -> Result<&'a MasterKey, EngineError> {
        kms.and_then(|extra| extra.get(provider_tag))
            .or_else(|| self.kms.get(provider_tag))
            .ok_or_else(|| {
                EngineError::Unsupported(format!(
                    "no master key registered for provider {provider_tag:?}"
                ))
            })
    }

    async fn insert_key_document(
        &self,
        provider_tag: &str,
        alt_names: &[String],
    ) -> Result<DekId, EngineError> {
        let master = self.master_for(None, provider_tag)?;
        let material = cipher::generate_key_material();
        let wrapped = cipher::wrap_key(&material, master.as_bytes()).map_err(crypto)?;

        let id = DekId::new();
        let mut document = Map::new();
        document.insert("_id".into(), Value::String(id.to_string()));
        document.insert("keyMaterial".into(), Value::String(wrapped));
        document.insert("provider".into(), Value::String(provider_tag.to_string()));
        document.insert("creationDate".into(), json!(epoch_seconds()));
        if !alt_names.is_empty() {
            document.insert("keyAltNames".into(), json!(alt_names));
        }

        self.control
            .insert_one(&self.key_vault, Value::Object(document))
            .await?;
        debug!(key_id = %id, provider = provider_tag, "created data key");
        Ok(id)
    }

    /// Unwrap the material of a registered data key. `kms` takes precedence
    /// over the engine's own providers when both know the key's provider.
    async fn key_material(
        &self,
        kms: Option<&KmsProviders>,
        id: DekId,
    ) -> Result<Vec<u8>, EngineError> {
        let document = self
            .control
            .find_one(&self.key_vault, json!({"_id": id.to_string()}))
            .await?
            .ok_or_else(|| {
                EngineError::Crypto(format!("data key {id} not found in {}", self.key_vault))
            })?;
        let wrapped = document
            .get("keyMaterial")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Crypto(format!("data key {id} has no key material")))?;
        let provider = document
            .get("provider")
            .and_then(Value::as_str)
            .unwrap_or(LOCAL_PROVIDER);

        let master = self.master_for(kms, provider)?;
        cipher::unwrap_key(wrapped, master.as_bytes()).map_err(crypto)
    }

    fn rules_from_encrypted_fields(
        &self,
        document: &Value,
    ) -> Result<Vec<(String, Vec<RuleSpec>)>, EngineError> {
        let map = document
            .as_object()
            .ok_or_else(|| EngineError::Unsupported("encrypted-fields map is not an object".into()))?;

        let mut out = Vec::with_capacity(map.len());
        for (ns_str, entry) in map {
            let namespace: Namespace = ns_str
                .parse()
                .map_err(|e| EngineError::Unsupported(format!("config key {ns_str:?}: {e}")))?;

            // Collections created through the engine carry their provisioned
            // field metadata in the catalog; prefer it over the raw config so
            // fields without an explicit key resolve to the provisioned one.
            let catalog = self.store.collection_options(&namespace);
            let fields_owner = catalog
                .as_ref()
                .and_then(|options| options.get("encryptedFields"))
                .unwrap_or(entry);
            let fields = fields_owner
                .get("fields")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    EngineError::Unsupported(format!("config entry for {ns_str} has no fields"))
                })?;

            let mut specs = Vec::with_capacity(fields.len());
            for field in fields {
                specs.push(RuleSpec::from_encrypted_field(ns_str, field)?);
            }
            out.push((ns_str.clone(), specs));
        }
        Ok(out)
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn create_data_key(
        &self,
        provider_tag: &str,
        alt_names: &[String],
    ) -> Result<DekId, EngineError> {
        self.insert_key_document(provider_tag, alt_names).await
    }

    async fn encrypt(
        &self,
        value: Value,
        options: EncryptOptions,
    ) -> Result<Ciphertext, EngineError> {
        let material = self.key_material(None, options.key_id).await?;
        let plaintext = serde_json::to_vec(&value).map_err(|e| EngineError::Crypto(e.to_string()))?;
        let deterministic = options.algorithm == Algorithm::Deterministic;
        let token = cipher::encrypt_value(
            &plaintext,
            &material,
            &options.key_id.to_string(),
            deterministic,
        )
        .map_err(crypto)?;
        Ok(Ciphertext::new(token.to_string_repr()))
    }

    async fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Value, EngineError> {
        let token = EncryptedValue::from_str_repr(ciphertext.as_str()).map_err(crypto)?;
        let id = DekId::parse_str(&token.key_ref).map_err(|_| {
            EngineError::Crypto(format!("ciphertext names a malformed key id {:?}", token.key_ref))
        })?;
        let material = self.key_material(None, id).await?;
        let plaintext = cipher::decrypt_value(&token, &material).map_err(crypto)?;
        serde_json::from_slice(&plaintext).map_err(|e| EngineError::Crypto(e.to_string()))
    }

    async fn create_encrypted_collection(
        &self,
        namespace: &Namespace,
        provider_tag: &str,
        config: &EncodedConfig,
    ) -> Result<(), EngineError> {
        if config.mode() != EncodingMode::Queryable {
            return Err(EngineError::Unsupported(
                "encrypted collections require an encrypted-fields config".into(),
            ));
        }
        let entry = config.collection_entry(namespace).ok_or_else(|| {
            EngineError::Unsupported(format!("config has no entry for {namespace}"))
        })?;
        let fields = entry
            .get("fields")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                EngineError::Unsupported(format!("config entry for {namespace} has no fields"))
            })?;

        let mut provisioned = Vec::with_capacity(fields.len());
        for field in fields {
            let mut field = field.as_object().cloned().ok_or_else(|| {
                EngineError::Unsupported(format!("malformed field entry for {namespace}"))
            })?;
            if !field.contains_key("keyId") {
                let id = self.insert_key_document(provider_tag, &[]).await?;
                field.insert("keyId".into(), Value::String(id.to_string()));
            }
            provisioned.push(Value::Object(field));
        }

        self.store.create_collection_with_options(
            namespace,
            json!({"encryptedFields": {"fields": provisioned}}),
        );
        debug!(namespace = %namespace, "created encrypted collection");
        Ok(())
    }

    async fn open_encrypted_connection(
        &self,
        _uri: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn StoreHandle>, EngineError> {
        let mode = options.config.mode();
        let specs = match &options.config {
            EncodedConfig::SchemaMap(document) => rules_from_schema_map(document)?,
            EncodedConfig::EncryptedFieldsMap(document) => {
                self.rules_from_encrypted_fields(document)?
            }
        };

        // Resolve all key material up front so reads and writes on the
        // returned handle never touch the registry.
        let mut rules: HashMap<String, Vec<FieldRule>> = HashMap::new();
        let mut keys: HashMap<String, Vec<u8>> = HashMap::new();
        for (ns, spec_list) in specs {
            let mut resolved = Vec::with_capacity(spec_list.len());
            for spec in spec_list {
                let material = self.key_material(Some(&options.kms), spec.key_id).await?;
                keys.insert(spec.key_id.to_string(), material.clone());
                resolved.push(FieldRule {
                    path: spec.path,
                    key_id: spec.key_id,
                    material,
                    deterministic: spec.deterministic,
                    query: spec.query,
                });
            }
            rules.insert(ns, resolved);
        }

        debug!(mode = %mode, collections = rules.len(), "opened encrypted connection");
        Ok(Arc::new(EncryptedHandle {
            base: self.store.handle(),
            mode,
            rules,
            keys,
        }))
    }
}

// --- encryption rules ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryCap {
    Equality,
    Range,
}

struct RuleSpec {
    path: String,
    key_id: DekId,
    deterministic: bool,
    query: Option<QueryCap>,
}

impl RuleSpec {
    fn from_encrypted_field(ns: &str, field: &Value) -> Result<Self, EngineError> {
        let path = field
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Unsupported(format!("field entry in {ns} has no path")))?;
        let key_id = field.get("keyId").and_then(Value::as_str).ok_or_else(|| {
            EngineError::Unsupported(format!(
                "field {path:?} in {ns} has no provisioned key; create the collection through the engine first"
            ))
        })?;
        let key_id = DekId::parse_str(key_id).map_err(|_| {
            EngineError::Unsupported(format!("field {path:?} in {ns} has a malformed key id"))
        })?;
        let query = match field
            .get("queries")
            .and_then(|queries| queries.get("queryType"))
            .and_then(Value::as_str)
        {
            Some("equality") => Some(QueryCap::Equality),
            Some("range") => Some(QueryCap::Range),
            Some(other) => {
                return Err(EngineError::Unsupported(format!(
                    "unknown query type {other:?} for field {path:?}"
                )))
            }
            None => None,
        };
        Ok(Self {
            path: path.to_string(),
            key_id,
            // Stored deterministically so the decrypt-then-match path can
            // also short-circuit on ciphertext equality.
            deterministic: true,
            query,
        })
    }
}

fn rules_from_schema_map(document: &Value) -> Result<Vec<(String, Vec<RuleSpec>)>, EngineError> {
    let map = document
        .as_object()
        .ok_or_else(|| EngineError::Unsupported("schema map is not an object".into()))?;
    let mut out = Vec::with_capacity(map.len());
    for (ns, entry) in map {
        let mut specs = Vec::new();
        if let Some(properties) = entry.get("properties").and_then(Value::as_object) {
            collect_schema_rules(properties, None, &mut specs)?;
        }
        out.push((ns.clone(), specs));
    }
    Ok(out)
}

fn collect_schema_rules(
    properties: &Map<String, Value>,
    prefix: Option<&str>,
    out: &mut Vec<RuleSpec>,
) -> Result<(), EngineError> {
    for (name, node) in properties {
        let path = match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.clone(),
        };
        if let Some(encrypt) = node.get("encrypt") {
            let key_id = encrypt
                .get("keyId")
                .and_then(Value::as_array)
                .and_then(|ids| ids.first())
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    EngineError::Unsupported(format!("schema entry for {path:?} names no key id"))
                })?;
            let key_id = DekId::parse_str(key_id).map_err(|_| {
                EngineError::Unsupported(format!("schema entry for {path:?} has a malformed key id"))
            })?;
            let algorithm = encrypt
                .get("algorithm")
                .and_then(Value::as_str)
                .and_then(Algorithm::from_identifier)
                .ok_or_else(|| {
                    EngineError::Unsupported(format!(
                        "schema entry for {path:?} names an unknown algorithm"
                    ))
                })?;
            out.push(RuleSpec {
                path,
                key_id,
                deterministic: algorithm == Algorithm::Deterministic,
                query: None,
            });
        } else if let Some(nested) = node.get("properties").and_then(Value::as_object) {
            collect_schema_rules(nested, Some(&path), out)?;
        }
    }
    Ok(())
}

// --- encrypting store handle ---

/// Store handle that encrypts on write and decrypts on read according to the
/// rules compiled from the connection's config.
struct EncryptedHandle {
    base: Arc<crate::store::MemoryHandle>,
    mode: EncodingMode,
    rules: HashMap<String, Vec<FieldRule>>,
    keys: HashMap<String, Vec<u8>>,
}

struct FieldRule {
    path: String,
    key_id: DekId,
    material: Vec<u8>,
    deterministic: bool,
    query: Option<QueryCap>,
}

impl EncryptedHandle {
    fn rules_for(&self, namespace: &Namespace) -> Option<&[FieldRule]> {
        self.rules.get(&namespace.to_string()).map(Vec::as_slice)
    }

    fn encrypt_document(
        &self,
        namespace: &Namespace,
        mut document: Value,
    ) -> Result<Value, EngineError> {
        let Some(rules) = self.rules_for(namespace) else {
            return Ok(document);
        };
        for rule in rules {
            if let Some(slot) = lookup_path_mut(&mut document, &rule.path) {
                if slot.is_null() {
                    continue;
                }
                let plaintext =
                    serde_json::to_vec(&*slot).map_err(|e| EngineError::Crypto(e.to_string()))?;
                let token = cipher::encrypt_value(
                    &plaintext,
                    &rule.material,
                    &rule.key_id.to_string(),
                    rule.deterministic,
                )
                .map_err(crypto)?;
                *slot = Value::String(token.to_string_repr());
            }
        }
        Ok(document)
    }

    fn decrypt_document(&self, mut document: Value) -> Value {
        decrypt_in_place(&mut document, &self.keys);
        document
    }

    /// Rewrite equality predicates on deterministic fields to their
    /// ciphertext form. Predicates on randomized fields are left alone and
    /// simply never match, same as querying ciphertext on a real store.
    fn rewrite_filter(&self, namespace: &Namespace, filter: Value) -> Result<Value, EngineError> {
        let Some(rules) = self.rules_for(namespace) else {
            return Ok(filter);
        };
        let mut conditions = match filter {
            Value::Object(conditions) => conditions,
            other => return Ok(other),
        };
        for (path, expected) in conditions.iter_mut() {
            let Some(rule) = rules.iter().find(|rule| rule.path == *path) else {
                continue;
            };
            if is_operator_document(expected) {
                return Err(EngineError::Unsupported(format!(
                    "only equality predicates are supported on encrypted field {path:?}"
                )));
            }
            if !rule.deterministic {
                continue;
            }
            let plaintext =
                serde_json::to_vec(&*expected).map_err(|e| EngineError::Crypto(e.to_string()))?;
            let token =
                cipher::encrypt_value(&plaintext, &rule.material, &rule.key_id.to_string(), true)
                    .map_err(crypto)?;
            *expected = Value::String(token.to_string_repr());
        }
        Ok(Value::Object(conditions))
    }

    /// Reject predicates the collection's query capabilities do not cover.
    fn check_query_caps(&self, namespace: &Namespace, filter: &Value) -> Result<(), EngineError> {
        let Some(rules) = self.rules_for(namespace) else {
            return Ok(());
        };
        let Some(conditions) = filter.as_object() else {
            return Ok(());
        };
        for (path, expected) in conditions {
            let Some(rule) = rules.iter().find(|rule| rule.path == *path) else {
                continue;
            };
            let wants_range = expected.as_object().is_some_and(|ops| {
                ops.keys()
                    .any(|key| matches!(key.as_str(), "$gt" | "$gte" | "$lt" | "$lte"))
            });
            match rule.query {
                Some(QueryCap::Range) => {}
                Some(QueryCap::Equality) if !wants_range => {}
                Some(QueryCap::Equality) => {
                    return Err(EngineError::Unsupported(format!(
                        "field {path:?} is indexed for equality only"
                    )))
                }
                None => {
                    return Err(EngineError::Unsupported(format!(
                        "field {path:?} is not queryable"
                    )))
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreHandle for EncryptedHandle {
    async fn list_collections(&self, database: &str) -> Result<Vec<String>, EngineError> {
        self.base.list_collections(database).await
    }

    async fn create_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<(), EngineError> {
        self.base.create_collection(database, collection).await
    }

    async fn create_index(
        &self,
        namespace: &Namespace,
        index: IndexSpec,
    ) -> Result<(), EngineError> {
        self.base.create_index(namespace, index).await
    }

    async fn insert_one(&self, namespace: &Namespace, document: Value) -> Result<(), EngineError> {
        let document = self.encrypt_document(namespace, document)?;
        self.base.insert_one(namespace, document).await
    }

    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: Value,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self.find(namespace, filter).await?.into_iter().next())
    }

    async fn find(&self, namespace: &Namespace, filter: Value) -> Result<Vec<Value>, EngineError> {
        match self.mode {
            EncodingMode::FieldLevel => {
                let rewritten = self.rewrite_filter(namespace, filter)?;
                let found = self.base.find(namespace, rewritten).await?;
                Ok(found
                    .into_iter()
                    .map(|document| self.decrypt_document(document))
                    .collect())
            }
            EncodingMode::Queryable => {
                self.check_query_caps(namespace, &filter)?;
                let all = self.base.find(namespace, json!({})).await?;
                Ok(all
                    .into_iter()
                    .map(|document| self.decrypt_document(document))
                    .filter(|document| matches_filter(document, &filter))
                    .collect())
            }
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.base.close().await
    }
}

// --- helpers ---

fn crypto(err: CipherError) -> EngineError {
    EngineError::Crypto(err.to_string())
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn is_operator_document(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|ops| ops.keys().any(|key| key.starts_with('$')))
}

fn lookup_path_mut<'a>(document: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Decrypt every encrypted token reachable in the document for which a key
/// is available. Tokens under unknown keys are left in place.
fn decrypt_in_place(value: &mut Value, keys: &HashMap<String, Vec<u8>>) {
    match value {
        Value::Object(map) => map.values_mut().for_each(|v| decrypt_in_place(v, keys)),
        Value::Array(items) => items.iter_mut().for_each(|v| decrypt_in_place(v, keys)),
        Value::String(s) if cipher::is_encrypted_repr(s) => {
            if let Some(plain) = try_decrypt_token(s, keys) {
                *value = plain;
            }
        }
        _ => {}
    }
}

fn try_decrypt_token(token: &str, keys: &HashMap<String, Vec<u8>>) -> Option<Value> {
    let parsed = EncryptedValue::from_str_repr(token).ok()?;
    let material = keys.get(&parsed.key_ref)?;
    let plaintext = cipher::decrypt_value(&parsed, material).ok()?;
    serde_json::from_slice(&plaintext).ok()
}

// --- tests ---
