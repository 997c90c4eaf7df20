//! In-memory document store.
//!
//! Holds databases of collections of JSON documents behind a mutex, with
//! just enough server behaviour for the key-lifecycle layer: unique indexes
//! with partial `$exists` filters, dotted-path filter matching, and handles
//! that reject operations after close. Collection options survive as long as
//! the store value does, so metadata written at creation time is visible to
//! later connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use common::engine::{IndexSpec, StoreConnector, StoreHandle};
use common::error::EngineError;
use common::schema::Namespace;

#[derive(Debug, Clone)]
struct UniqueIndex {
    field: String,
    /// Partial filter `{field: {"$exists": true}}`: documents without the
    /// field stay outside the index.
    exists_only: bool,
}

#[derive(Debug, Default)]
struct Collection {
    documents: Vec<Value>,
    unique_indexes: Vec<UniqueIndex>,
    options: Option<Value>,
}

#[derive(Debug, Default)]
struct StoreInner {
    databases: HashMap<String, HashMap<String, Collection>>,
}

impl StoreInner {
    fn collection_mut(&mut self, namespace: &Namespace) -> &mut Collection {
        self.databases
            .entry(namespace.database().to_string())
            .or_default()
            .entry(namespace.collection().to_string())
            .or_default()
    }
}

/// Shared in-memory store. Cloning yields another view of the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh handle onto this store.
    pub fn handle(&self) -> Arc<MemoryHandle> {
        Arc::new(MemoryHandle {
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a collection carrying catalog options, replacing any options
    /// already present.
    pub fn create_collection_with_options(&self, namespace: &Namespace, options: Value) {
        let mut inner = lock(&self.inner);
        inner.collection_mut(namespace).options = Some(options);
    }

    /// Catalog options recorded for a collection, if any.
    pub fn collection_options(&self, namespace: &Namespace) -> Option<Value> {
        let inner = lock(&self.inner);
        inner
            .databases
            .get(namespace.database())?
            .get(namespace.collection())?
            .options
            .clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    // The store is in-process; the URI is accepted for interface parity.
    async fn connect(&self, _uri: &str) -> Result<Arc<dyn StoreHandle>, EngineError> {
        Ok(self.handle())
    }
}

/// One connection to a [`MemoryStore`]. Handles close independently; the
/// underlying data is shared.
pub struct MemoryHandle {
    inner: Arc<Mutex<StoreInner>>,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Connection("connection is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    async fn list_collections(&self, database: &str) -> Result<Vec<String>, EngineError> {
        self.ensure_open()?;
        let inner = lock(&self.inner);
        Ok(inner
            .databases
            .get(database)
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut inner = lock(&self.inner);
        inner
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        Ok(())
    }

    async fn create_index(
        &self,
        namespace: &Namespace,
        index: IndexSpec,
    ) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !index.unique {
            // Non-unique indexes carry no semantics here.
            return Ok(());
        }
        let field = index
            .keys
            .as_object()
            .and_then(|keys| keys.keys().next().cloned())
            .ok_or_else(|| EngineError::Store("index keys document is empty".into()))?;
        let exists_only = index
            .partial_filter
            .as_ref()
            .and_then(|filter| filter.get(&field))
            .and_then(|condition| condition.get("$exists"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut inner = lock(&self.inner);
        let collection = inner.collection_mut(namespace);
        if !collection.unique_indexes.iter().any(|i| i.field == field) {
            collection.unique_indexes.push(UniqueIndex { field, exists_only });
        }
        Ok(())
    }

    async fn insert_one(&self, namespace: &Namespace, document: Value) -> Result<(), EngineError> {
        self.ensure_open()?;
        let mut inner = lock(&self.inner);
        let collection = inner.collection_mut(namespace);

        for index in &collection.unique_indexes {
            let incoming = index_values(&document, &index.field, index.exists_only);
            if incoming.is_empty() {
                continue;
            }
            for existing in &collection.documents {
                let present = index_values(existing, &index.field, index.exists_only);
                if incoming.iter().any(|value| present.contains(value)) {
                    return Err(EngineError::DuplicateKey(format!(
                        "unique index on {:?} violated in {namespace}",
                        index.field
                    )));
                }
            }
        }

        collection.documents.push(document);
        Ok(())
    }

    async fn find_one(
        &self,
        namespace: &Namespace,
        filter: Value,
    ) -> Result<Option<Value>, EngineError> {
        Ok(self.find(namespace, filter).await?.into_iter().next())
    }

    async fn find(&self, namespace: &Namespace, filter: Value) -> Result<Vec<Value>, EngineError> {
        self.ensure_open()?;
        let inner = lock(&self.inner);
        let Some(collection) = inner
            .databases
            .get(namespace.database())
            .and_then(|collections| collections.get(namespace.collection()))
        else {
            return Ok(Vec::new());
        };
        Ok(collection
            .documents
            .iter()
            .filter(|document| matches_filter(document, &filter))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn lock(inner: &Mutex<StoreInner>) -> std::sync::MutexGuard<'_, StoreInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Values a document contributes to a unique index on `field`. Arrays index
/// each element. A document without the field contributes a null entry
/// unless the index is partial on existence.
fn index_values(document: &Value, field: &str, exists_only: bool) -> Vec<Value> {
    match lookup_path(document, field) {
        Some(Value::Array(items)) => items.clone(),
        Some(value) => vec![value.clone()],
        None if exists_only => Vec::new(),
        None => vec![Value::Null],
    }
}

/// Resolve a dotted path like `"kyc.ssn"` inside a document.
pub(crate) fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Match a document against a filter of `path: value` pairs. A value that is
/// an object with `$`-prefixed keys is treated as an operator document;
/// otherwise equality, with array fields matching on membership.
pub(crate) fn matches_filter(document: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };
    conditions.iter().all(|(path, expected)| {
        let actual = lookup_path(document, path);
        match expected.as_object() {
            Some(ops) if ops.keys().any(|key| key.starts_with('$')) => ops
                .iter()
                .all(|(op, operand)| apply_operator(actual, op, operand)),
            _ => match actual {
                Some(Value::Array(items)) => items.contains(expected),
                Some(value) => value == expected,
                None => expected.is_null(),
            },
        }
    })
}

fn apply_operator(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    match op {
        "$eq" => actual == operand,
        "$gt" => compare_values(actual, operand).is_some_and(|ord| ord.is_gt()),
        "$gte" => compare_values(actual, operand).is_some_and(|ord| ord.is_ge()),
        "$lt" => compare_values(actual, operand).is_some_and(|ord| ord.is_lt()),
        "$lte" => compare_values(actual, operand).is_some_and(|ord| ord.is_le()),
        _ => false,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

// --- tests ---
