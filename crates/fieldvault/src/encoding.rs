//! Pure construction of encryption config documents from an
//! [`EncryptionSchema`] and a set of resolved keys.
//!
//! Building is deterministic: the same schema, mode, and keys always produce
//! a byte-identical document, so configs can be compared and cached.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use thiserror::Error;

use common::encoding::{EncodedConfig, EncodingMode};
use common::keys::DekId;
use common::schema::{EncryptionSchema, FieldSpec, KeyReference};

/// Key ids available to the builder, gathered by the session before the
/// config is built.
#[derive(Debug, Clone, Default)]
pub struct ResolvedKeys {
    default: Option<DekId>,
    by_alt_name: BTreeMap<String, DekId>,
}

impl ResolvedKeys {
    /// An empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback key for fields without an explicit reference.
    pub fn with_default(mut self, id: DekId) -> Self {
        self.default = Some(id);
        self
    }

    /// Record the key id an alternate name resolved to.
    pub fn insert(&mut self, alt_name: impl Into<String>, id: DekId) {
        self.by_alt_name.insert(alt_name.into(), id);
    }

    /// The fallback key, if any.
    pub fn default_key(&self) -> Option<DekId> {
        self.default
    }

    /// The key id an alternate name resolved to, if recorded.
    pub fn get(&self, alt_name: &str) -> Option<DekId> {
        self.by_alt_name.get(alt_name).copied()
    }

    /// Resolve a field's key reference: an explicit id is used as-is, an
    /// alternate name is looked up, and no reference falls back to the
    /// default key.
    pub fn resolve(&self, reference: Option<&KeyReference>) -> Option<DekId> {
        match reference {
            Some(KeyReference::Id(id)) => Some(*id),
            Some(KeyReference::AltName(name)) => self.get(name),
            None => self.default,
        }
    }
}

/// Errors detected while building a config document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field needs a key but neither its reference nor the default key
    /// resolves to one.
    #[error("field {path:?} has no resolvable data key reference")]
    MissingKeyReference { path: String },

    /// The field's mode does not fit the requested encoding.
    #[error("field {path:?}: mode {mode:?} is not supported by the {encoding} encoding")]
    UnsupportedQueryType {
        path: String,
        mode: &'static str,
        encoding: &'static str,
    },

    /// A field spec has an empty path.
    #[error("field spec at index {index} has an empty path")]
    EmptyFieldPath { index: usize },

    /// Two field specs name the same path, or one path is a dotted prefix
    /// of the other.
    #[error("field paths {first:?} and {second:?} overlap")]
    ConflictingFieldPath { first: String, second: String },
}

/// Build the config document for `schema` in the requested encoding.
///
/// Overlapping field paths are rejected in both encodings: an entry for a
/// path and an entry nested below it cannot coexist in one document.
pub fn build_config(
    schema: &EncryptionSchema,
    mode: EncodingMode,
    keys: &ResolvedKeys,
) -> Result<EncodedConfig, ConfigError> {
    check_path_conflicts(schema.fields())?;
    match mode {
        EncodingMode::FieldLevel => build_schema_map(schema, keys),
        EncodingMode::Queryable => build_encrypted_fields(schema, keys),
    }
}

/// Field-level encoding: a schema map with one `encrypt` entry per field,
/// nested under wrapper objects along the field's dotted path.
fn build_schema_map(
    schema: &EncryptionSchema,
    keys: &ResolvedKeys,
) -> Result<EncodedConfig, ConfigError> {
    let mut properties = Map::new();
    for (index, field) in schema.fields().iter().enumerate() {
        if field.path.is_empty() {
            return Err(ConfigError::EmptyFieldPath { index });
        }
        let algorithm =
            field
                .mode
                .algorithm()
                .ok_or_else(|| ConfigError::UnsupportedQueryType {
                    path: field.path.clone(),
                    mode: field.mode.label(),
                    encoding: EncodingMode::FieldLevel.as_str(),
                })?;
        let key_id = keys
            .resolve(field.key.as_ref())
            .ok_or_else(|| ConfigError::MissingKeyReference {
                path: field.path.clone(),
            })?;

        let entry = json!({
            "bsonType": field.value_type.as_str(),
            "encrypt": {
                "keyId": [key_id.to_string()],
                "algorithm": algorithm.identifier(),
                "bsonType": field.value_type.as_str(),
            }
        });
        insert_at_path(&mut properties, &field.path, entry);
    }

    let document = json!({
        schema.namespace().to_string(): {
            "bsonType": "object",
            "properties": properties,
        }
    });
    Ok(EncodedConfig::SchemaMap(document))
}

/// Encrypted-fields encoding: one entry per field with its query
/// capabilities. A key id is emitted only for fields with an explicit
/// reference; the engine provisions keys for the rest when the collection
/// is created.
fn build_encrypted_fields(
    schema: &EncryptionSchema,
    keys: &ResolvedKeys,
) -> Result<EncodedConfig, ConfigError> {
    let mut fields = Vec::new();
    for (index, field) in schema.fields().iter().enumerate() {
        if field.path.is_empty() {
            return Err(ConfigError::EmptyFieldPath { index });
        }
        let query_type =
            field
                .mode
                .query_type()
                .ok_or_else(|| ConfigError::UnsupportedQueryType {
                    path: field.path.clone(),
                    mode: field.mode.label(),
                    encoding: EncodingMode::Queryable.as_str(),
                })?;

        let mut entry = Map::new();
        entry.insert("path".into(), Value::String(field.path.clone()));
        entry.insert(
            "bsonType".into(),
            Value::String(field.value_type.as_str().into()),
        );
        entry.insert(
            "queries".into(),
            json!({
                "queryType": query_type,
                "contention": field.mode.contention().unwrap_or(0),
            }),
        );
        if let Some(reference) = &field.key {
            let key_id =
                keys.resolve(Some(reference))
                    .ok_or_else(|| ConfigError::MissingKeyReference {
                        path: field.path.clone(),
                    })?;
            entry.insert("keyId".into(), Value::String(key_id.to_string()));
        }
        fields.push(Value::Object(entry));
    }

    let document = json!({
        schema.namespace().to_string(): { "fields": fields }
    });
    Ok(EncodedConfig::EncryptedFieldsMap(document))
}

/// Reject field lists where one path is equal to or a dotted prefix of
/// another. Empty paths are left for the per-encoding builders, which
/// report them with their index.
fn check_path_conflicts(fields: &[FieldSpec]) -> Result<(), ConfigError> {
    let paths: Vec<&str> = fields
        .iter()
        .map(|field| field.path.as_str())
        .filter(|path| !path.is_empty())
        .collect();
    for (index, &path) in paths.iter().enumerate() {
        for &earlier in &paths[..index] {
            if paths_overlap(earlier, path) {
                return Err(ConfigError::ConflictingFieldPath {
                    first: earlier.to_owned(),
                    second: path.to_owned(),
                });
            }
        }
    }
    Ok(())
}

fn paths_overlap(a: &str, b: &str) -> bool {
    a == b
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('.'))
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('.'))
}

/// Insert `entry` at a dotted `path`, creating `bsonType: object` wrapper
/// levels for each intermediate segment.
fn insert_at_path(map: &mut Map<String, Value>, path: &str, entry: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_owned(), entry);
        }
        Some((head, rest)) => {
            let node = map
                .entry(head.to_owned())
                .or_insert_with(|| json!({ "bsonType": "object", "properties": {} }));
            if let Some(Value::Object(sub)) = node.get_mut("properties") {
                insert_at_path(sub, rest, entry);
            } else {
                let mut sub = Map::new();
                insert_at_path(&mut sub, rest, entry);
                *node = json!({ "bsonType": "object", "properties": sub });
            }
        }
    }
}
