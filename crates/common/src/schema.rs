//! Caller-facing description of which fields in a collection are encrypted
//! and how each one may be queried.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::encoding::Algorithm;
use crate::keys::DekId;

/// A `database.collection` pair addressing one collection in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    database: String,
    collection: String,
}

/// The namespace string could not be split into database and collection.
#[derive(Debug, Error)]
#[error("namespace {0:?} is not of the form \"database.collection\"")]
pub struct NamespaceError(pub String);

impl Namespace {
    /// Build a namespace from its two parts.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse a combined `"database.collection"` string.
    ///
    /// The split happens at the first dot; collection names may themselves
    /// contain dots.
    pub fn parse(s: &str) -> Result<Self, NamespaceError> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(NamespaceError(s.to_owned())),
        }
    }

    /// The database part.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The collection part.
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl FromStr for Namespace {
    type Err = NamespaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Declared type of an encrypted field, named after the store's own type
/// aliases so the value lands in config documents unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Int,
    Long,
    Double,
    Decimal,
    Bool,
    Date,
    Binary,
    ObjectId,
    Object,
    Array,
}

impl ValueType {
    /// The type alias emitted into config documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Long => "long",
            ValueType::Double => "double",
            ValueType::Decimal => "decimal",
            ValueType::Bool => "bool",
            ValueType::Date => "date",
            ValueType::Binary => "binData",
            ValueType::ObjectId => "objectId",
            ValueType::Object => "object",
            ValueType::Array => "array",
        }
    }
}

/// How a field is encrypted and, for queryable modes, how it may be queried.
///
/// `Deterministic` and `Randomized` belong to the field-level encoding;
/// `Equality` and `Range` belong to the encrypted-fields encoding. The
/// config builder rejects a mode paired with the wrong encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    /// Same plaintext always yields the same ciphertext; supports equality
    /// lookups against the stored form.
    Deterministic,
    /// Fresh randomness per encryption; the field cannot be queried.
    Randomized,
    /// Queryable-encryption equality index.
    Equality { contention: u32 },
    /// Queryable-encryption range index.
    Range { contention: u32 },
}

impl FieldMode {
    /// Equality mode with the default contention factor of 0.
    pub fn equality() -> Self {
        FieldMode::Equality { contention: 0 }
    }

    /// Range mode with the default contention factor of 0.
    pub fn range() -> Self {
        FieldMode::Range { contention: 0 }
    }

    /// Short lowercase name used in error messages and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FieldMode::Deterministic => "deterministic",
            FieldMode::Randomized => "randomized",
            FieldMode::Equality { .. } => "equality",
            FieldMode::Range { .. } => "range",
        }
    }

    /// The query type emitted into an encrypted-fields document, if any.
    pub fn query_type(&self) -> Option<&'static str> {
        match self {
            FieldMode::Equality { .. } => Some("equality"),
            FieldMode::Range { .. } => Some("range"),
            _ => None,
        }
    }

    /// The contention factor for queryable modes.
    pub fn contention(&self) -> Option<u32> {
        match self {
            FieldMode::Equality { contention } | FieldMode::Range { contention } => {
                Some(*contention)
            }
            _ => None,
        }
    }

    /// The explicit algorithm for field-level modes.
    pub fn algorithm(&self) -> Option<Algorithm> {
        match self {
            FieldMode::Deterministic => Some(Algorithm::Deterministic),
            FieldMode::Randomized => Some(Algorithm::Random),
            _ => None,
        }
    }
}

/// Reference to the data encryption key protecting a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReference {
    /// A known key identifier.
    Id(DekId),
    /// An alternate name resolved through the key registry.
    AltName(String),
}

impl KeyReference {
    /// Reference a key by alternate name.
    pub fn alt_name(name: impl Into<String>) -> Self {
        KeyReference::AltName(name.into())
    }
}

/// One encrypted field within a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    /// Dotted path of the field within the document, e.g. `"ssn"` or
    /// `"contact.email"`.
    pub path: String,
    /// Declared type of the plaintext value.
    pub value_type: ValueType,
    /// Encryption mode.
    pub mode: FieldMode,
    /// Key reference; `None` falls back to the session's default data key.
    pub key: Option<KeyReference>,
}

impl FieldSpec {
    /// A field spec with no explicit key reference.
    pub fn new(path: impl Into<String>, value_type: ValueType, mode: FieldMode) -> Self {
        Self {
            path: path.into(),
            value_type,
            mode,
            key: None,
        }
    }

    /// Pin the field to a known key identifier.
    pub fn with_key_id(mut self, id: DekId) -> Self {
        self.key = Some(KeyReference::Id(id));
        self
    }

    /// Pin the field to a key alternate name.
    pub fn with_key_alt_name(mut self, name: impl Into<String>) -> Self {
        self.key = Some(KeyReference::alt_name(name));
        self
    }
}

/// All encrypted fields of one target collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionSchema {
    namespace: Namespace,
    fields: Vec<FieldSpec>,
}

impl EncryptionSchema {
    /// An empty schema for `namespace`.
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            fields: Vec::new(),
        }
    }

    /// Append a field spec.
    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// The target collection this schema describes.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The declared field specs, in insertion order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Alternate names referenced by any field, deduplicated in first-seen
    /// order. The session resolves each of these to a key id before the
    /// config is built.
    pub fn referenced_alt_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for field in &self.fields {
            if let Some(KeyReference::AltName(name)) = &field.key {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}
