use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use common::encoding::EncodingMode;
use common::engine::StoreHandle;
use common::error::EngineError;
use common::schema::{EncryptionSchema, FieldMode, FieldSpec, Namespace, ValueType};
use engine_mem::{MemoryEngineBuilder, MemoryStore};
use fieldvault::{
    CodecError, EncryptedSession, FieldOptions, LocalFileProvider, MasterKeyProvider,
    SessionOptions,
};

fn vault() -> Namespace {
    Namespace::new("encryption", "keyVault")
}

fn customers() -> Namespace {
    Namespace::new("demo", "customers")
}

fn options() -> SessionOptions {
    SessionOptions::new("mem://local", vault(), customers(), "demo-data-key")
}

fn pii_schema() -> EncryptionSchema {
    EncryptionSchema::new(customers())
        .with_field(FieldSpec::new(
            "ssn",
            ValueType::String,
            FieldMode::Deterministic,
        ))
        .with_field(FieldSpec::new(
            "card",
            ValueType::String,
            FieldMode::Randomized,
        ))
}

fn qe_schema() -> EncryptionSchema {
    EncryptionSchema::new(customers())
        .with_field(FieldSpec::new("ssn", ValueType::String, FieldMode::equality()))
        .with_field(FieldSpec::new("age", ValueType::Int, FieldMode::range()))
}

fn session_over(store: &MemoryStore, key_file: &std::path::Path) -> EncryptedSession {
    // First call installs the subscriber; later calls are ignored.
    let _ = fieldvault::telemetry::init("info");
    EncryptedSession::new(
        options(),
        Arc::new(store.clone()),
        Arc::new(MemoryEngineBuilder::new(store.clone())),
        Arc::new(LocalFileProvider::new(key_file)),
    )
}

#[tokio::test]
async fn field_level_round_trip_hides_and_recovers_values() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    let mut session = session_over(&store, &dir.path().join("master.key"));

    let handle = session
        .init(&pii_schema(), EncodingMode::FieldLevel)
        .await
        .unwrap();
    handle
        .insert_one(
            &customers(),
            json!({"name": "carol", "ssn": "123-45-6789", "card": "4111 1111 1111 1111"}),
        )
        .await
        .unwrap();

    let raw = store
        .handle()
        .find_one(&customers(), json!({"name": "carol"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw["name"], "carol");
    assert!(raw["ssn"].as_str().unwrap().starts_with("v1."));
    assert!(raw["card"].as_str().unwrap().starts_with("v1."));

    let found = handle
        .find_one(&customers(), json!({"ssn": "123-45-6789"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["card"], "4111 1111 1111 1111");

    // Randomized fields cannot be matched by value.
    let miss = handle
        .find_one(&customers(), json!({"card": "4111 1111 1111 1111"}))
        .await
        .unwrap();
    assert!(miss.is_none());
}

#[tokio::test]
async fn restarted_session_reuses_master_key_and_data_key() {
    let dir = tempdir().unwrap();
    let key_file = dir.path().join("master.key");
    let store = MemoryStore::new();

    let mut first = session_over(&store, &key_file);
    let handle = first
        .init(&pii_schema(), EncodingMode::FieldLevel)
        .await
        .unwrap();
    handle
        .insert_one(&customers(), json!({"name": "ann", "ssn": "111-22-3333"}))
        .await
        .unwrap();
    first.close().await.unwrap();

    let mut second = session_over(&store, &key_file);
    let handle = second
        .init(&pii_schema(), EncodingMode::FieldLevel)
        .await
        .unwrap();

    // Deterministic equality only works if the restarted session resolved
    // the same data key under the same master key.
    let found = handle
        .find_one(&customers(), json!({"ssn": "111-22-3333"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["name"], "ann");

    let keys = store
        .handle()
        .find(&vault(), json!({"keyAltNames": "demo-data-key"}))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
}

#[tokio::test]
async fn queryable_session_answers_declared_queries() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    let mut session = session_over(&store, &dir.path().join("master.key"));

    let handle = session
        .init(&qe_schema(), EncodingMode::Queryable)
        .await
        .unwrap();
    handle
        .insert_one(&customers(), json!({"name": "ann", "ssn": "111", "age": 34}))
        .await
        .unwrap();
    handle
        .insert_one(&customers(), json!({"name": "bob", "ssn": "222", "age": 51}))
        .await
        .unwrap();

    let raw = store.handle().find(&customers(), json!({})).await.unwrap();
    assert!(raw[0]["ssn"].as_str().unwrap().starts_with("v1."));
    assert!(raw[0]["age"].as_str().unwrap().starts_with("v1."));

    let by_ssn = handle
        .find(&customers(), json!({"ssn": "222"}))
        .await
        .unwrap();
    assert_eq!(by_ssn.len(), 1);
    assert_eq!(by_ssn[0]["name"], "bob");

    let by_age = handle
        .find(&customers(), json!({"age": {"$gte": 40}}))
        .await
        .unwrap();
    assert_eq!(by_age.len(), 1);
    assert_eq!(by_age[0]["name"], "bob");

    // The ssn field is indexed for equality only.
    let err = handle
        .find(&customers(), json!({"ssn": {"$gte": "1"}}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unsupported(_)));
}

#[tokio::test]
async fn queryable_collection_survives_session_restart() {
    let dir = tempdir().unwrap();
    let key_file = dir.path().join("master.key");
    let store = MemoryStore::new();

    let mut first = session_over(&store, &key_file);
    let handle = first
        .init(&qe_schema(), EncodingMode::Queryable)
        .await
        .unwrap();
    handle
        .insert_one(&customers(), json!({"name": "ann", "ssn": "111", "age": 34}))
        .await
        .unwrap();
    first.close().await.unwrap();

    let provisioned = store.handle().find(&vault(), json!({})).await.unwrap().len();

    let mut second = session_over(&store, &key_file);
    let handle = second
        .init(&qe_schema(), EncodingMode::Queryable)
        .await
        .unwrap();

    let by_age = handle
        .find(&customers(), json!({"age": {"$lte": 40}}))
        .await
        .unwrap();
    assert_eq!(by_age.len(), 1);
    assert_eq!(by_age[0]["name"], "ann");

    // The existing collection and its provisioned keys were reused.
    let keys = store.handle().find(&vault(), json!({})).await.unwrap();
    assert_eq!(keys.len(), provisioned);
}

#[tokio::test]
async fn explicit_codec_creates_and_reuses_alt_name_keys() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    let mut session = session_over(&store, &dir.path().join("master.key"));
    session
        .init(&pii_schema(), EncodingMode::FieldLevel)
        .await
        .unwrap();
    let codec = session.codec().unwrap();

    let token = codec
        .encrypt_field(json!("policy-8812"), &FieldOptions::alt_name("claims-key"))
        .await
        .unwrap();
    assert!(token.as_str().starts_with("v1."));
    assert_eq!(codec.decrypt_field(&token).await.unwrap(), json!("policy-8812"));

    codec
        .encrypt_field(json!("policy-9944"), &FieldOptions::alt_name("claims-key"))
        .await
        .unwrap();
    let keys = store
        .handle()
        .find(&vault(), json!({"keyAltNames": "claims-key"}))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);

    assert!(matches!(
        codec
            .encrypt_field(json!(null), &FieldOptions::alt_name("claims-key"))
            .await,
        Err(CodecError::MissingValue)
    ));
}

#[tokio::test]
async fn concurrent_sessions_share_one_default_key() {
    let dir = tempdir().unwrap();
    let key_file = dir.path().join("master.key");
    let store = MemoryStore::new();

    // Provision the key file up front; concurrent sessions must agree on
    // the master key.
    LocalFileProvider::new(&key_file).get_or_create().await.unwrap();

    let mut a = session_over(&store, &key_file);
    let mut b = session_over(&store, &key_file);
    let schema = pii_schema();
    let (ra, rb) = tokio::join!(
        a.init(&schema, EncodingMode::FieldLevel),
        b.init(&schema, EncodingMode::FieldLevel),
    );
    ra.unwrap();
    rb.unwrap();

    let keys = store
        .handle()
        .find(&vault(), json!({"keyAltNames": "demo-data-key"}))
        .await
        .unwrap();
    assert_eq!(keys.len(), 1);
}

#[tokio::test]
async fn closed_session_handles_reject_operations() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::new();
    let mut session = session_over(&store, &dir.path().join("master.key"));

    let handle = session
        .init(&pii_schema(), EncodingMode::FieldLevel)
        .await
        .unwrap();
    session.close().await.unwrap();

    let err = handle
        .find_one(&customers(), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Connection(_)));

    // A fresh init bootstraps a working connection again.
    let reopened = session
        .init(&pii_schema(), EncodingMode::FieldLevel)
        .await
        .unwrap();
    reopened
        .insert_one(&customers(), json!({"name": "dan", "ssn": "999-00-1111"}))
        .await
        .unwrap();
}
