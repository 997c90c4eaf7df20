//! Shared mockall doubles for the engine boundary traits, used by unit
//! tests across this crate.

use std::sync::Arc;

use async_trait::async_trait;
use mockall::mock;
use serde_json::Value;

use common::encoding::EncodedConfig;
use common::engine::{
    Ciphertext, ConnectOptions, EncryptOptions, Engine, EngineBuilder, EngineContext, IndexSpec,
    StoreConnector, StoreHandle,
};
use common::error::EngineError;
use common::keys::{DekId, MasterKey};
use common::schema::Namespace;

use crate::keysource::{KeySourceError, MasterKeyProvider};

mock! {
    pub Connector {}

    #[async_trait]
    impl StoreConnector for Connector {
        async fn connect(&self, uri: &str) -> Result<Arc<dyn StoreHandle>, EngineError>;
    }
}

mock! {
    pub Store {}

    #[async_trait]
    impl StoreHandle for Store {
        async fn list_collections(&self, database: &str) -> Result<Vec<String>, EngineError>;
        async fn create_collection(
            &self,
            database: &str,
            collection: &str,
        ) -> Result<(), EngineError>;
        async fn create_index(
            &self,
            namespace: &Namespace,
            index: IndexSpec,
        ) -> Result<(), EngineError>;
        async fn insert_one(
            &self,
            namespace: &Namespace,
            document: Value,
        ) -> Result<(), EngineError>;
        async fn find_one(
            &self,
            namespace: &Namespace,
            filter: Value,
        ) -> Result<Option<Value>, EngineError>;
        async fn find(
            &self,
            namespace: &Namespace,
            filter: Value,
        ) -> Result<Vec<Value>, EngineError>;
        async fn close(&self) -> Result<(), EngineError>;
    }
}

mock! {
    pub Builder {}

    #[async_trait]
    impl EngineBuilder for Builder {
        async fn build(&self, context: EngineContext) -> Result<Arc<dyn Engine>, EngineError>;
    }
}

mock! {
    pub Eng {}

    #[async_trait]
    impl Engine for Eng {
        async fn create_data_key(
            &self,
            provider_tag: &str,
            alt_names: &[String],
        ) -> Result<DekId, EngineError>;
        async fn encrypt(
            &self,
            value: Value,
            options: EncryptOptions,
        ) -> Result<Ciphertext, EngineError>;
        async fn decrypt(&self, ciphertext: &Ciphertext) -> Result<Value, EngineError>;
        async fn create_encrypted_collection(
            &self,
            namespace: &Namespace,
            provider_tag: &str,
            config: &EncodedConfig,
        ) -> Result<(), EngineError>;
        async fn open_encrypted_connection(
            &self,
            uri: &str,
            options: ConnectOptions,
        ) -> Result<Arc<dyn StoreHandle>, EngineError>;
    }
}

mock! {
    pub Provider {}

    #[async_trait]
    impl MasterKeyProvider for Provider {
        async fn get_or_create(&self) -> Result<MasterKey, KeySourceError>;
    }
}
