//! [`EncryptedSession`]: bootstraps an encrypted store connection from
//! configuration, master key, key registry, and encryption config.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use common::encoding::EncodingMode;
use common::engine::{
    ConnectOptions, Engine, EngineBuilder, EngineContext, StoreConnector, StoreHandle,
};
use common::error::EngineError;
use common::keys::{KmsProviders, LOCAL_PROVIDER};
use common::schema::{EncryptionSchema, Namespace};

use crate::codec::ExplicitFieldCodec;
use crate::encoding::{build_config, ConfigError, ResolvedKeys};
use crate::keysource::{KeySourceError, MasterKeyProvider};
use crate::registry::{KeyVaultManager, RegistryError};

/// How far a session's initialisation has progressed.
///
/// Phases are strictly ordered; a failed [`EncryptedSession::init`] leaves
/// the session at the last completed phase and a later call resumes from
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Uninitialized,
    ControlConnected,
    RegistryEnsured,
    KeysResolved,
    ConfigBuilt,
    EncryptedConnected,
}

/// Options an [`EncryptedSession`] is created with.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Connection URI of the document store.
    pub store_uri: String,
    /// Namespace of the key registry collection.
    pub key_vault: Namespace,
    /// Namespace of the encrypted target collection.
    pub target: Namespace,
    /// Alternate name of the session's default data key.
    pub data_key_alt_name: String,
    /// KMS provider tag the master key is registered under.
    pub provider_tag: String,
    /// Path to a native crypto library, passed through to the engine.
    pub crypto_lib_path: Option<String>,
}

impl SessionOptions {
    /// Options with the [`LOCAL_PROVIDER`] tag and no crypto library path.
    pub fn new(
        store_uri: impl Into<String>,
        key_vault: Namespace,
        target: Namespace,
        data_key_alt_name: impl Into<String>,
    ) -> Self {
        Self {
            store_uri: store_uri.into(),
            key_vault,
            target,
            data_key_alt_name: data_key_alt_name.into(),
            provider_tag: LOCAL_PROVIDER.into(),
            crypto_lib_path: None,
        }
    }

    /// Register the master key under a different provider tag.
    pub fn with_provider_tag(mut self, tag: impl Into<String>) -> Self {
        self.provider_tag = tag.into();
        self
    }

    /// Pass a native crypto library path through to the engine.
    pub fn with_crypto_lib_path(mut self, path: impl Into<String>) -> Self {
        self.crypto_lib_path = Some(path.into());
        self
    }
}

/// Errors surfaced by session initialisation and shutdown.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connecting to the document store failed.
    #[error("failed to connect to the document store at {uri}: {source}")]
    Connection {
        uri: String,
        #[source]
        source: EngineError,
    },

    /// Master key acquisition failed.
    #[error(transparent)]
    KeySource(#[from] KeySourceError),

    /// Key registry setup or data-key resolution failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The encryption config could not be built from the schema.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A store or engine call failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The session has not completed the initialisation step this call
    /// depends on.
    #[error("session is not initialised")]
    NotInitialised,
}

/// A session over one encrypted target collection.
///
/// [`EncryptedSession::init`] runs the full bootstrap; every step is
/// idempotent, so calling it again returns the already-established
/// connection without repeating work. [`EncryptedSession::close`] releases
/// both connections and resets the session for a fresh `init`.
pub struct EncryptedSession {
    options: SessionOptions,
    connector: Arc<dyn StoreConnector>,
    engine_builder: Arc<dyn EngineBuilder>,
    key_provider: Arc<dyn MasterKeyProvider>,
    phase: SessionPhase,
    control: Option<Arc<dyn StoreHandle>>,
    kms: Option<KmsProviders>,
    engine: Option<Arc<dyn Engine>>,
    registry: Option<Arc<KeyVaultManager>>,
    keys: Option<ResolvedKeys>,
    config: Option<common::encoding::EncodedConfig>,
    encrypted: Option<Arc<dyn StoreHandle>>,
}

impl EncryptedSession {
    /// A fresh, unconnected session.
    pub fn new(
        options: SessionOptions,
        connector: Arc<dyn StoreConnector>,
        engine_builder: Arc<dyn EngineBuilder>,
        key_provider: Arc<dyn MasterKeyProvider>,
    ) -> Self {
        Self {
            options,
            connector,
            engine_builder,
            key_provider,
            phase: SessionPhase::Uninitialized,
            control: None,
            kms: None,
            engine: None,
            registry: None,
            keys: None,
            config: None,
            encrypted: None,
        }
    }

    /// The session options.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The last completed initialisation phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Bootstrap the encrypted connection for `schema` in the given
    /// encoding, returning the connection handle.
    ///
    /// An already-initialised session returns its cached handle. After a
    /// failure, calling `init` again resumes from the first incomplete
    /// step; completed connections, keys, and configs are reused.
    pub async fn init(
        &mut self,
        schema: &EncryptionSchema,
        mode: EncodingMode,
    ) -> Result<Arc<dyn StoreHandle>, SessionError> {
        if self.phase == SessionPhase::EncryptedConnected {
            if let Some(handle) = &self.encrypted {
                debug!("session already initialised; returning cached handle");
                return Ok(Arc::clone(handle));
            }
        }

        // 1. Control-plane connection.
        self.connect_control().await?;
        // 2. Key registry collection and its unique alternate-name index.
        self.ensure_registry().await?;
        // 3. Data keys for the default alternate name and schema references.
        self.resolve_keys(schema).await?;
        // 4. Encryption config document.
        self.build_encryption_config(schema, mode)?;
        // 5. Encrypted connection, creating the target collection first in
        //    encrypted-fields mode.
        self.open_encrypted(mode).await
    }

    /// Close both connections and reset to [`SessionPhase::Uninitialized`].
    ///
    /// All close attempts run even when one fails; the first error is
    /// returned.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        let handles: Vec<Arc<dyn StoreHandle>> = self
            .encrypted
            .take()
            .into_iter()
            .chain(self.control.take())
            .collect();
        self.kms = None;
        self.engine = None;
        self.registry = None;
        self.keys = None;
        self.config = None;
        self.phase = SessionPhase::Uninitialized;

        let mut first_error: Option<EngineError> = None;
        for handle in handles {
            if let Err(e) = handle.close().await {
                warn!(error = %e, "store handle close failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => {
                info!("session closed");
                Ok(())
            }
        }
    }

    /// A codec for explicit per-value encryption backed by this session's
    /// engine and key registry.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::NotInitialised`] before the engine has
    /// been assembled by [`EncryptedSession::init`].
    pub fn codec(&self) -> Result<ExplicitFieldCodec, SessionError> {
        Ok(ExplicitFieldCodec::new(
            self.engine_handle()?,
            self.registry_handle()?,
            self.options.provider_tag.clone(),
        ))
    }

    async fn connect_control(&mut self) -> Result<(), SessionError> {
        if self.control.is_some() {
            return Ok(());
        }
        let handle = self
            .connector
            .connect(&self.options.store_uri)
            .await
            .map_err(|source| SessionError::Connection {
                uri: self.options.store_uri.clone(),
                source,
            })?;
        self.control = Some(handle);
        self.advance(SessionPhase::ControlConnected);
        info!("control connection established");
        Ok(())
    }

    async fn ensure_registry(&mut self) -> Result<(), SessionError> {
        if self.kms.is_none() {
            let key = self.key_provider.get_or_create().await?;
            self.kms =
                Some(KmsProviders::new().with_provider(self.options.provider_tag.as_str(), key));
        }
        if self.engine.is_none() {
            let context = EngineContext {
                control: self.control_handle()?,
                key_vault: self.options.key_vault.clone(),
                kms: self.kms_providers()?,
            };
            self.engine = Some(self.engine_builder.build(context).await?);
        }
        if self.registry.is_none() {
            self.registry = Some(Arc::new(KeyVaultManager::new(
                self.control_handle()?,
                self.engine_handle()?,
                self.options.key_vault.clone(),
            )));
        }
        if self.phase < SessionPhase::RegistryEnsured {
            self.registry_handle()?.ensure_registry().await?;
            self.advance(SessionPhase::RegistryEnsured);
        }
        Ok(())
    }

    async fn resolve_keys(&mut self, schema: &EncryptionSchema) -> Result<(), SessionError> {
        if self.phase >= SessionPhase::KeysResolved {
            return Ok(());
        }
        let registry = self.registry_handle()?;
        let tag = self.options.provider_tag.clone();

        let default_id = registry
            .get_or_create_data_key(&self.options.data_key_alt_name, &tag)
            .await?;
        let mut keys = ResolvedKeys::new().with_default(default_id);
        keys.insert(self.options.data_key_alt_name.clone(), default_id);

        for name in schema.referenced_alt_names() {
            if keys.get(name).is_none() {
                let id = registry.get_or_create_data_key(name, &tag).await?;
                keys.insert(name, id);
            }
        }

        self.keys = Some(keys);
        self.advance(SessionPhase::KeysResolved);
        info!(
            default_alt_name = %self.options.data_key_alt_name,
            "data keys resolved"
        );
        Ok(())
    }

    fn build_encryption_config(
        &mut self,
        schema: &EncryptionSchema,
        mode: EncodingMode,
    ) -> Result<(), SessionError> {
        if self.phase >= SessionPhase::ConfigBuilt {
            return Ok(());
        }
        let keys = self.keys.as_ref().ok_or(SessionError::NotInitialised)?;
        self.config = Some(build_config(schema, mode, keys)?);
        self.advance(SessionPhase::ConfigBuilt);
        Ok(())
    }

    async fn open_encrypted(
        &mut self,
        mode: EncodingMode,
    ) -> Result<Arc<dyn StoreHandle>, SessionError> {
        if let Some(handle) = &self.encrypted {
            return Ok(Arc::clone(handle));
        }
        let engine = self.engine_handle()?;
        let config = self.config.clone().ok_or(SessionError::NotInitialised)?;

        if mode == EncodingMode::Queryable {
            let target = self.options.target.clone();
            let existing = self
                .control_handle()?
                .list_collections(target.database())
                .await?;
            if existing.iter().any(|c| c == target.collection()) {
                debug!(
                    namespace = %target,
                    "target collection already exists; skipping encrypted creation"
                );
            } else {
                engine
                    .create_encrypted_collection(&target, &self.options.provider_tag, &config)
                    .await?;
                info!(namespace = %target, "created encrypted collection");
            }
        }

        let connect = ConnectOptions {
            key_vault: self.options.key_vault.clone(),
            kms: self.kms_providers()?,
            config,
            crypto_lib_path: self.options.crypto_lib_path.clone(),
        };
        let handle = engine
            .open_encrypted_connection(&self.options.store_uri, connect)
            .await
            .map_err(|source| SessionError::Connection {
                uri: self.options.store_uri.clone(),
                source,
            })?;
        self.encrypted = Some(Arc::clone(&handle));
        self.advance(SessionPhase::EncryptedConnected);
        info!("encrypted connection established");
        Ok(handle)
    }

    fn advance(&mut self, phase: SessionPhase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }

    fn control_handle(&self) -> Result<Arc<dyn StoreHandle>, SessionError> {
        self.control.clone().ok_or(SessionError::NotInitialised)
    }

    fn engine_handle(&self) -> Result<Arc<dyn Engine>, SessionError> {
        self.engine.clone().ok_or(SessionError::NotInitialised)
    }

    fn registry_handle(&self) -> Result<Arc<KeyVaultManager>, SessionError> {
        self.registry.clone().ok_or(SessionError::NotInitialised)
    }

    fn kms_providers(&self) -> Result<KmsProviders, SessionError> {
        self.kms.clone().ok_or(SessionError::NotInitialised)
    }
}
