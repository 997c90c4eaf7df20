//! [`ExplicitFieldCodec`]: manual per-value encryption and decryption for
//! callers that manage document shapes themselves.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use common::encoding::Algorithm;
use common::engine::{Ciphertext, EncryptOptions, Engine};
use common::error::EngineError;
use common::keys::DekId;
use common::schema::{KeyReference, ValueType};

use crate::registry::{KeyVaultManager, RegistryError};

/// Errors surfaced by explicit field encryption.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No value was provided to encrypt or decrypt.
    #[error("no value provided to encrypt or decrypt")]
    MissingValue,

    /// The referenced alternate name could not be resolved to a data key.
    #[error("failed to resolve data key for alternate name {alt_name:?}: {source}")]
    KeyResolution {
        alt_name: String,
        #[source]
        source: RegistryError,
    },

    /// The engine rejected the cryptographic operation.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Per-call options for [`ExplicitFieldCodec::encrypt_field`].
#[derive(Debug, Clone)]
pub struct FieldOptions {
    /// The data key to encrypt with.
    pub key: KeyReference,
    /// Encryption algorithm; deterministic unless overridden.
    pub algorithm: Algorithm,
    /// Declared type of the plaintext value.
    pub value_type: ValueType,
    /// Provider tag for on-demand key creation; `None` uses the codec's
    /// session tag.
    pub provider_tag: Option<String>,
}

impl FieldOptions {
    /// Encrypt under the key with this registry alternate name, creating
    /// the key on first use.
    pub fn alt_name(name: impl Into<String>) -> Self {
        Self::with_key(KeyReference::alt_name(name))
    }

    /// Encrypt under a known key id.
    pub fn key_id(id: DekId) -> Self {
        Self::with_key(KeyReference::Id(id))
    }

    fn with_key(key: KeyReference) -> Self {
        Self {
            key,
            algorithm: Algorithm::Deterministic,
            value_type: ValueType::String,
            provider_tag: None,
        }
    }

    /// Override the encryption algorithm.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Override the declared value type.
    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Override the provider tag used for on-demand key creation.
    pub fn with_provider_tag(mut self, tag: impl Into<String>) -> Self {
        self.provider_tag = Some(tag.into());
        self
    }
}

/// Explicit field codec over a session's engine and key registry.
///
/// The codec only resolves key references; the cryptographic transform
/// itself is the engine's.
pub struct ExplicitFieldCodec {
    engine: Arc<dyn Engine>,
    registry: Arc<KeyVaultManager>,
    provider_tag: String,
}

impl ExplicitFieldCodec {
    /// Codec using `engine` for crypto and `registry` for alternate-name
    /// resolution.
    pub fn new(
        engine: Arc<dyn Engine>,
        registry: Arc<KeyVaultManager>,
        provider_tag: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            provider_tag: provider_tag.into(),
        }
    }

    /// Encrypt one value under the key named by `options`.
    ///
    /// # Errors
    ///
    /// Fails with [`CodecError::MissingValue`] for a null or empty-string
    /// value, and with [`CodecError::KeyResolution`] when an alternate name
    /// cannot be resolved or created.
    pub async fn encrypt_field(
        &self,
        value: Value,
        options: &FieldOptions,
    ) -> Result<Ciphertext, CodecError> {
        if value.is_null() || value.as_str().is_some_and(str::is_empty) {
            return Err(CodecError::MissingValue);
        }

        let key_id = match &options.key {
            KeyReference::Id(id) => *id,
            KeyReference::AltName(name) => {
                let tag = options.provider_tag.as_deref().unwrap_or(&self.provider_tag);
                self.registry
                    .get_or_create_data_key(name, tag)
                    .await
                    .map_err(|source| CodecError::KeyResolution {
                        alt_name: name.clone(),
                        source,
                    })?
            }
        };

        let encrypted = self
            .engine
            .encrypt(
                value,
                EncryptOptions {
                    key_id,
                    algorithm: options.algorithm,
                    value_type: options.value_type,
                },
            )
            .await?;
        Ok(encrypted)
    }

    /// Decrypt one value produced by [`ExplicitFieldCodec::encrypt_field`]
    /// or by an encrypted connection.
    pub async fn decrypt_field(&self, ciphertext: &Ciphertext) -> Result<Value, CodecError> {
        if ciphertext.as_str().is_empty() {
            return Err(CodecError::MissingValue);
        }
        Ok(self.engine.decrypt(ciphertext).await?)
    }
}
