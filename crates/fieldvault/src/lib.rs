//! Key lifecycle and encryption configuration for field-level encryption
//! in a document store.
//!
//! [`session::EncryptedSession`] ties the pieces together: it acquires the
//! master key through a [`keysource::MasterKeyProvider`], ensures the key
//! registry collection via [`registry::KeyVaultManager`], resolves data
//! keys, builds the connection's encryption config with
//! [`encoding::build_config`], and finally opens the encrypted connection
//! through the engine. [`codec::ExplicitFieldCodec`] covers callers that
//! encrypt individual values by hand instead.

pub mod codec;
pub mod config;
pub mod encoding;
pub mod keysource;
pub mod registry;
pub mod session;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod mocks;

pub use codec::{CodecError, ExplicitFieldCodec, FieldOptions};
pub use config::{Config, MasterKeySource};
pub use encoding::{build_config, ConfigError, ResolvedKeys};
pub use keysource::{
    provider_for, KeySourceError, LocalFileProvider, MasterKeyProvider, RemoteStoreProvider,
};
pub use registry::{KeyVaultManager, RegistryError};
pub use session::{EncryptedSession, SessionError, SessionOptions, SessionPhase};
