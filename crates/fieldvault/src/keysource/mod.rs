//! Master key acquisition: a local key file or a remote KV secret store.

mod local;
mod vault;

pub use local::LocalFileProvider;
pub use vault::RemoteStoreProvider;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use common::keys::{InvalidKeyLength, MasterKey};

use crate::config::MasterKeySource;

/// Errors produced while acquiring the master key.
#[derive(Debug, Error)]
pub enum KeySourceError {
    /// The persisted key material has the wrong length. The stored value is
    /// left untouched so it can be inspected.
    #[error(transparent)]
    InvalidKeyLength(#[from] InvalidKeyLength),

    /// The secret store could not be reached or returned an undecodable
    /// response.
    #[error("secret store unreachable: {0}")]
    Unreachable(String),

    /// The secret store rejected the write that persists a new key.
    #[error("secret store write failed with status {status}: {body}")]
    WriteFailed { status: u16, body: String },

    /// Reading or writing the local key file failed.
    #[error("master key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The stored key value is not valid base64.
    #[error("master key is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Yields the session master key.
///
/// Both implementations follow the same contract: return the persisted key
/// when one exists, otherwise generate a fresh key, persist it, and return
/// it. A key is only ever handed out after it has been durably stored.
#[async_trait]
pub trait MasterKeyProvider: Send + Sync {
    /// Fetch the persisted master key, creating one when the backing
    /// location is empty.
    async fn get_or_create(&self) -> Result<MasterKey, KeySourceError>;
}

/// Construct the provider selected by configuration.
pub fn provider_for(
    source: &MasterKeySource,
) -> Result<Arc<dyn MasterKeyProvider>, KeySourceError> {
    match source {
        MasterKeySource::LocalFile { path } => Ok(Arc::new(LocalFileProvider::new(path.clone()))),
        MasterKeySource::RemoteStore { addr, token, path } => Ok(Arc::new(
            RemoteStoreProvider::new(addr.clone(), token.clone(), path.clone())?,
        )),
    }
}
