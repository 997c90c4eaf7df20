//! [`LocalFileProvider`]: master key stored as a raw file on disk.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use common::keys::MasterKey;

use super::{KeySourceError, MasterKeyProvider};

/// Reads the master key from a raw binary file, generating the file on
/// first use.
///
/// The existence check and the write are not atomic; two processes racing
/// over a missing file can each persist their own key, and the last write
/// wins. Run key-file creation once before starting concurrent sessions.
pub struct LocalFileProvider {
    path: PathBuf,
}

impl LocalFileProvider {
    /// Provider backed by the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl MasterKeyProvider for LocalFileProvider {
    async fn get_or_create(&self) -> Result<MasterKey, KeySourceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                // A present file must hold exactly one key; a wrong-length
                // file is surfaced, never overwritten.
                Ok(MasterKey::from_bytes(&bytes)?)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let key = MasterKey::generate();
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                tokio::fs::write(&self.path, key.as_bytes()).await?;
                info!(path = %self.path.display(), "generated new master key file");
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }
}
