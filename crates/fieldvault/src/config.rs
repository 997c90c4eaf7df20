//! Configuration loading and validation for encrypted sessions.
//!
//! All values are read from environment variables. Loading fails with a
//! clear error message if any required variable is missing or invalid.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use common::keys::LOCAL_PROVIDER;
use common::schema::Namespace;

use crate::session::SessionOptions;

/// Validated session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection URI of the document store. **Required.**
    pub store_uri: String,

    /// Combined `"database.collection"` namespace of the key registry.
    /// Takes precedence over the two split variables when set.
    #[serde(default)]
    pub key_vault_namespace: Option<String>,

    /// Database holding the key registry collection.
    #[serde(default = "default_key_vault_database")]
    pub key_vault_database: String,

    /// Name of the key registry collection.
    #[serde(default = "default_key_vault_collection")]
    pub key_vault_collection: String,

    /// Alternate name of the session's default data key.
    #[serde(default = "default_data_key_alt_name")]
    pub data_key_alt_name: String,

    /// Database holding the encrypted target collection.
    #[serde(default = "default_target_database")]
    pub target_database: String,

    /// Name of the encrypted target collection.
    #[serde(default = "default_target_collection")]
    pub target_collection: String,

    /// Filesystem path to a native crypto library, passed through to engines
    /// that load one.
    #[serde(default)]
    pub crypto_lib_path: Option<String>,

    /// Filesystem path of the local master key file. Mutually exclusive with
    /// the `SECRET_STORE_*` variables.
    #[serde(default)]
    pub master_key_path: Option<String>,

    /// Base address of the remote secret store, e.g. `http://127.0.0.1:8200`.
    #[serde(default)]
    pub secret_store_addr: Option<String>,

    /// Access token for the remote secret store.
    #[serde(default)]
    pub secret_store_token: Option<String>,

    /// Secret path under the store's KV mount, e.g. `secret/data/fieldvault`.
    #[serde(default)]
    pub secret_store_path: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`), consumed by
    /// [`crate::telemetry::init`].
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_key_vault_database() -> String {
    "encryption".into()
}
fn default_key_vault_collection() -> String {
    "keyVault".into()
}
fn default_data_key_alt_name() -> String {
    "demo-data-key".into()
}
fn default_target_database() -> String {
    "demo".into()
}
fn default_target_collection() -> String {
    "customers".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Where the session obtains its master key.
///
/// Exactly one variant is selected by configuration; the choice only affects
/// key acquisition, never how the key is used afterwards.
#[derive(Clone)]
pub enum MasterKeySource {
    /// Read (or create) a raw key file on the local filesystem.
    LocalFile { path: PathBuf },
    /// Read (or create) a base64 key value in a remote KV secret store.
    RemoteStore {
        addr: String,
        token: String,
        path: String,
    },
}

impl fmt::Debug for MasterKeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterKeySource::LocalFile { path } => {
                f.debug_struct("LocalFile").field("path", path).finish()
            }
            MasterKeySource::RemoteStore { addr, path, .. } => f
                .debug_struct("RemoteStore")
                .field("addr", addr)
                .field("token", &"[REDACTED]")
                .field("path", path)
                .finish(),
        }
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.store_uri, "STORE_URI")?;
        ensure_non_empty(&self.data_key_alt_name, "DATA_KEY_ALT_NAME")?;
        ensure_non_empty(&self.target_database, "TARGET_DATABASE")?;
        ensure_non_empty(&self.target_collection, "TARGET_COLLECTION")?;
        self.key_vault()?;
        self.master_key_source()?;
        Ok(())
    }

    /// Namespace of the key registry collection.
    ///
    /// `KEY_VAULT_NAMESPACE` wins over the `KEY_VAULT_DATABASE` and
    /// `KEY_VAULT_COLLECTION` pair when both are set.
    pub fn key_vault(&self) -> Result<Namespace> {
        match &self.key_vault_namespace {
            Some(combined) => Namespace::parse(combined)
                .context("KEY_VAULT_NAMESPACE must be of the form \"database.collection\""),
            None => {
                ensure_non_empty(&self.key_vault_database, "KEY_VAULT_DATABASE")?;
                ensure_non_empty(&self.key_vault_collection, "KEY_VAULT_COLLECTION")?;
                Ok(Namespace::new(
                    &self.key_vault_database,
                    &self.key_vault_collection,
                ))
            }
        }
    }

    /// Namespace of the encrypted target collection.
    pub fn target(&self) -> Namespace {
        Namespace::new(&self.target_database, &self.target_collection)
    }

    /// The configured master key source.
    ///
    /// # Errors
    ///
    /// Fails when both the local file and the remote store are configured,
    /// when neither is, or when the remote store variables are incomplete.
    pub fn master_key_source(&self) -> Result<MasterKeySource> {
        let local = self.master_key_path.as_deref().filter(|p| !p.trim().is_empty());
        let remote_set = [
            ("SECRET_STORE_ADDR", &self.secret_store_addr),
            ("SECRET_STORE_TOKEN", &self.secret_store_token),
            ("SECRET_STORE_PATH", &self.secret_store_path),
        ];
        let remote_any = remote_set.iter().any(|(_, v)| v.is_some());

        match (local, remote_any) {
            (Some(_), true) => anyhow::bail!(
                "MASTER_KEY_PATH and SECRET_STORE_* are mutually exclusive; configure one master key source"
            ),
            (Some(path), false) => Ok(MasterKeySource::LocalFile {
                path: PathBuf::from(path),
            }),
            (None, true) => {
                for (name, value) in &remote_set {
                    match value {
                        Some(v) if !v.trim().is_empty() => {}
                        _ => anyhow::bail!("{name} is required when the remote secret store is configured"),
                    }
                }
                Ok(MasterKeySource::RemoteStore {
                    addr: self.secret_store_addr.clone().unwrap_or_default(),
                    token: self.secret_store_token.clone().unwrap_or_default(),
                    path: self.secret_store_path.clone().unwrap_or_default(),
                })
            }
            (None, false) => anyhow::bail!(
                "no master key source configured; set MASTER_KEY_PATH or SECRET_STORE_ADDR/SECRET_STORE_TOKEN/SECRET_STORE_PATH"
            ),
        }
    }

    /// Session options derived from this configuration.
    ///
    /// The provider tag defaults to [`LOCAL_PROVIDER`]; both master key
    /// sources feed the same provider map entry.
    pub fn session_options(&self) -> Result<SessionOptions> {
        let mut options = SessionOptions::new(
            self.store_uri.clone(),
            self.key_vault()?,
            self.target(),
            self.data_key_alt_name.clone(),
        )
        .with_provider_tag(LOCAL_PROVIDER);
        if let Some(path) = &self.crypto_lib_path {
            options = options.with_crypto_lib_path(path.clone());
        }
        Ok(options)
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            store_uri: "mongodb://localhost:27017".into(),
            key_vault_namespace: None,
            key_vault_database: default_key_vault_database(),
            key_vault_collection: default_key_vault_collection(),
            data_key_alt_name: default_data_key_alt_name(),
            target_database: default_target_database(),
            target_collection: default_target_collection(),
            crypto_lib_path: None,
            master_key_path: Some("/tmp/master-key.bin".into()),
            secret_store_addr: None,
            secret_store_token: None,
            secret_store_path: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults_are_correct() {
        assert_eq!(default_key_vault_database(), "encryption");
        assert_eq!(default_key_vault_collection(), "keyVault");
        assert_eq!(default_data_key_alt_name(), "demo-data-key");
        assert_eq!(default_target_database(), "demo");
        assert_eq!(default_target_collection(), "customers");
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_rejects_empty_store_uri() {
        let cfg = Config {
            store_uri: "".into(),
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn combined_namespace_wins_over_split_parts() {
        let cfg = Config {
            key_vault_namespace: Some("vault.dataKeys".into()),
            key_vault_database: "ignored".into(),
            key_vault_collection: "ignored".into(),
            ..base_config()
        };
        let ns = cfg.key_vault().unwrap();
        assert_eq!(ns, Namespace::new("vault", "dataKeys"));
    }

    #[test]
    fn split_parts_used_when_combined_absent() {
        let ns = base_config().key_vault().unwrap();
        assert_eq!(ns, Namespace::new("encryption", "keyVault"));
    }

    #[test]
    fn malformed_combined_namespace_is_rejected() {
        let cfg = Config {
            key_vault_namespace: Some("nodot".into()),
            ..base_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn master_key_sources_are_mutually_exclusive() {
        let cfg = Config {
            secret_store_addr: Some("http://127.0.0.1:8200".into()),
            secret_store_token: Some("root".into()),
            secret_store_path: Some("secret/data/fieldvault".into()),
            ..base_config()
        };
        assert!(cfg.master_key_source().is_err());
    }

    #[test]
    fn missing_master_key_source_is_rejected() {
        let cfg = Config {
            master_key_path: None,
            ..base_config()
        };
        assert!(cfg.master_key_source().is_err());
    }

    #[test]
    fn partial_remote_store_config_is_rejected() {
        let cfg = Config {
            master_key_path: None,
            secret_store_addr: Some("http://127.0.0.1:8200".into()),
            ..base_config()
        };
        let err = cfg.master_key_source().unwrap_err();
        assert!(err.to_string().contains("SECRET_STORE_TOKEN"));
    }

    #[test]
    fn remote_store_source_selected_when_complete() {
        let cfg = Config {
            master_key_path: None,
            secret_store_addr: Some("http://127.0.0.1:8200".into()),
            secret_store_token: Some("root".into()),
            secret_store_path: Some("secret/data/fieldvault".into()),
            ..base_config()
        };
        match cfg.master_key_source().unwrap() {
            MasterKeySource::RemoteStore { addr, .. } => {
                assert_eq!(addr, "http://127.0.0.1:8200");
            }
            other => panic!("expected remote store source, got {other:?}"),
        }
    }

    #[test]
    fn remote_token_redacted_in_debug() {
        let source = MasterKeySource::RemoteStore {
            addr: "http://127.0.0.1:8200".into(),
            token: "hvs.supersecret".into(),
            path: "secret/data/fieldvault".into(),
        };
        let printed = format!("{source:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("supersecret"));
    }
}
