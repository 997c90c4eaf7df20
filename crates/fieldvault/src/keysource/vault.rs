//! [`RemoteStoreProvider`]: master key stored in a KV v2 secret store.
//!
//! The key lives as a base64 string under the `masterKeyBase64` field of one
//! secret path. Reads go through `GET {addr}/v1/{path}`, writes through
//! `POST {addr}/v1/{path}` with a KV v2 `{"data": {...}}` envelope, both
//! authenticated by the `X-Vault-Token` header.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use common::keys::MasterKey;

use super::{KeySourceError, MasterKeyProvider};

const TOKEN_HEADER: &str = "X-Vault-Token";
const MASTER_KEY_FIELD: &str = "masterKeyBase64";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Reads the master key from a remote KV v2 secret store, writing a fresh
/// key on first use.
///
/// Any non-2xx read response is treated as "no key stored yet", so an
/// expired or mis-scoped token looks like an empty store and triggers key
/// generation; the write that follows then fails with
/// [`KeySourceError::WriteFailed`] instead of silently shadowing the stored
/// key.
pub struct RemoteStoreProvider {
    client: reqwest::Client,
    addr: String,
    token: String,
    path: String,
}

#[derive(Deserialize)]
struct ReadResponse {
    #[serde(default)]
    data: Option<ReadEnvelope>,
}

#[derive(Deserialize)]
struct ReadEnvelope {
    #[serde(default)]
    data: Option<BTreeMap<String, Value>>,
}

impl RemoteStoreProvider {
    /// Provider for the secret at `path` on the store at `addr`.
    pub fn new(
        addr: impl Into<String>,
        token: impl Into<String>,
        path: impl Into<String>,
    ) -> Result<Self, KeySourceError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| KeySourceError::Unreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            addr: addr.into(),
            token: token.into(),
            path: path.into(),
        })
    }

    fn secret_url(&self) -> String {
        format!(
            "{}/v1/{}",
            self.addr.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    /// Read the stored base64 key value, or `None` when the store holds no
    /// usable entry at the secret path.
    async fn fetch(&self) -> Result<Option<String>, KeySourceError> {
        let response = self
            .client
            .get(self.secret_url())
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| KeySourceError::Unreachable(format!("secret read failed: {e}")))?;

        if !response.status().is_success() {
            return Ok(None);
        }

        let body: ReadResponse = response
            .json()
            .await
            .map_err(|e| KeySourceError::Unreachable(format!("undecodable secret response: {e}")))?;
        let value = body
            .data
            .and_then(|envelope| envelope.data)
            .and_then(|mut fields| fields.remove(MASTER_KEY_FIELD));
        match value {
            None => Ok(None),
            Some(Value::String(encoded)) => Ok(Some(encoded)),
            Some(_) => Err(KeySourceError::Unreachable(format!(
                "secret field {MASTER_KEY_FIELD} is not a string"
            ))),
        }
    }

    /// Persist a base64 key value under the secret path.
    async fn store(&self, encoded: &str) -> Result<(), KeySourceError> {
        let body = json!({ "data": { MASTER_KEY_FIELD: encoded } });
        let response = self
            .client
            .post(self.secret_url())
            .header(TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| KeySourceError::Unreachable(format!("secret write failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KeySourceError::WriteFailed {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MasterKeyProvider for RemoteStoreProvider {
    async fn get_or_create(&self) -> Result<MasterKey, KeySourceError> {
        if let Some(encoded) = self.fetch().await? {
            let bytes = STANDARD.decode(encoded)?;
            return Ok(MasterKey::from_bytes(&bytes)?);
        }

        let key = MasterKey::generate();
        self.store(&STANDARD.encode(key.as_bytes())).await?;
        info!(path = %self.path, "generated and persisted new master key in secret store");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::keys::MASTER_KEY_LEN;
    use mockito::Matcher;

    const SECRET_PATH: &str = "secret/data/fieldvault";
    const API_PATH: &str = "/v1/secret/data/fieldvault";

    fn provider_for(server: &mockito::Server) -> RemoteStoreProvider {
        RemoteStoreProvider::new(server.url(), "test-token", SECRET_PATH).unwrap()
    }

    #[tokio::test]
    async fn returns_stored_key() {
        let mut server = mockito::Server::new_async().await;
        let key_bytes = [0x5Au8; MASTER_KEY_LEN];
        let body = json!({
            "data": {
                "data": { MASTER_KEY_FIELD: STANDARD.encode(key_bytes) },
                "metadata": { "version": 1 }
            }
        });
        let mock = server
            .mock("GET", API_PATH)
            .match_header(TOKEN_HEADER, "test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let key = provider_for(&server).get_or_create().await.unwrap();
        assert_eq!(key.as_bytes(), &key_bytes[..]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn generates_and_persists_when_absent() {
        let mut server = mockito::Server::new_async().await;
        let read = server
            .mock("GET", API_PATH)
            .with_status(404)
            .with_body(json!({"errors": []}).to_string())
            .create_async()
            .await;
        let write = server
            .mock("POST", API_PATH)
            .match_header(TOKEN_HEADER, "test-token")
            .match_body(Matcher::Regex(MASTER_KEY_FIELD.into()))
            .with_status(200)
            .with_body(json!({"data": {"version": 1}}).to_string())
            .create_async()
            .await;

        let key = provider_for(&server).get_or_create().await.unwrap();
        assert_eq!(key.as_bytes().len(), MASTER_KEY_LEN);
        read.assert_async().await;
        write.assert_async().await;
    }

    #[tokio::test]
    async fn surfaces_rejected_write() {
        let mut server = mockito::Server::new_async().await;
        let _read = server
            .mock("GET", API_PATH)
            .with_status(404)
            .create_async()
            .await;
        let _write = server
            .mock("POST", API_PATH)
            .with_status(403)
            .with_body("permission denied")
            .create_async()
            .await;

        let err = provider_for(&server).get_or_create().await.unwrap_err();
        match err {
            KeySourceError::WriteFailed { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("permission denied"));
            }
            other => panic!("expected WriteFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_wrong_length_stored_key() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "data": { "data": { MASTER_KEY_FIELD: STANDARD.encode([1u8; 10]) } }
        });
        let _read = server
            .mock("GET", API_PATH)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let err = provider_for(&server).get_or_create().await.unwrap_err();
        assert!(matches!(err, KeySourceError::InvalidKeyLength(_)));
    }

    #[tokio::test]
    async fn rejects_undecodable_stored_key() {
        let mut server = mockito::Server::new_async().await;
        let body = json!({
            "data": { "data": { MASTER_KEY_FIELD: "not-base64!!!" } }
        });
        let _read = server
            .mock("GET", API_PATH)
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let err = provider_for(&server).get_or_create().await.unwrap_err();
        assert!(matches!(err, KeySourceError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_store_is_reported() {
        // Nothing listens on this port; the connection is refused.
        let provider =
            RemoteStoreProvider::new("http://127.0.0.1:1", "test-token", SECRET_PATH).unwrap();
        let err = provider.get_or_create().await.unwrap_err();
        assert!(matches!(err, KeySourceError::Unreachable(_)));
    }
}
