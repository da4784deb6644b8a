//! Relayer-backed FHE runtime.
//!
//! The relayer service performs the ciphertext construction and the
//! user-decryption round trips; this module is plain HTTP plumbing around
//! it. Failures are classified so the controller's retry policy can tell a
//! dropped connection from a rejected authorization.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::contract::{Address, EncryptedHandle, EncryptedInput};
use crate::error::RuntimeError;
use crate::runtime::{FheRuntime, RuntimeProvider};
use crate::signature::DecryptionAuthorization;

/// Builds relayer-bound runtime instances per network.
pub struct RelayerRuntimeProvider {
    endpoint: Url,
    timeout: Duration,
}

impl RelayerRuntimeProvider {
    pub fn new(endpoint: Url, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }
}

#[derive(Debug, Deserialize)]
struct KeyMaterialResponse {
    key_id: String,
}

#[async_trait]
impl RuntimeProvider for RelayerRuntimeProvider {
    async fn create(&self, chain_id: u64) -> Result<Arc<dyn FheRuntime>, RuntimeError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| RuntimeError::Bootstrap(format!("HTTP client init failed: {e}")))?;

        let url = keys_url(&self.endpoint, chain_id)
            .map_err(|e| RuntimeError::Bootstrap(format!("invalid relayer endpoint: {e}")))?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport_error("key material fetch", &e))?;

        if !response.status().is_success() {
            return Err(RuntimeError::Bootstrap(format!(
                "relayer has no key material for chain {chain_id} (HTTP {})",
                response.status().as_u16()
            )));
        }
        let keys: KeyMaterialResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::Bootstrap(format!("malformed key material: {e}")))?;

        Ok(Arc::new(RelayerRuntime {
            client,
            endpoint: self.endpoint.clone(),
            chain_id,
            key_id: keys.key_id,
        }))
    }
}

struct RelayerRuntime {
    client: reqwest::Client,
    endpoint: Url,
    chain_id: u64,
    key_id: String,
}

#[derive(Debug, Serialize)]
struct EncryptRequest<'a> {
    chain_id: u64,
    key_id: &'a str,
    contract: &'a Address,
    user: &'a Address,
    bits: u8,
    plaintext: u32,
}

#[derive(Debug, Deserialize)]
struct EncryptResponse {
    handle: String,
    proof: String,
}

#[derive(Debug, Serialize)]
struct UserDecryptRequest<'a> {
    chain_id: u64,
    contract: &'a Address,
    handle: &'a str,
    signer: &'a Address,
    signature: &'a str,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct UserDecryptResponse {
    plaintext: u32,
}

#[async_trait]
impl FheRuntime for RelayerRuntime {
    async fn encrypt_u32(
        &self,
        value: u32,
        contract: &Address,
        user: &Address,
    ) -> Result<EncryptedInput, RuntimeError> {
        let url = api_url(&self.endpoint, "v1/input-proof")
            .map_err(|e| RuntimeError::Encryption(format!("invalid relayer endpoint: {e}")))?;
        let response = self
            .client
            .post(url)
            .json(&EncryptRequest {
                chain_id: self.chain_id,
                key_id: &self.key_id,
                contract,
                user,
                bits: 32,
                plaintext: value,
            })
            .send()
            .await
            .map_err(|e| classify_transport_error("encrypt", &e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(RuntimeError::Transport(format!(
                "relayer encrypt failed with HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(RuntimeError::Encryption(format!(
                "relayer rejected encrypt request (HTTP {})",
                status.as_u16()
            )));
        }

        let body: EncryptResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::Encryption(format!("malformed encrypt response: {e}")))?;
        let handle = EncryptedHandle::parse(&body.handle)
            .map_err(|e| RuntimeError::Encryption(format!("malformed input handle: {e}")))?;
        Ok(EncryptedInput {
            handle,
            proof: body.proof,
        })
    }

    async fn user_decrypt_u32(
        &self,
        handle: &EncryptedHandle,
        contract: &Address,
        authorization: &DecryptionAuthorization,
    ) -> Result<u32, RuntimeError> {
        let url = api_url(&self.endpoint, "v1/user-decrypt")
            .map_err(|e| RuntimeError::Decryption(format!("invalid relayer endpoint: {e}")))?;
        let response = self
            .client
            .post(url)
            .json(&UserDecryptRequest {
                chain_id: self.chain_id,
                contract,
                handle: handle.as_str(),
                signer: &authorization.signer,
                signature: authorization.signature.expose_secret(),
                expires_at: authorization.expires_at.timestamp(),
            })
            .send()
            .await
            .map_err(|e| classify_transport_error("user-decrypt", &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RuntimeError::AuthorizationRejected(format!(
                "relayer rejected the decryption authorization (HTTP {})",
                status.as_u16()
            )));
        }
        if status.is_server_error() {
            return Err(RuntimeError::Transport(format!(
                "relayer user-decrypt failed with HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(RuntimeError::Decryption(format!(
                "relayer rejected decrypt request (HTTP {})",
                status.as_u16()
            )));
        }

        let body: UserDecryptResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::Decryption(format!("malformed decrypt response: {e}")))?;
        Ok(body.plaintext)
    }
}

fn api_url(endpoint: &Url, path: &str) -> Result<Url, url::ParseError> {
    endpoint.join(path)
}

fn keys_url(endpoint: &Url, chain_id: u64) -> Result<Url, url::ParseError> {
    endpoint.join(&format!("v1/keys/{chain_id}"))
}

fn classify_transport_error(context: &str, error: &reqwest::Error) -> RuntimeError {
    if error.is_timeout() {
        return RuntimeError::Transport(format!("{context} timed out"));
    }
    if error.is_connect() {
        return RuntimeError::Transport(format!("{context} connection failed: {error}"));
    }
    RuntimeError::Transport(format!("{context} failed: {error}"))
}

/// Reachability classification for the doctor surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayerHealthState {
    Healthy,
    InvalidUrl,
    ConnectFailure,
    Timeout,
    HttpFailure,
}

impl RelayerHealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::InvalidUrl => "invalid_url",
            Self::ConnectFailure => "connect_failure",
            Self::Timeout => "timeout",
            Self::HttpFailure => "http_failure",
        }
    }

    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Preflight probe result for the relayer endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerProbe {
    pub url: String,
    pub state: RelayerHealthState,
    pub detail: String,
    pub http_status: Option<u16>,
}

/// Probe the relayer endpoint and classify reachability failures.
pub async fn probe_relayer(endpoint: &Url, timeout: Duration) -> RelayerProbe {
    let url = endpoint.to_string();
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(error) => {
            return RelayerProbe {
                url,
                state: RelayerHealthState::ConnectFailure,
                detail: format!("HTTP client init failed: {error}"),
                http_status: None,
            };
        }
    };

    match client.get(endpoint.clone()).send().await {
        Ok(response) => {
            let status = response.status();
            // Anything the server answers, including 404 on the root path,
            // proves reachability; only 5xx counts as unhealthy.
            let state = if status.is_server_error() {
                RelayerHealthState::HttpFailure
            } else {
                RelayerHealthState::Healthy
            };
            RelayerProbe {
                url,
                state,
                detail: format!("HTTP {}", status.as_u16()),
                http_status: Some(status.as_u16()),
            }
        }
        Err(error) => {
            let state = if error.is_timeout() {
                RelayerHealthState::Timeout
            } else {
                RelayerHealthState::ConnectFailure
            };
            RelayerProbe {
                url,
                state,
                detail: error.to_string(),
                http_status: None,
            }
        }
    }
}
