//! FHE runtime capability and its network-scoped bootstrapper.
//!
//! A runtime instance is only valid for the network it was created against.
//! The bootstrapper rebuilds the instance on network changes and guarantees
//! that a slow bootstrap for a superseded network can never overwrite a
//! runtime already bound to the current one: results are checked against a
//! generation counter before commit and discarded when stale.

pub mod relayer;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::contract::{Address, EncryptedHandle, EncryptedInput};
use crate::error::RuntimeError;
use crate::signature::DecryptionAuthorization;

/// Opaque encrypted-compute capability scoped to one network.
#[async_trait]
pub trait FheRuntime: Send + Sync {
    /// Encrypt a 32-bit plaintext as a ciphertext input bound to
    /// (contract, user). The binding prevents replay against a different
    /// contract or account.
    async fn encrypt_u32(
        &self,
        value: u32,
        contract: &Address,
        user: &Address,
    ) -> Result<EncryptedInput, RuntimeError>;

    /// Decrypt a handle locally using a signed authorization.
    async fn user_decrypt_u32(
        &self,
        handle: &EncryptedHandle,
        contract: &Address,
        authorization: &DecryptionAuthorization,
    ) -> Result<u32, RuntimeError>;
}

/// Builds runtime instances for a given network.
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    async fn create(&self, chain_id: u64) -> Result<Arc<dyn FheRuntime>, RuntimeError>;
}

/// Lifecycle status of the bootstrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    /// No bootstrap requested yet.
    Idle,
    Bootstrapping,
    Ready,
    /// Terminal until the caller explicitly requests a new bootstrap.
    Error(String),
}

impl RuntimeStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Bootstrapping => f.write_str("bootstrapping"),
            Self::Ready => f.write_str("ready"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Published bootstrapper state.
#[derive(Clone)]
pub struct RuntimeState {
    pub chain_id: Option<u64>,
    pub status: RuntimeStatus,
    /// Monotonic bootstrap generation; a state from an older generation has
    /// been superseded.
    pub generation: u64,
    instance: Option<Arc<dyn FheRuntime>>,
}

impl RuntimeState {
    fn idle() -> Self {
        Self {
            chain_id: None,
            status: RuntimeStatus::Idle,
            generation: 0,
            instance: None,
        }
    }
}

/// Creates and swaps FHE runtime instances as the active network changes.
pub struct FheRuntimeBootstrapper {
    provider: Arc<dyn RuntimeProvider>,
    state_tx: watch::Sender<RuntimeState>,
    generation: AtomicU64,
}

impl FheRuntimeBootstrapper {
    pub fn new(provider: Arc<dyn RuntimeProvider>) -> Self {
        let (state_tx, _) = watch::channel(RuntimeState::idle());
        Self {
            provider,
            state_tx,
            generation: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> RuntimeStatus {
        self.state_tx.borrow().status.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state_tx.subscribe()
    }

    /// The ready runtime instance for `chain_id`, if that is the network the
    /// current instance was bootstrapped against.
    pub fn ready_instance(&self, chain_id: u64) -> Option<Arc<dyn FheRuntime>> {
        let state = self.state_tx.borrow();
        if state.status.is_ready() && state.chain_id == Some(chain_id) {
            state.instance.clone()
        } else {
            None
        }
    }

    /// Create a runtime instance for `chain_id`, replacing the current one.
    ///
    /// Concurrent calls are safe: each bootstrap takes a new generation, and
    /// a bootstrap that finishes after being superseded discards its result
    /// and reports [`RuntimeError::Superseded`] instead of committing.
    pub async fn bootstrap(&self, chain_id: u64) -> Result<Arc<dyn FheRuntime>, RuntimeError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(RuntimeState {
            chain_id: Some(chain_id),
            status: RuntimeStatus::Bootstrapping,
            generation,
            instance: None,
        });
        tracing::info!(chain_id, "bootstrapping FHE runtime");

        let result = self.provider.create(chain_id).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(chain_id, "discarding superseded runtime bootstrap");
            return Err(RuntimeError::Superseded { chain_id });
        }

        match result {
            Ok(instance) => {
                self.state_tx.send_replace(RuntimeState {
                    chain_id: Some(chain_id),
                    status: RuntimeStatus::Ready,
                    generation,
                    instance: Some(instance.clone()),
                });
                tracing::info!(chain_id, "FHE runtime ready");
                Ok(instance)
            }
            Err(error) => {
                self.state_tx.send_replace(RuntimeState {
                    chain_id: Some(chain_id),
                    status: RuntimeStatus::Error(error.to_string()),
                    generation,
                    instance: None,
                });
                tracing::warn!(chain_id, "FHE runtime bootstrap failed: {}", error);
                Err(error)
            }
        }
    }
}
