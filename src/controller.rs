//! The encrypted counter workflow controller.
//!
//! One controller instance owns the encrypted handle, the cached clear
//! value, and the operation state; the UI layer is a read-only observer and
//! a requester of operations, never a direct mutator. At most one operation
//! is in flight at a time: a request that arrives while another is running
//! is rejected, not queued.
//!
//! Every protocol follows the same check-before-commit discipline: the
//! network and signer are captured when an operation starts, and re-checked
//! immediately before any result is surfaced. Results computed under an
//! identity that has since changed are discarded and reported as stale.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::activity::{ActivityKind, ActivityLog};
use crate::catalog::DatasetCard;
use crate::config::WorkflowConfig;
use crate::contract::{
    Address, ContractDirectory, CounterContract, EncryptedHandle, TxReceipt,
};
use crate::error::{Error, FailurePayload, PreconditionError, Result, StalenessError};
use crate::identity::{ChainSignerIdentity, NetworkSnapshot, SignerSnapshot};
use crate::runtime::{FheRuntime, FheRuntimeBootstrapper};
use crate::signature::{DecryptionAuthorization, DecryptionSignatureCache, WalletSigner};

/// The operations the controller can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterOp {
    Increment,
    Decrement,
    RefreshHandle,
    Decrypt,
}

impl CounterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Increment => "increment",
            Self::Decrement => "decrement",
            Self::RefreshHandle => "refresh_handle",
            Self::Decrypt => "decrypt",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Increment => "Encrypted job",
            Self::Decrement => "Rollback",
            Self::RefreshHandle => "Handle refresh",
            Self::Decrypt => "Decryption",
        }
    }
}

/// Controller state. Exactly one operation occupies `Busy` at a time;
/// `Failed` and `Succeeded` are transient and return to `Idle` once
/// reported.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationState {
    Idle,
    Busy {
        op: CounterOp,
        started_at: DateTime<Utc>,
    },
    Failed {
        op: CounterOp,
        failure: FailurePayload,
    },
    Succeeded {
        op: CounterOp,
    },
}

impl OperationState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// A decrypted counter value tagged with the handle it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearValue {
    pub value: u32,
    pub source_handle: EncryptedHandle,
}

/// How the clear value should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearState {
    Absent,
    /// A value exists but was derived from a superseded handle.
    Stale,
    Fresh(u32),
}

/// Read-only view published to observers after every state transition.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub state: OperationState,
    pub handle: Option<EncryptedHandle>,
    pub clear: Option<ClearValue>,
    pub last_failure: Option<FailurePayload>,
}

impl ControllerSnapshot {
    fn initial() -> Self {
        Self {
            state: OperationState::Idle,
            handle: None,
            clear: None,
            last_failure: None,
        }
    }

    /// A clear value is only surfaced while it matches the current handle.
    pub fn clear_state(&self) -> ClearState {
        match (&self.clear, &self.handle) {
            (Some(clear), Some(handle)) if clear.source_handle == *handle => {
                ClearState::Fresh(clear.value)
            }
            (Some(_), _) => ClearState::Stale,
            (None, _) => ClearState::Absent,
        }
    }
}

struct ControllerInner {
    state: OperationState,
    handle: Option<EncryptedHandle>,
    clear: Option<ClearValue>,
    last_failure: Option<FailurePayload>,
}

/// Identity captured when an operation begins, checked again before commit.
struct OpTicket {
    network: NetworkSnapshot,
    signer: Option<SignerSnapshot>,
}

/// Coordinates encrypted counter operations against the ledger contract.
pub struct EncryptedCounterController {
    identity: ChainSignerIdentity,
    bootstrapper: Arc<FheRuntimeBootstrapper>,
    signatures: DecryptionSignatureCache,
    contracts: Arc<dyn ContractDirectory>,
    activity: ActivityLog,
    config: WorkflowConfig,
    inner: Mutex<ControllerInner>,
    snapshot_tx: watch::Sender<ControllerSnapshot>,
}

impl EncryptedCounterController {
    pub fn new(
        identity: ChainSignerIdentity,
        bootstrapper: Arc<FheRuntimeBootstrapper>,
        signatures: DecryptionSignatureCache,
        contracts: Arc<dyn ContractDirectory>,
        activity: ActivityLog,
        config: WorkflowConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(ControllerSnapshot::initial());
        Self {
            identity,
            bootstrapper,
            signatures,
            contracts,
            activity,
            config,
            inner: Mutex::new(ControllerInner {
                state: OperationState::Idle,
                handle: None,
                clear: None,
                last_failure: None,
            }),
            snapshot_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &ControllerInner) {
        self.snapshot_tx.send_replace(ControllerSnapshot {
            state: inner.state.clone(),
            handle: inner.handle.clone(),
            clear: inner.clear.clone(),
            last_failure: inner.last_failure.clone(),
        });
    }

    /// Current observable view.
    pub fn snapshot(&self) -> ControllerSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Activity sink shared with the host UI.
    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Display-only permission read for the connected signer.
    pub async fn signer_has_permission(&self) -> Result<bool> {
        let signer = self
            .identity
            .current_signer()
            .ok_or(PreconditionError::NotConnected)?;
        let network = self
            .identity
            .current_network()
            .ok_or(PreconditionError::NoNetwork)?;
        let contract = self
            .contracts
            .resolve(network.chain_id)
            .ok_or(PreconditionError::NotDeployed {
                chain_id: network.chain_id,
            })?;
        Ok(contract.has_permission(&signer.address).await?)
    }

    /// Host hook for network or account change events: drops every cached
    /// decryption authorization and re-bootstraps the runtime for the new
    /// network. A superseded bootstrap is not an error here.
    pub async fn on_connectivity_changed(&self) -> Result<()> {
        self.signatures.invalidate_all();
        let Some(network) = self.identity.current_network() else {
            return Ok(());
        };
        match self.bootstrapper.bootstrap(network.chain_id).await {
            Ok(_) => Ok(()),
            Err(crate::error::RuntimeError::Superseded { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply a positive delta to the encrypted counter.
    pub async fn increment(&self, delta: u32) -> Result<TxReceipt> {
        self.submit_delta(CounterOp::Increment, delta).await
    }

    /// Roll the encrypted counter back by `delta`.
    pub async fn decrement(&self, delta: u32) -> Result<TxReceipt> {
        self.submit_delta(CounterOp::Decrement, delta).await
    }

    /// Run a catalog preset, routed to increment or decrement by the sign
    /// of its delta.
    pub async fn submit_dataset(&self, card: &DatasetCard) -> Result<TxReceipt> {
        let (kind, title) = if card.is_rollback() {
            (ActivityKind::Rollback, format!("Rollback via {}", card.name))
        } else {
            (ActivityKind::Job, format!("Running {}", card.name))
        };
        self.activity.emit(kind, title, Some(card.delta_label()));

        let magnitude = card.delta.unsigned_abs() as u32;
        if card.is_rollback() {
            self.decrement(magnitude).await
        } else {
            self.increment(magnitude).await
        }
    }

    async fn submit_delta(&self, op: CounterOp, magnitude: u32) -> Result<TxReceipt> {
        let effective: i64 = match op {
            CounterOp::Decrement => -i64::from(magnitude),
            _ => i64::from(magnitude),
        };

        // Preconditions and the Idle -> Busy transition happen atomically;
        // everything here is checked before any network interaction.
        let (ticket, signer, contract, runtime) = {
            let mut inner = self.lock();
            if !inner.state.is_idle() {
                return self.reject(PreconditionError::Busy);
            }
            let Some(signer) = self.identity.current_signer() else {
                return self.reject(PreconditionError::NotConnected);
            };
            let Some(network) = self.identity.current_network() else {
                return self.reject(PreconditionError::NoNetwork);
            };
            let Some(contract) = self.contracts.resolve(network.chain_id) else {
                return self.reject(PreconditionError::NotDeployed {
                    chain_id: network.chain_id,
                });
            };
            let Some(runtime) = self.bootstrapper.ready_instance(network.chain_id) else {
                return self.reject(PreconditionError::RuntimeNotReady {
                    status: self.bootstrapper.status().to_string(),
                });
            };
            if effective > self.config.delta_max {
                return self.reject(PreconditionError::DeltaTooLarge {
                    delta: effective,
                    max: self.config.delta_max,
                });
            }
            if effective < self.config.delta_min {
                return self.reject(PreconditionError::DeltaTooSmall {
                    delta: effective,
                    min: self.config.delta_min,
                });
            }

            inner.state = OperationState::Busy {
                op,
                started_at: Utc::now(),
            };
            self.publish(&inner);
            let ticket = OpTicket {
                network,
                signer: Some(signer.clone()),
            };
            (ticket, signer, contract, runtime)
        };

        tracing::info!(op = op.as_str(), delta = effective, "submitting encrypted delta");

        // Encrypt, submit, and confirm, with bounded retry on transient
        // failures. Exhaustion is terminal for this attempt; the user can
        // retry manually as a fresh operation.
        let mut attempt = 1u32;
        let receipt = loop {
            match self
                .attempt_submission(op, magnitude, contract.as_ref(), runtime.as_ref(), &signer.address)
                .await
            {
                Ok(receipt) => break receipt,
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    tracing::warn!(
                        op = op.as_str(),
                        attempt,
                        "transient failure, retrying: {}",
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(err) => {
                    let err = if err.is_transient() {
                        Error::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(err),
                        }
                    } else {
                        err
                    };
                    return self.fail(op, err);
                }
            }
        };

        // Re-read the on-chain handle so observers see the post-transaction
        // state, then commit unless the identity moved underneath us.
        let handle = match contract.get_count().await {
            Ok(handle) => handle,
            Err(err) => return self.fail(op, err.into()),
        };
        if let Err(stale) = self.guard_fresh(&ticket) {
            return self.fail(op, stale.into());
        }

        {
            let mut inner = self.lock();
            if inner
                .clear
                .as_ref()
                .is_some_and(|clear| clear.source_handle != handle)
            {
                inner.clear = None;
            }
            inner.handle = Some(handle);
            self.succeed(&mut inner, op);
        }

        let (kind, title) = match op {
            CounterOp::Decrement => (ActivityKind::Rollback, "Rolled back encrypted job"),
            _ => (ActivityKind::Job, "Submitted encrypted job"),
        };
        let details = if effective >= 0 {
            format!("Δ = +{effective}")
        } else {
            format!("Δ = {effective}")
        };
        self.activity.emit(kind, title, Some(details));
        Ok(receipt)
    }

    async fn attempt_submission(
        &self,
        op: CounterOp,
        magnitude: u32,
        contract: &dyn CounterContract,
        runtime: &dyn FheRuntime,
        signer: &Address,
    ) -> Result<TxReceipt> {
        let input = runtime
            .encrypt_u32(magnitude, contract.address(), signer)
            .await?;
        let pending = match op {
            CounterOp::Decrement => contract.decrement(&input, signer).await?,
            _ => contract.increment(&input, signer).await?,
        };
        Ok(contract.confirm(&pending.tx_hash).await?)
    }

    /// Fetch the current on-chain handle and replace the stored one.
    ///
    /// A cached clear value survives only if the fetched handle is the one
    /// it was derived from, which makes back-to-back refreshes idempotent.
    pub async fn refresh_handle(&self) -> Result<EncryptedHandle> {
        let op = CounterOp::RefreshHandle;
        let (ticket, contract) = {
            let mut inner = self.lock();
            if !inner.state.is_idle() {
                return self.reject(PreconditionError::Busy);
            }
            let Some(network) = self.identity.current_network() else {
                return self.reject(PreconditionError::NoNetwork);
            };
            let Some(contract) = self.contracts.resolve(network.chain_id) else {
                return self.reject(PreconditionError::NotDeployed {
                    chain_id: network.chain_id,
                });
            };
            inner.state = OperationState::Busy {
                op,
                started_at: Utc::now(),
            };
            self.publish(&inner);
            let ticket = OpTicket {
                network,
                signer: self.identity.current_signer(),
            };
            (ticket, contract)
        };

        let handle = match contract.get_count().await {
            Ok(handle) => handle,
            Err(err) => return self.fail(op, err.into()),
        };
        if let Err(stale) = self.guard_fresh(&ticket) {
            return self.fail(op, stale.into());
        }

        {
            let mut inner = self.lock();
            if inner
                .clear
                .as_ref()
                .is_some_and(|clear| clear.source_handle != handle)
            {
                inner.clear = None;
            }
            inner.handle = Some(handle.clone());
            self.succeed(&mut inner, op);
        }
        self.activity.emit(
            ActivityKind::Refresh,
            "Refreshed encrypted handle",
            Some(short_handle(&handle)),
        );
        Ok(handle)
    }

    /// Decrypt the current handle locally, reusing a cached authorization
    /// when one matches the (contract, network, signer) triple.
    pub async fn decrypt(&self) -> Result<u32> {
        let op = CounterOp::Decrypt;
        let (ticket, signer, wallet, contract, runtime, handle) = {
            let mut inner = self.lock();
            if !inner.state.is_idle() {
                return self.reject(PreconditionError::Busy);
            }
            // The all-zero handle marks an uninitialized counter: nothing
            // to decrypt yet.
            let Some(handle) = inner.handle.clone().filter(|handle| !handle.is_zero()) else {
                return self.reject(PreconditionError::NothingToDecrypt);
            };
            let (Some(signer), Some(wallet)) = (
                self.identity.current_signer(),
                self.identity.current_wallet(),
            ) else {
                return self.reject(PreconditionError::NotConnected);
            };
            let Some(network) = self.identity.current_network() else {
                return self.reject(PreconditionError::NoNetwork);
            };
            let Some(contract) = self.contracts.resolve(network.chain_id) else {
                return self.reject(PreconditionError::NotDeployed {
                    chain_id: network.chain_id,
                });
            };
            let Some(runtime) = self.bootstrapper.ready_instance(network.chain_id) else {
                return self.reject(PreconditionError::RuntimeNotReady {
                    status: self.bootstrapper.status().to_string(),
                });
            };
            inner.state = OperationState::Busy {
                op,
                started_at: Utc::now(),
            };
            self.publish(&inner);
            let ticket = OpTicket {
                network,
                signer: Some(signer.clone()),
            };
            (ticket, signer, wallet, contract, runtime, handle)
        };

        let authorization = match self
            .obtain_authorization(contract.address(), ticket.network.chain_id, &signer, &wallet)
            .await
        {
            Ok(authorization) => authorization,
            Err(err) => return self.fail(op, err),
        };

        let value = match runtime
            .user_decrypt_u32(&handle, contract.address(), &authorization)
            .await
        {
            Ok(value) => value,
            Err(err) => return self.fail(op, err.into()),
        };
        if let Err(stale) = self.guard_fresh(&ticket) {
            return self.fail(op, stale.into());
        }

        {
            let mut inner = self.lock();
            inner.clear = Some(ClearValue {
                value,
                source_handle: handle.clone(),
            });
            self.succeed(&mut inner, op);
        }
        self.activity.emit(
            ActivityKind::Decrypt,
            "Decrypted latest handle",
            Some(short_handle(&handle)),
        );
        Ok(value)
    }

    async fn obtain_authorization(
        &self,
        contract: &Address,
        chain_id: u64,
        signer: &SignerSnapshot,
        wallet: &Arc<dyn WalletSigner>,
    ) -> Result<DecryptionAuthorization> {
        if let Some(cached) = self.signatures.get(contract, chain_id, &signer.address) {
            tracing::debug!("reusing cached decryption authorization");
            return Ok(cached);
        }

        let signature = wallet.sign_decryption_request(contract, chain_id).await?;
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(self.config.authorization_ttl)
            .unwrap_or_else(|_| ChronoDuration::seconds(600));
        let authorization = DecryptionAuthorization {
            contract: contract.clone(),
            chain_id,
            signer: signer.address.clone(),
            signature,
            issued_at: now,
            expires_at: now + ttl,
        };
        self.signatures.put(authorization.clone());
        Ok(authorization)
    }

    /// Re-validate the identity captured at operation start. On mismatch the
    /// authorization cache is flushed as well, since its entries were keyed
    /// under the old identity.
    fn guard_fresh(&self, ticket: &OpTicket) -> std::result::Result<(), StalenessError> {
        if !self.identity.is_same_network(&ticket.network) {
            self.signatures.invalidate_all();
            return Err(StalenessError::NetworkChanged);
        }
        let signer_unchanged = match &ticket.signer {
            Some(signer) => self.identity.is_same_signer(signer),
            None => self.identity.current_signer().is_none(),
        };
        if !signer_unchanged {
            self.signatures.invalidate_all();
            return Err(StalenessError::SignerChanged);
        }
        Ok(())
    }

    fn succeed(&self, inner: &mut ControllerInner, op: CounterOp) {
        inner.last_failure = None;
        inner.state = OperationState::Succeeded { op };
        self.publish(inner);
        inner.state = OperationState::Idle;
        self.publish(inner);
    }

    fn fail<T>(&self, op: CounterOp, err: Error) -> Result<T> {
        let failure = err.to_failure_payload();
        tracing::warn!(
            op = op.as_str(),
            code = failure.code,
            "operation failed: {}",
            failure.message
        );
        {
            let mut inner = self.lock();
            inner.last_failure = Some(failure.clone());
            inner.state = OperationState::Failed {
                op,
                failure: failure.clone(),
            };
            self.publish(&inner);
            inner.state = OperationState::Idle;
            self.publish(&inner);
        }
        self.activity.emit(
            ActivityKind::Error,
            format!("{} failed", op.label()),
            Some(failure.message),
        );
        Err(err)
    }

    /// Precondition rejection: no state transition, surfaced on the sink.
    fn reject<T>(&self, err: PreconditionError) -> Result<T> {
        let error = Error::from(err);
        let failure = error.to_failure_payload();
        tracing::debug!(code = failure.code, "operation rejected: {}", failure.message);
        self.activity
            .emit(ActivityKind::Error, failure.message, None);
        Err(error)
    }
}

fn short_handle(handle: &EncryptedHandle) -> String {
    let text = handle.as_str();
    format!("{}…{}", &text[..10], &text[text.len() - 6..])
}
