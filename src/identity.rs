//! Tracks the active network and signing identity.
//!
//! Values captured at the start of an operation are compared against the
//! live state before results are committed; any mismatch means the result
//! was computed under an obsolete identity and must be discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::contract::Address;
use crate::signature::WalletSigner;

/// Immutable capture of the active network at a point in the update order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub chain_id: u64,
    /// Logical clock value at capture time; later snapshots compare greater.
    pub captured_at: u64,
}

/// Immutable capture of the active signing identity. A reconnect or account
/// switch produces a new snapshot, never mutates an old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerSnapshot {
    pub address: Address,
    /// Identity of the wallet provider session this signer came from.
    pub provider_id: Uuid,
}

#[derive(Default)]
struct IdentityInner {
    chain_id: Option<u64>,
    signer: Option<SignerSnapshot>,
    wallet: Option<Arc<dyn WalletSigner>>,
    clock: u64,
}

/// Shared view of the external connectivity state.
///
/// The host wallet adapter pushes updates in; the controller only ever reads
/// snapshots and staleness predicates. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct ChainSignerIdentity {
    inner: Arc<Mutex<IdentityInner>>,
}

impl ChainSignerIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IdentityInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current network, if the provider has reported one.
    pub fn current_network(&self) -> Option<NetworkSnapshot> {
        let inner = self.lock();
        inner.chain_id.map(|chain_id| NetworkSnapshot {
            chain_id,
            captured_at: inner.clock,
        })
    }

    /// Current signer, or `None` when no wallet is connected.
    pub fn current_signer(&self) -> Option<SignerSnapshot> {
        self.lock().signer.clone()
    }

    /// Signing capability of the current signer.
    pub fn current_wallet(&self) -> Option<Arc<dyn WalletSigner>> {
        self.lock().wallet.clone()
    }

    /// Whether the active network still matches an earlier snapshot.
    pub fn is_same_network(&self, snapshot: &NetworkSnapshot) -> bool {
        self.lock().chain_id == Some(snapshot.chain_id)
    }

    /// Whether the active signer still matches an earlier snapshot
    /// (same address from the same provider session).
    pub fn is_same_signer(&self, snapshot: &SignerSnapshot) -> bool {
        self.lock().signer.as_ref() == Some(snapshot)
    }

    /// Record a network switch reported by the provider.
    pub fn set_network(&self, chain_id: u64) {
        let mut inner = self.lock();
        if inner.chain_id != Some(chain_id) {
            inner.chain_id = Some(chain_id);
            inner.clock += 1;
            tracing::debug!("active network is now chain {}", chain_id);
        }
    }

    /// Record a fresh wallet connection. Returns the new snapshot.
    pub fn connect(&self, wallet: Arc<dyn WalletSigner>) -> SignerSnapshot {
        let snapshot = SignerSnapshot {
            address: wallet.address().clone(),
            provider_id: Uuid::new_v4(),
        };
        let mut inner = self.lock();
        inner.signer = Some(snapshot.clone());
        inner.wallet = Some(wallet);
        inner.clock += 1;
        tracing::debug!("signer connected: {}", snapshot.address);
        snapshot
    }

    /// Record an account switch within the current provider session.
    /// Falls back to a fresh connection when nothing is connected yet.
    pub fn switch_account(&self, wallet: Arc<dyn WalletSigner>) -> SignerSnapshot {
        let mut inner = self.lock();
        let provider_id = match inner.signer.as_ref() {
            Some(existing) => existing.provider_id,
            None => Uuid::new_v4(),
        };
        let snapshot = SignerSnapshot {
            address: wallet.address().clone(),
            provider_id,
        };
        inner.signer = Some(snapshot.clone());
        inner.wallet = Some(wallet);
        inner.clock += 1;
        snapshot
    }

    /// Record a wallet disconnect.
    pub fn disconnect(&self) {
        let mut inner = self.lock();
        if inner.signer.take().is_some() {
            inner.wallet = None;
            inner.clock += 1;
            tracing::debug!("signer disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::LocalSigner;

    fn wallet(seed: u8) -> Arc<dyn WalletSigner> {
        Arc::new(LocalSigner::from_bytes(&[seed; 32]).expect("valid key"))
    }

    #[test]
    fn no_network_until_reported() {
        let identity = ChainSignerIdentity::new();
        assert!(identity.current_network().is_none());

        identity.set_network(31337);
        let snapshot = identity.current_network().expect("network set");
        assert_eq!(snapshot.chain_id, 31337);
        assert!(identity.is_same_network(&snapshot));
    }

    #[test]
    fn network_switch_invalidates_old_snapshot() {
        let identity = ChainSignerIdentity::new();
        identity.set_network(31337);
        let before = identity.current_network().expect("network set");

        identity.set_network(11155111);
        assert!(!identity.is_same_network(&before));
    }

    #[test]
    fn account_switch_keeps_provider_session() {
        let identity = ChainSignerIdentity::new();
        let first = identity.connect(wallet(1));
        let second = identity.switch_account(wallet(2));

        assert_eq!(first.provider_id, second.provider_id);
        assert!(!identity.is_same_signer(&first));
        assert!(identity.is_same_signer(&second));
    }

    #[test]
    fn reconnect_is_a_new_provider_session() {
        let identity = ChainSignerIdentity::new();
        let first = identity.connect(wallet(1));
        let again = identity.connect(wallet(1));

        // Same address, different provider instance: the old capture is stale.
        assert_ne!(first.provider_id, again.provider_id);
        assert!(!identity.is_same_signer(&first));
    }

    #[test]
    fn disconnect_clears_signer_and_wallet() {
        let identity = ChainSignerIdentity::new();
        let snapshot = identity.connect(wallet(3));
        identity.disconnect();

        assert!(identity.current_signer().is_none());
        assert!(identity.current_wallet().is_none());
        assert!(!identity.is_same_signer(&snapshot));
    }
}
