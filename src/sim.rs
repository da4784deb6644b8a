//! In-process simulation of the counter contract and its FHE coprocessor.
//!
//! The simulated contract and runtime share one coprocessor state, so an
//! encrypt -> submit -> confirm -> decrypt round trip is deterministic
//! without any external service. Used by the demo binary and the test
//! suites; production hosts wire real implementations of the same traits.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::contract::{
    Address, CounterContract, EncryptedHandle, EncryptedInput, PendingTransaction, TxHash,
    TxReceipt,
};
use crate::error::{ContractError, RuntimeError};
use crate::runtime::{FheRuntime, RuntimeProvider};
use crate::signature::DecryptionAuthorization;

#[derive(Debug, Clone)]
struct RegisteredInput {
    value: u32,
    contract: Address,
    user: Address,
    proof: String,
}

#[derive(Debug)]
struct CoprocessorState {
    counter: u32,
    handle: EncryptedHandle,
    values: HashMap<EncryptedHandle, u32>,
    inputs: HashMap<EncryptedHandle, RegisteredInput>,
    transactions: HashMap<TxHash, u64>,
    block: u64,
    nonce: u64,
    paused: bool,
    owner: Address,
    permissions: HashSet<Address>,
    failing_submissions: u32,
    runtime_delay: Duration,
}

/// One simulated chain hosting a ComputeVeil deployment.
///
/// Cloning shares the same chain state.
#[derive(Clone)]
pub struct SimChain {
    chain_id: u64,
    contract_address: Address,
    state: Arc<Mutex<CoprocessorState>>,
}

fn derive_hex(tag: &str, chain_id: u64, nonce: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(tag.as_bytes());
    hasher.update(&chain_id.to_le_bytes());
    hasher.update(&nonce.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

fn derive_handle(tag: &str, chain_id: u64, nonce: u64) -> EncryptedHandle {
    EncryptedHandle::parse(&format!("0x{}", derive_hex(tag, chain_id, nonce)))
        .unwrap_or_else(|_| EncryptedHandle::zero())
}

impl SimChain {
    pub fn new(chain_id: u64, deployer: Address) -> Self {
        let contract_address = Address::parse(&format!(
            "0x{}",
            &derive_hex("contract", chain_id, 0)[..40]
        ))
        .unwrap_or_else(|_| deployer.clone());
        Self {
            chain_id,
            contract_address,
            state: Arc::new(Mutex::new(CoprocessorState {
                counter: 0,
                handle: EncryptedHandle::zero(),
                values: HashMap::new(),
                inputs: HashMap::new(),
                transactions: HashMap::new(),
                block: 0,
                nonce: 0,
                paused: false,
                owner: deployer,
                permissions: HashSet::new(),
                failing_submissions: 0,
                runtime_delay: Duration::ZERO,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoprocessorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn contract_address(&self) -> &Address {
        &self.contract_address
    }

    /// Contract client bound to this chain.
    pub fn contract(&self) -> Arc<dyn CounterContract> {
        Arc::new(SimCounterContract {
            chain: self.clone(),
        })
    }

    /// Pause or unpause the contract. Owner only.
    pub fn set_paused(&self, by: &Address, paused: bool) -> Result<(), ContractError> {
        let mut state = self.lock();
        if state.owner != *by {
            return Err(ContractError::NotOwner);
        }
        state.paused = paused;
        Ok(())
    }

    /// Transfer contract ownership. Owner only.
    pub fn transfer_ownership(&self, by: &Address, to: Address) -> Result<(), ContractError> {
        let mut state = self.lock();
        if state.owner != *by {
            return Err(ContractError::NotOwner);
        }
        state.owner = to;
        Ok(())
    }

    /// Make the next `count` submissions fail with a transport error.
    pub fn fail_next_submissions(&self, count: u32) {
        self.lock().failing_submissions = count;
    }

    /// Add artificial latency to runtime round trips, so tests can interleave
    /// identity changes with suspended operations.
    pub fn set_runtime_delay(&self, delay: Duration) {
        self.lock().runtime_delay = delay;
    }

    fn runtime_delay(&self) -> Duration {
        self.lock().runtime_delay
    }

    fn submit(
        &self,
        input: &EncryptedInput,
        from: &Address,
        negate: bool,
    ) -> Result<PendingTransaction, ContractError> {
        let mut state = self.lock();
        if state.failing_submissions > 0 {
            state.failing_submissions -= 1;
            return Err(ContractError::Transport("connection dropped".into()));
        }
        if state.paused {
            return Err(ContractError::Paused);
        }
        let registered = state
            .inputs
            .remove(&input.handle)
            .ok_or_else(|| ContractError::InvalidInput("unknown ciphertext input".into()))?;
        if registered.contract != self.contract_address
            || registered.user != *from
            || registered.proof != input.proof
        {
            return Err(ContractError::InvalidInput(
                "ciphertext input is bound to a different contract or account".into(),
            ));
        }

        state.counter = if negate {
            state.counter.wrapping_sub(registered.value)
        } else {
            state.counter.wrapping_add(registered.value)
        };
        state.nonce += 1;
        state.block += 1;
        let handle = derive_handle("count", self.chain_id, state.nonce);
        let counter = state.counter;
        state.values.insert(handle.clone(), counter);
        state.handle = handle;
        state.permissions.insert(from.clone());

        let tx_hash = TxHash(format!("0x{}", derive_hex("tx", self.chain_id, state.nonce)));
        let block = state.block;
        state.transactions.insert(tx_hash.clone(), block);
        Ok(PendingTransaction {
            tx_hash,
            submitted_at: Utc::now(),
        })
    }
}

struct SimCounterContract {
    chain: SimChain,
}

#[async_trait]
impl CounterContract for SimCounterContract {
    fn address(&self) -> &Address {
        &self.chain.contract_address
    }

    fn chain_id(&self) -> u64 {
        self.chain.chain_id
    }

    async fn get_count(&self) -> Result<EncryptedHandle, ContractError> {
        Ok(self.chain.lock().handle.clone())
    }

    async fn increment(
        &self,
        input: &EncryptedInput,
        from: &Address,
    ) -> Result<PendingTransaction, ContractError> {
        self.chain.submit(input, from, false)
    }

    async fn decrement(
        &self,
        input: &EncryptedInput,
        from: &Address,
    ) -> Result<PendingTransaction, ContractError> {
        self.chain.submit(input, from, true)
    }

    async fn confirm(&self, tx: &TxHash) -> Result<TxReceipt, ContractError> {
        let block_number = self
            .chain
            .lock()
            .transactions
            .get(tx)
            .copied()
            .ok_or_else(|| ContractError::Transport(format!("transaction {tx} not found")))?;
        Ok(TxReceipt {
            tx_hash: tx.clone(),
            block_number,
            confirmed_at: Utc::now(),
        })
    }

    async fn is_paused(&self) -> Result<bool, ContractError> {
        Ok(self.chain.lock().paused)
    }

    async fn has_permission(&self, user: &Address) -> Result<bool, ContractError> {
        Ok(self.chain.lock().permissions.contains(user))
    }
}

struct SimRuntime {
    chain: SimChain,
}

#[async_trait]
impl FheRuntime for SimRuntime {
    async fn encrypt_u32(
        &self,
        value: u32,
        contract: &Address,
        user: &Address,
    ) -> Result<EncryptedInput, RuntimeError> {
        let delay = self.chain.runtime_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.chain.lock();
        state.nonce += 1;
        let handle = derive_handle("input", self.chain.chain_id, state.nonce);
        let proof = format!("0x{}", derive_hex("proof", self.chain.chain_id, state.nonce));
        state.inputs.insert(
            handle.clone(),
            RegisteredInput {
                value,
                contract: contract.clone(),
                user: user.clone(),
                proof: proof.clone(),
            },
        );
        Ok(EncryptedInput { handle, proof })
    }

    async fn user_decrypt_u32(
        &self,
        handle: &EncryptedHandle,
        contract: &Address,
        authorization: &DecryptionAuthorization,
    ) -> Result<u32, RuntimeError> {
        let delay = self.chain.runtime_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if authorization.contract != *contract || authorization.chain_id != self.chain.chain_id {
            return Err(RuntimeError::AuthorizationRejected(
                "authorization does not cover this contract and chain".into(),
            ));
        }
        if authorization.is_expired(Utc::now()) {
            return Err(RuntimeError::AuthorizationRejected(
                "authorization has expired".into(),
            ));
        }
        let state = self.chain.lock();
        if !state.permissions.contains(&authorization.signer) {
            return Err(RuntimeError::AuthorizationRejected(
                "account has no decryption permission".into(),
            ));
        }
        state
            .values
            .get(handle)
            .copied()
            .ok_or_else(|| RuntimeError::Decryption("unknown handle".into()))
    }
}

/// Runtime provider over a set of simulated chains.
#[derive(Clone, Default)]
pub struct SimRuntimeProvider {
    chains: HashMap<u64, SimChain>,
}

impl SimRuntimeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, chain: &SimChain) -> Self {
        self.chains.insert(chain.chain_id(), chain.clone());
        self
    }
}

#[async_trait]
impl RuntimeProvider for SimRuntimeProvider {
    async fn create(&self, chain_id: u64) -> Result<Arc<dyn FheRuntime>, RuntimeError> {
        let chain = self
            .chains
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| RuntimeError::Bootstrap(format!("no coprocessor for chain {chain_id}")))?;
        Ok(Arc::new(SimRuntime { chain }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use secrecy::SecretString;

    fn addr(tail: u8) -> Address {
        Address::parse(&format!("0x{}{:02x}", "0".repeat(38), tail)).expect("valid test address")
    }

    fn authorization(chain: &SimChain, signer: &Address) -> DecryptionAuthorization {
        let now = Utc::now();
        DecryptionAuthorization {
            contract: chain.contract_address().clone(),
            chain_id: chain.chain_id(),
            signer: signer.clone(),
            signature: SecretString::from("0xsigned"),
            issued_at: now,
            expires_at: now + ChronoDuration::minutes(10),
        }
    }

    #[tokio::test]
    async fn increment_round_trip_updates_counter() {
        let deployer = addr(1);
        let alice = addr(2);
        let chain = SimChain::new(31337, deployer);
        let contract = chain.contract();
        let runtime = SimRuntimeProvider::new()
            .with_chain(&chain)
            .create(31337)
            .await
            .expect("runtime");

        assert!(contract.get_count().await.expect("reads").is_zero());

        let input = runtime
            .encrypt_u32(3, contract.address(), &alice)
            .await
            .expect("encrypts");
        let pending = contract.increment(&input, &alice).await.expect("submits");
        contract.confirm(&pending.tx_hash).await.expect("confirms");

        let handle = contract.get_count().await.expect("reads");
        assert!(!handle.is_zero());

        let clear = runtime
            .user_decrypt_u32(&handle, contract.address(), &authorization(&chain, &alice))
            .await
            .expect("decrypts");
        assert_eq!(clear, 3);
        assert!(contract.has_permission(&alice).await.expect("reads"));
    }

    #[tokio::test]
    async fn decrement_wraps_below_zero() {
        let deployer = addr(1);
        let alice = addr(2);
        let chain = SimChain::new(31337, deployer);
        let contract = chain.contract();
        let runtime = SimRuntimeProvider::new()
            .with_chain(&chain)
            .create(31337)
            .await
            .expect("runtime");

        let input = runtime
            .encrypt_u32(1, contract.address(), &alice)
            .await
            .expect("encrypts");
        contract.decrement(&input, &alice).await.expect("submits");

        let handle = contract.get_count().await.expect("reads");
        let clear = runtime
            .user_decrypt_u32(&handle, contract.address(), &authorization(&chain, &alice))
            .await
            .expect("decrypts");
        assert_eq!(clear, u32::MAX);
    }

    #[tokio::test]
    async fn paused_contract_rejects_submissions() {
        let deployer = addr(1);
        let alice = addr(2);
        let chain = SimChain::new(31337, deployer.clone());
        let contract = chain.contract();
        let runtime = SimRuntimeProvider::new()
            .with_chain(&chain)
            .create(31337)
            .await
            .expect("runtime");

        assert!(matches!(
            chain.set_paused(&alice, true),
            Err(ContractError::NotOwner)
        ));
        chain.set_paused(&deployer, true).expect("owner pauses");
        assert!(contract.is_paused().await.expect("reads"));

        let input = runtime
            .encrypt_u32(1, contract.address(), &alice)
            .await
            .expect("encrypts");
        assert!(matches!(
            contract.increment(&input, &alice).await,
            Err(ContractError::Paused)
        ));
    }

    #[tokio::test]
    async fn inputs_are_bound_and_single_use() {
        let deployer = addr(1);
        let alice = addr(2);
        let bob = addr(3);
        let chain = SimChain::new(31337, deployer);
        let contract = chain.contract();
        let runtime = SimRuntimeProvider::new()
            .with_chain(&chain)
            .create(31337)
            .await
            .expect("runtime");

        // Bound to alice, submitted by bob: rejected.
        let input = runtime
            .encrypt_u32(2, contract.address(), &alice)
            .await
            .expect("encrypts");
        assert!(matches!(
            contract.increment(&input, &bob).await,
            Err(ContractError::InvalidInput(_))
        ));

        // The failed replay consumed the registration.
        assert!(matches!(
            contract.increment(&input, &alice).await,
            Err(ContractError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn ownership_transfer_moves_pause_rights() {
        let deployer = addr(1);
        let alice = addr(2);
        let chain = SimChain::new(31337, deployer.clone());

        chain
            .transfer_ownership(&deployer, alice.clone())
            .expect("transfers");
        assert!(matches!(
            chain.set_paused(&deployer, true),
            Err(ContractError::NotOwner)
        ));
        chain.set_paused(&alice, true).expect("new owner pauses");
    }
}
