//! Signed decryption authorizations and their cache.
//!
//! One signed authorization serves many decrypt calls for the same
//! (contract, chain, signer) triple, so the user is not re-prompted on
//! every decryption. An authorization is evicted the moment any key
//! component changes or its expiry passes; it is never updated in place.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k256::ecdsa::signature::Signer as _;
use k256::ecdsa::{Signature, SigningKey};
use secrecy::SecretString;
use sha3::{Digest, Keccak256};

use crate::contract::Address;
use crate::error::SignerError;

/// A signed artifact proving the holder may decrypt a contract's data on a
/// given network. Reusable until invalidated or expired.
#[derive(Debug, Clone)]
pub struct DecryptionAuthorization {
    pub contract: Address,
    pub chain_id: u64,
    pub signer: Address,
    pub signature: SecretString,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DecryptionAuthorization {
    pub fn matches(&self, contract: &Address, chain_id: u64, signer: &Address) -> bool {
        self.contract == *contract && self.chain_id == chain_id && self.signer == *signer
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    contract: Address,
    chain_id: u64,
    signer: Address,
}

/// Cache of decryption authorizations keyed by (contract, chain, signer).
///
/// Cloning shares the same storage.
#[derive(Debug, Clone, Default)]
pub struct DecryptionSignatureCache {
    entries: Arc<Mutex<HashMap<CacheKey, DecryptionAuthorization>>>,
}

impl DecryptionSignatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, DecryptionAuthorization>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an unexpired authorization for the exact key triple.
    /// Expired entries are evicted on the way out.
    pub fn get(
        &self,
        contract: &Address,
        chain_id: u64,
        signer: &Address,
    ) -> Option<DecryptionAuthorization> {
        let key = CacheKey {
            contract: contract.clone(),
            chain_id,
            signer: signer.clone(),
        };
        let mut entries = self.lock();
        match entries.get(&key) {
            Some(auth) if !auth.is_expired(Utc::now()) => Some(auth.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, authorization: DecryptionAuthorization) {
        let key = CacheKey {
            contract: authorization.contract.clone(),
            chain_id: authorization.chain_id,
            signer: authorization.signer.clone(),
        };
        self.lock().insert(key, authorization);
    }

    /// Drop every cached authorization. Called on detected chain or signer
    /// changes in addition to explicit invalidation.
    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Capability to sign decryption requests for the connected account.
#[async_trait]
pub trait WalletSigner: Send + Sync {
    fn address(&self) -> &Address;

    /// Produce the signature material for a decryption authorization bound
    /// to (contract, chain). May suspend on a user prompt.
    async fn sign_decryption_request(
        &self,
        contract: &Address,
        chain_id: u64,
    ) -> Result<SecretString, SignerError>;
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// In-process ECDSA signer over a secp256k1 key.
///
/// Stands in for a wallet in the demo binary and tests; production hosts
/// plug in their wallet adapter behind [`WalletSigner`] instead.
pub struct LocalSigner {
    key: SigningKey,
    address: Address,
}

impl LocalSigner {
    pub fn random() -> Self {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let address = Self::derive_address(&key);
        Self { key, address }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignerError> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|e| SignerError::Signing(format!("invalid signing key: {e}")))?;
        let address = Self::derive_address(&key);
        Ok(Self { key, address })
    }

    fn derive_address(key: &SigningKey) -> Address {
        let encoded = key.verifying_key().to_encoded_point(false);
        let digest = Keccak256::digest(&encoded.as_bytes()[1..]);
        let mut tail = [0u8; 20];
        tail.copy_from_slice(&digest[12..]);
        Address::from_bytes(&tail)
    }
}

#[async_trait]
impl WalletSigner for LocalSigner {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn sign_decryption_request(
        &self,
        contract: &Address,
        chain_id: u64,
    ) -> Result<SecretString, SignerError> {
        let message = format!(
            "computeveil/user-decrypt\ncontract: {contract}\nchain: {chain_id}\nsigner: {}",
            self.address
        );
        let digest = Keccak256::digest(message.as_bytes());
        let signature: Signature = self.key.sign(digest.as_slice());
        Ok(SecretString::from(encode_hex(
            signature.to_bytes().as_slice(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn addr(tail: u8) -> Address {
        Address::parse(&format!("0x{}{:02x}", "0".repeat(38), tail)).expect("valid test address")
    }

    fn authorization(
        contract: Address,
        chain_id: u64,
        signer: Address,
        ttl: Duration,
    ) -> DecryptionAuthorization {
        let now = Utc::now();
        DecryptionAuthorization {
            contract,
            chain_id,
            signer,
            signature: SecretString::from("0xdeadbeef"),
            issued_at: now,
            expires_at: now + ttl,
        }
    }

    #[test]
    fn get_only_matches_the_exact_triple() {
        let cache = DecryptionSignatureCache::new();
        cache.put(authorization(addr(1), 31337, addr(2), Duration::minutes(10)));

        assert!(cache.get(&addr(1), 31337, &addr(2)).is_some());
        assert!(cache.get(&addr(1), 31337, &addr(3)).is_none());
        assert!(cache.get(&addr(1), 11155111, &addr(2)).is_none());
        assert!(cache.get(&addr(9), 31337, &addr(2)).is_none());
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = DecryptionSignatureCache::new();
        cache.put(authorization(addr(1), 31337, addr(2), Duration::seconds(-1)));

        assert!(cache.get(&addr(1), 31337, &addr(2)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let cache = DecryptionSignatureCache::new();
        cache.put(authorization(addr(1), 31337, addr(2), Duration::minutes(10)));
        cache.put(authorization(addr(1), 31337, addr(3), Duration::minutes(10)));
        assert_eq!(cache.len(), 2);

        cache.invalidate_all();
        assert!(cache.get(&addr(1), 31337, &addr(2)).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn local_signer_produces_deterministic_material() {
        let signer = LocalSigner::from_bytes(&[7u8; 32]).expect("valid key");
        let contract = addr(1);

        let first = signer
            .sign_decryption_request(&contract, 31337)
            .await
            .expect("signs");
        let second = signer
            .sign_decryption_request(&contract, 31337)
            .await
            .expect("signs");

        // secp256k1 signing over the same digest with the same key is stable
        // (RFC 6979 deterministic nonces).
        assert_eq!(first.expose_secret(), second.expose_secret());
        assert!(first.expose_secret().starts_with("0x"));
        assert_eq!(first.expose_secret().len(), 2 + 128);
    }

    #[test]
    fn derived_address_is_stable_for_a_key() {
        let a = LocalSigner::from_bytes(&[9u8; 32]).expect("valid key");
        let b = LocalSigner::from_bytes(&[9u8; 32]).expect("valid key");
        assert_eq!(a.address(), b.address());
    }
}
