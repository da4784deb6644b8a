//! Typed identifiers and the counter contract interface.
//!
//! The on-chain contract's internal accounting is out of scope; the
//! controller only sees the small read/write surface below. Implementations
//! translate their transport's failures into [`ContractError`] so the
//! retry policy can tell transient conditions from contract rejections.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ContractError;

/// Validation failure for hex identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0} must be a 0x-prefixed {1}-char lowercase hex value")]
pub struct InvalidIdentifier(&'static str, usize);

fn check_hex(field: &'static str, value: &str, digits: usize) -> Result<(), InvalidIdentifier> {
    let hex = value
        .strip_prefix("0x")
        .ok_or(InvalidIdentifier(field, digits))?;
    if hex.len() != digits
        || !hex
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
    {
        return Err(InvalidIdentifier(field, digits));
    }
    Ok(())
}

/// An account or contract address (0x + 40 hex chars, lowercase).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn parse(value: &str) -> Result<Self, InvalidIdentifier> {
        let normalized = value.trim().to_ascii_lowercase();
        check_hex("address", &normalized, 40)?;
        Ok(Self(normalized))
    }

    /// Build an address from raw bytes (the low 20 bytes of a hash).
    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for byte in bytes {
            out.push_str(&format!("{byte:02x}"));
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier referencing an encrypted value stored on-chain
/// (0x + 64 hex chars). The all-zero handle marks an uninitialized counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedHandle(String);

impl EncryptedHandle {
    pub fn parse(value: &str) -> Result<Self, InvalidIdentifier> {
        let normalized = value.trim().to_ascii_lowercase();
        check_hex("handle", &normalized, 64)?;
        Ok(Self(normalized))
    }

    /// The uninitialized (all-zero) handle.
    pub fn zero() -> Self {
        Self(format!("0x{}", "0".repeat(64)))
    }

    pub fn is_zero(&self) -> bool {
        self.0[2..].bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EncryptedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction hash (0x + 64 hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A ciphertext input produced by the FHE runtime, bound to a
/// (contract, user) pair so it cannot be replayed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedInput {
    pub handle: EncryptedHandle,
    pub proof: String,
}

/// A submitted but not yet confirmed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub tx_hash: TxHash,
    pub submitted_at: DateTime<Utc>,
}

/// Receipt for a transaction with one confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub confirmed_at: DateTime<Utc>,
}

/// Read/write surface of the ComputeVeil counter contract.
#[async_trait]
pub trait CounterContract: Send + Sync {
    fn address(&self) -> &Address;

    fn chain_id(&self) -> u64;

    /// Current encrypted counter handle.
    async fn get_count(&self) -> Result<EncryptedHandle, ContractError>;

    /// Submit an encrypted increment. Returns the pending transaction;
    /// callers await [`CounterContract::confirm`] for the receipt.
    async fn increment(
        &self,
        input: &EncryptedInput,
        from: &Address,
    ) -> Result<PendingTransaction, ContractError>;

    /// Submit an encrypted decrement.
    async fn decrement(
        &self,
        input: &EncryptedInput,
        from: &Address,
    ) -> Result<PendingTransaction, ContractError>;

    /// Wait for one confirmation of a previously submitted transaction.
    async fn confirm(&self, tx: &TxHash) -> Result<TxReceipt, ContractError>;

    async fn is_paused(&self) -> Result<bool, ContractError>;

    /// Display-only ACL read; never gates an operation.
    async fn has_permission(&self, user: &Address) -> Result<bool, ContractError>;
}

/// Resolves the contract bound to a chain id, if one is deployed there.
pub trait ContractDirectory: Send + Sync {
    fn resolve(&self, chain_id: u64) -> Option<Arc<dyn CounterContract>>;
}

/// Fixed directory over pre-built contract clients, keyed by chain id.
#[derive(Default)]
pub struct StaticContractDirectory {
    contracts: HashMap<u64, Arc<dyn CounterContract>>,
}

impl StaticContractDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, contract: Arc<dyn CounterContract>) {
        self.contracts.insert(contract.chain_id(), contract);
    }

    pub fn with(mut self, contract: Arc<dyn CounterContract>) -> Self {
        self.insert(contract);
        self
    }
}

impl ContractDirectory for StaticContractDirectory {
    fn resolve(&self, chain_id: u64) -> Option<Arc<dyn CounterContract>> {
        self.contracts.get(&chain_id).cloned()
    }
}
