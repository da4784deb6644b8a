//! Client-side workflow controller for the ComputeVeil encrypted counter.
//!
//! The controller coordinates encrypted-compute operations against a ledger
//! contract holding a homomorphically-encrypted counter: it encrypts deltas
//! locally, submits them as authenticated transactions, tracks the
//! resulting encrypted handle, and decrypts on demand with a reusable
//! signed authorization, staying consistent across network and account
//! switches.

pub mod activity;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod contract;
pub mod controller;
pub mod error;
pub mod identity;
pub mod runtime;
pub mod signature;
pub mod sim;

pub use activity::{ActivityEntry, ActivityKind, ActivityLog};
pub use config::{Config, DeploymentRegistry, RelayerConfig, WorkflowConfig};
pub use contract::{
    Address, ContractDirectory, CounterContract, EncryptedHandle, EncryptedInput,
    StaticContractDirectory, TxReceipt,
};
pub use controller::{
    ClearState, ClearValue, ControllerSnapshot, CounterOp, EncryptedCounterController,
    OperationState,
};
pub use error::{Error, FailurePayload, PreconditionError, Result, StalenessError};
pub use identity::{ChainSignerIdentity, NetworkSnapshot, SignerSnapshot};
pub use runtime::{FheRuntime, FheRuntimeBootstrapper, RuntimeProvider, RuntimeStatus};
pub use signature::{
    DecryptionAuthorization, DecryptionSignatureCache, LocalSigner, WalletSigner,
};
