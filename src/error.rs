//! Error types for the ComputeVeil client.

use serde::Serialize;

/// Top-level error type for the workflow controller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("Contract error: {0}")]
    Contract(#[from] ContractError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Stale operation: {0}")]
    Stale(#[from] StalenessError),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections raised before any network interaction. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("no wallet is connected")]
    NotConnected,

    #[error("no active network")]
    NoNetwork,

    #[error("counter contract is not deployed on chain {chain_id}")]
    NotDeployed { chain_id: u64 },

    #[error("FHE runtime is not ready ({status})")]
    RuntimeNotReady { status: String },

    #[error("another operation is already in progress")]
    Busy,

    #[error("delta {delta} exceeds the maximum increment of {max}")]
    DeltaTooLarge { delta: i64, max: i64 },

    #[error("delta {delta} exceeds the maximum rollback of {min}")]
    DeltaTooSmall { delta: i64, min: i64 },

    #[error("nothing to decrypt: the counter handle is unset")]
    NothingToDecrypt,
}

/// Errors returned by the counter contract interface.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("contract is paused")]
    Paused,

    #[error("caller is not the contract owner")]
    NotOwner,

    #[error("contract is not deployed on chain {chain_id}")]
    NotDeployed { chain_id: u64 },

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("transaction {tx_hash} not confirmed within {timeout_ms} ms")]
    ConfirmationTimeout { tx_hash: String, timeout_ms: u64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid ciphertext input: {0}")]
    InvalidInput(String),
}

impl ContractError {
    /// Transient failures are worth retrying; contract-level rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConfirmationTimeout { .. })
    }
}

/// Errors from the FHE runtime and its bootstrapper.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("bootstrap for chain {chain_id} was superseded")]
    Superseded { chain_id: u64 },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("authorization rejected: {0}")]
    AuthorizationRejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors raised while producing a signed decryption authorization.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signature request rejected by the wallet")]
    Rejected,

    #[error("signing failed: {0}")]
    Signing(String),
}

/// The network or signer moved while an operation was suspended; the result
/// was discarded instead of being surfaced under the wrong identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StalenessError {
    #[error("network changed while the operation was in flight")]
    NetworkChanged,

    #[error("signer changed while the operation was in flight")]
    SignerChanged,
}

/// Failure domain for status/activity consumers.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureDomain {
    Precondition,
    Contract,
    Transport,
    Runtime,
    Signer,
    Stale,
    Unknown,
}

/// Structured failure payload surfaced alongside `OperationState::Failed`.
///
/// The activity log and state observers transport free-form strings; this
/// envelope gives them a stable, parseable shape for incident handling.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailurePayload {
    pub domain: FailureDomain,
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl FailurePayload {
    fn new(
        domain: FailureDomain,
        code: &'static str,
        retryable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            code,
            retryable,
            message: message.into(),
        }
    }
}

impl Error {
    /// Whether the failure is a transient network condition worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Contract(err) => err.is_transient(),
            Self::Runtime(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Map errors into a structured surface for status/activity consumers.
    pub fn to_failure_payload(&self) -> FailurePayload {
        match self {
            Self::Precondition(err) => {
                let code = match err {
                    PreconditionError::NotConnected => "precondition.not_connected",
                    PreconditionError::NoNetwork => "precondition.no_network",
                    PreconditionError::NotDeployed { .. } => "precondition.not_deployed",
                    PreconditionError::RuntimeNotReady { .. } => "precondition.runtime_not_ready",
                    PreconditionError::Busy => "precondition.busy",
                    PreconditionError::DeltaTooLarge { .. } => "precondition.delta_too_large",
                    PreconditionError::DeltaTooSmall { .. } => "precondition.delta_too_small",
                    PreconditionError::NothingToDecrypt => "precondition.nothing_to_decrypt",
                };
                FailurePayload::new(FailureDomain::Precondition, code, false, err.to_string())
            }
            Self::Contract(err) => match err {
                ContractError::Paused => FailurePayload::new(
                    FailureDomain::Contract,
                    "contract.paused",
                    false,
                    err.to_string(),
                ),
                ContractError::NotOwner => FailurePayload::new(
                    FailureDomain::Contract,
                    "contract.not_owner",
                    false,
                    err.to_string(),
                ),
                ContractError::NotDeployed { .. } => FailurePayload::new(
                    FailureDomain::Contract,
                    "contract.not_deployed",
                    false,
                    err.to_string(),
                ),
                ContractError::Reverted(_) | ContractError::InvalidInput(_) => FailurePayload::new(
                    FailureDomain::Contract,
                    "contract.reverted",
                    false,
                    err.to_string(),
                ),
                ContractError::ConfirmationTimeout { .. } => FailurePayload::new(
                    FailureDomain::Transport,
                    "transport.confirmation_timeout",
                    true,
                    err.to_string(),
                ),
                ContractError::Transport(_) => FailurePayload::new(
                    FailureDomain::Transport,
                    "transport.contract_call_failed",
                    true,
                    err.to_string(),
                ),
            },
            Self::Runtime(err) => match err {
                RuntimeError::Transport(_) => FailurePayload::new(
                    FailureDomain::Transport,
                    "transport.runtime_call_failed",
                    true,
                    err.to_string(),
                ),
                RuntimeError::Superseded { .. } => FailurePayload::new(
                    FailureDomain::Runtime,
                    "runtime.bootstrap_superseded",
                    false,
                    err.to_string(),
                ),
                RuntimeError::Bootstrap(_) => FailurePayload::new(
                    FailureDomain::Runtime,
                    "runtime.bootstrap_failed",
                    false,
                    err.to_string(),
                ),
                RuntimeError::AuthorizationRejected(_) => FailurePayload::new(
                    FailureDomain::Runtime,
                    "runtime.authorization_rejected",
                    false,
                    err.to_string(),
                ),
                RuntimeError::Encryption(_) | RuntimeError::Decryption(_) => FailurePayload::new(
                    FailureDomain::Runtime,
                    "runtime.operation_failed",
                    false,
                    err.to_string(),
                ),
            },
            Self::Signer(err) => FailurePayload::new(
                FailureDomain::Signer,
                match err {
                    SignerError::Rejected => "signer.rejected",
                    SignerError::Signing(_) => "signer.failed",
                },
                false,
                err.to_string(),
            ),
            Self::Stale(err) => FailurePayload::new(
                FailureDomain::Stale,
                match err {
                    StalenessError::NetworkChanged => "stale.network_changed",
                    StalenessError::SignerChanged => "stale.signer_changed",
                },
                false,
                err.to_string(),
            ),
            Self::RetriesExhausted { .. } => FailurePayload::new(
                FailureDomain::Transport,
                "transport.retries_exhausted",
                false,
                self.to_string(),
            ),
            Self::Config(err) => FailurePayload::new(
                FailureDomain::Unknown,
                "config.invalid",
                false,
                err.to_string(),
            ),
        }
    }
}

/// Result type alias for the client.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_covers_transport_paths() {
        assert!(Error::from(ContractError::Transport("reset".into())).is_transient());
        assert!(
            Error::from(ContractError::ConfirmationTimeout {
                tx_hash: "0xabc".into(),
                timeout_ms: 30_000,
            })
            .is_transient()
        );
        assert!(Error::from(RuntimeError::Transport("timeout".into())).is_transient());

        assert!(!Error::from(ContractError::Paused).is_transient());
        assert!(!Error::from(PreconditionError::Busy).is_transient());
        assert!(!Error::from(StalenessError::SignerChanged).is_transient());
    }

    #[test]
    fn maps_precondition_failures() {
        let err = Error::from(PreconditionError::DeltaTooLarge { delta: 25, max: 20 });
        let payload = err.to_failure_payload();

        assert_eq!(payload.domain, FailureDomain::Precondition);
        assert_eq!(payload.code, "precondition.delta_too_large");
        assert!(!payload.retryable);
    }

    #[test]
    fn maps_contract_rejections_as_non_retryable() {
        let payload = Error::from(ContractError::Paused).to_failure_payload();

        assert_eq!(payload.domain, FailureDomain::Contract);
        assert_eq!(payload.code, "contract.paused");
        assert!(!payload.retryable);
    }

    #[test]
    fn retries_exhausted_wraps_the_last_error() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            last: Box::new(Error::from(ContractError::Transport("dropped".into()))),
        };

        assert!(err.to_string().contains("retries exhausted"));
        assert!(err.to_string().contains("dropped"));
        assert_eq!(err.to_failure_payload().code, "transport.retries_exhausted");
    }
}
