//! Configuration for the ComputeVeil client.
//!
//! Settings load with priority: env var > TOML config file > default. The
//! config file is `computeveil.toml` in the working directory, or whatever
//! `COMPUTEVEIL_CONFIG` points at. Delta bounds are constructor parameters
//! only; retry and authorization tuning is exposed through file and env.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::contract::Address;
use crate::error::ConfigError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_AUTHORIZATION_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_RELAYER_ENDPOINT: &str = "http://127.0.0.1:8547/";
pub const DEFAULT_RELAYER_TIMEOUT: Duration = Duration::from_secs(30);

/// Hardhat's deterministic first-deploy address on the local dev chain.
const LOCAL_DEV_DEPLOYMENT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
/// ComputeVeil deployment on Sepolia.
const SEPOLIA_DEPLOYMENT: &str = "0x9d2e1f804c0f5c1b2a9e6d4708c3b5f1e82d4a6b";

/// Main configuration for the client.
#[derive(Debug, Clone)]
pub struct Config {
    pub workflow: WorkflowConfig,
    pub relayer: RelayerConfig,
    pub deployments: DeploymentRegistry,
}

/// Tuning for the workflow controller.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Attempts per mutating operation before retries are exhausted.
    pub max_attempts: u32,
    /// Fixed delay between retry attempts.
    pub retry_backoff: Duration,
    /// How long a signed decryption authorization stays reusable.
    pub authorization_ttl: Duration,
    /// Most negative delta a single operation may apply.
    pub delta_min: i64,
    /// Largest delta a single operation may apply.
    pub delta_max: i64,
    /// Activity log retention.
    pub activity_capacity: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            authorization_ttl: DEFAULT_AUTHORIZATION_TTL,
            delta_min: -10,
            delta_max: 20,
            activity_capacity: crate::activity::DEFAULT_ACTIVITY_CAPACITY,
        }
    }
}

/// Relayer endpoint settings.
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub endpoint: String,
    pub timeout: Duration,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_RELAYER_ENDPOINT.to_string(),
            timeout: DEFAULT_RELAYER_TIMEOUT,
        }
    }
}

impl RelayerConfig {
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.endpoint).map_err(|e| ConfigError::InvalidValue {
            key: "relayer.endpoint".to_string(),
            message: e.to_string(),
        })
    }
}

/// Contract addresses keyed by chain id.
#[derive(Debug, Clone)]
pub struct DeploymentRegistry {
    addresses: HashMap<u64, Address>,
}

impl Default for DeploymentRegistry {
    fn default() -> Self {
        let mut addresses = HashMap::new();
        for (chain_id, address) in [(31337, LOCAL_DEV_DEPLOYMENT), (11155111, SEPOLIA_DEPLOYMENT)] {
            if let Ok(address) = Address::parse(address) {
                addresses.insert(chain_id, address);
            }
        }
        Self { addresses }
    }
}

impl DeploymentRegistry {
    pub fn empty() -> Self {
        Self {
            addresses: HashMap::new(),
        }
    }

    pub fn address_for(&self, chain_id: u64) -> Option<&Address> {
        self.addresses.get(&chain_id)
    }

    pub fn is_deployed(&self, chain_id: u64) -> bool {
        self.addresses.contains_key(&chain_id)
    }

    pub fn insert(&mut self, chain_id: u64, address: Address) {
        self.addresses.insert(chain_id, address);
    }

    pub fn with(mut self, chain_id: u64, address: Address) -> Self {
        self.insert(chain_id, address);
        self
    }

    pub fn chains(&self) -> impl Iterator<Item = (u64, &Address)> {
        self.addresses.iter().map(|(id, addr)| (*id, addr))
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    workflow: RawWorkflow,
    #[serde(default)]
    relayer: RawRelayer,
    #[serde(default)]
    deployments: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWorkflow {
    max_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    authorization_ttl_secs: Option<u64>,
    activity_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRelayer {
    endpoint: Option<String>,
    timeout_secs: Option<u64>,
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig::default(),
            relayer: RelayerConfig::default(),
            deployments: DeploymentRegistry::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (if present), then
    /// env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = Self::config_file_path() {
            let content = std::fs::read_to_string(&path)?;
            config.apply_toml(&content)?;
            tracing::debug!("loaded config from {}", path.display());
        }

        config.apply_env()?;
        Ok(config)
    }

    fn config_file_path() -> Option<PathBuf> {
        if let Some(explicit) = optional_env("COMPUTEVEIL_CONFIG") {
            return Some(PathBuf::from(explicit));
        }
        let default = Path::new("computeveil.toml");
        default.exists().then(|| default.to_path_buf())
    }

    /// Overlay values from a TOML document.
    pub fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(max_attempts) = raw.workflow.max_attempts {
            self.workflow.max_attempts = max_attempts.max(1);
        }
        if let Some(ms) = raw.workflow.retry_backoff_ms {
            self.workflow.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = raw.workflow.authorization_ttl_secs {
            self.workflow.authorization_ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = raw.workflow.activity_capacity {
            self.workflow.activity_capacity = capacity;
        }
        if let Some(endpoint) = raw.relayer.endpoint {
            self.relayer.endpoint = endpoint;
        }
        if let Some(secs) = raw.relayer.timeout_secs {
            self.relayer.timeout = Duration::from_secs(secs);
        }

        for (chain, address) in raw.deployments {
            let chain_id: u64 = chain.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: format!("deployments.{chain}"),
                message: "chain id must be an unsigned integer".to_string(),
            })?;
            let address = Address::parse(&address).map_err(|e| ConfigError::InvalidValue {
                key: format!("deployments.{chain}"),
                message: e.to_string(),
            })?;
            self.deployments.insert(chain_id, address);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(endpoint) = optional_env("COMPUTEVEIL_RELAYER_URL") {
            self.relayer.endpoint = endpoint;
        }
        if let Some(secs) = parse_env::<u64>("COMPUTEVEIL_RELAYER_TIMEOUT_SECS")? {
            self.relayer.timeout = Duration::from_secs(secs);
        }
        if let Some(max_attempts) = parse_env::<u32>("COMPUTEVEIL_MAX_ATTEMPTS")? {
            self.workflow.max_attempts = max_attempts.max(1);
        }
        if let Some(ms) = parse_env::<u64>("COMPUTEVEIL_RETRY_BACKOFF_MS")? {
            self.workflow.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env::<u64>("COMPUTEVEIL_AUTHORIZATION_TTL_SECS")? {
            self.workflow.authorization_ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_env::<usize>("COMPUTEVEIL_ACTIVITY_CAPACITY")? {
            self.workflow.activity_capacity = capacity;
        }
        Ok(())
    }
}
