//! # Client Configuration
//!
//! TOML configuration for the GlucoseCheck client. Every section has defaults, so an
//! empty (or missing) file describes a local Hardhat devnet with devnet account 0.
//!
//! ```toml
//! [network]
//! name = "hardhat"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 2000
//!
//! [[deployments]]
//! chain_id = 31337
//! chain_name = "hardhat"
//! address = "0x..."
//! ```
//!
//! Environment variables override the file:
//! `GLUCOSE_CHECK_NETWORK`, `GLUCOSE_CHECK_RPC_URL`, `GLUCOSE_CHECK_CONTRACT`,
//! `GLUCOSE_CHECK_PRIVATE_KEY`, `GLUCOSE_CHECK_LOG`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::blockchain::deployments::{Deployment, Deployments};
use crate::blockchain::wallet::LocalWallet;
use crate::coordinator::{CoordinatorOptions, RetryPolicy};
use crate::types::{Address, ChainId, GlucoseCheckError, GlucoseCheckResult, LOCAL_CHAIN_ID, SEPOLIA_CHAIN_ID};

pub const ENV_NETWORK: &str = "GLUCOSE_CHECK_NETWORK";
pub const ENV_RPC_URL: &str = "GLUCOSE_CHECK_RPC_URL";
pub const ENV_CONTRACT: &str = "GLUCOSE_CHECK_CONTRACT";
pub const ENV_PRIVATE_KEY: &str = "GLUCOSE_CHECK_PRIVATE_KEY";
pub const ENV_LOG: &str = "GLUCOSE_CHECK_LOG";

/// Upper bounds for the retry section
pub const MAX_RETRY_ATTEMPTS: u32 = 20;
pub const MAX_RETRY_BASE_DELAY_MS: u64 = 60_000;

/// Known networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkName {
    #[default]
    Hardhat,
    Anvil,
    Sepolia,
    Custom,
}

impl NetworkName {
    pub fn default_chain_id(&self) -> ChainId {
        match self {
            NetworkName::Hardhat | NetworkName::Anvil | NetworkName::Custom => LOCAL_CHAIN_ID,
            NetworkName::Sepolia => SEPOLIA_CHAIN_ID,
        }
    }

    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            NetworkName::Hardhat | NetworkName::Anvil | NetworkName::Custom => "http://localhost:8545",
            NetworkName::Sepolia => "https://ethereum-sepolia-rpc.publicnode.com",
        }
    }

    /// Networks served by the in-process devnet
    pub fn is_local(&self) -> bool {
        matches!(self, NetworkName::Hardhat | NetworkName::Anvil)
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkName::Hardhat => "hardhat",
            NetworkName::Anvil => "anvil",
            NetworkName::Sepolia => "sepolia",
            NetworkName::Custom => "custom",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for NetworkName {
    type Err = GlucoseCheckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hardhat" | "localhost" => Ok(NetworkName::Hardhat),
            "anvil" => Ok(NetworkName::Anvil),
            "sepolia" => Ok(NetworkName::Sepolia),
            "custom" => Ok(NetworkName::Custom),
            other => Err(GlucoseCheckError::Config(format!("unknown network '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub name: NetworkName,
    /// Defaults to the network's well-known chain id
    pub chain_id: Option<ChainId>,
    pub rpc_url: Option<String>,
    /// Devnet chain state, shared between CLI invocations
    pub state_file: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            name: NetworkName::Hardhat,
            chain_id: None,
            rpc_url: None,
            state_file: PathBuf::from(".glucose-check/devnet.json"),
        }
    }
}

impl NetworkConfig {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id.unwrap_or_else(|| self.name.default_chain_id())
    }

    pub fn rpc_url(&self) -> &str {
        self.rpc_url.as_deref().unwrap_or_else(|| self.name.default_rpc_url())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// Explicit contract address, bypassing the deployments book
    pub address: Option<Address>,
    /// JSON deployments book written by `deploy`
    pub deployments_file: PathBuf,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            address: None,
            deployments_file: PathBuf::from(".glucose-check/deployments.json"),
        }
    }
}

/// Inline `[[deployments]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub chain_id: ChainId,
    #[serde(default)]
    pub chain_name: Option<String>,
    pub address: Address,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Hex secret key; takes precedence over `account_index`
    pub private_key: Option<String>,
    /// Deterministic devnet account used when no key is given
    pub account_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub apply_to_risk_check: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            apply_to_risk_check: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptionConfig {
    /// Validity of a signed decryption authorization
    pub duration_days: u32,
    /// Cache of signed authorizations
    pub storage_file: PathBuf,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self {
            duration_days: 365,
            storage_file: PathBuf::from(".glucose-check/signatures.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub network: NetworkConfig,
    pub contract: ContractConfig,
    pub deployments: Vec<DeploymentConfig>,
    pub wallet: WalletConfig,
    pub retry: RetryConfig,
    pub poller: PollerConfig,
    pub decryption: DecryptionConfig,
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load `path` if it exists, apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_toml(&content).with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            debug!("Config file {} not found, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> GlucoseCheckResult<()> {
        if let Some(network) = lookup(ENV_NETWORK) {
            self.network.name = network.parse()?;
            self.network.chain_id = None;
        }
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.network.rpc_url = Some(url);
        }
        if let Some(contract) = lookup(ENV_CONTRACT) {
            self.contract.address = Some(contract.parse()?);
        }
        if let Some(key) = lookup(ENV_PRIVATE_KEY) {
            self.wallet.private_key = Some(key);
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> GlucoseCheckResult<()> {
        url::Url::parse(self.network.rpc_url())
            .map_err(|e| GlucoseCheckError::Config(format!("invalid rpc_url '{}': {}", self.network.rpc_url(), e)))?;

        if self.retry.max_attempts == 0 || self.retry.max_attempts > MAX_RETRY_ATTEMPTS {
            return Err(GlucoseCheckError::Config(format!(
                "retry.max_attempts must be between 1 and {}",
                MAX_RETRY_ATTEMPTS
            )));
        }
        if self.retry.base_delay_ms > MAX_RETRY_BASE_DELAY_MS {
            return Err(GlucoseCheckError::Config(format!(
                "retry.base_delay_ms must be at most {}",
                MAX_RETRY_BASE_DELAY_MS
            )));
        }
        if self.poller.interval_secs == 0 {
            return Err(GlucoseCheckError::Config("poller.interval_secs must be at least 1".to_string()));
        }
        if self.decryption.duration_days == 0 {
            return Err(GlucoseCheckError::Config("decryption.duration_days must be at least 1".to_string()));
        }
        if self.contract.address.is_some_and(|a| a.is_zero()) {
            return Err(GlucoseCheckError::Config("contract.address must not be the zero address".to_string()));
        }
        Ok(())
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            retry: RetryPolicy::new(
                self.retry.max_attempts,
                Duration::from_millis(self.retry.base_delay_ms),
            ),
            retry_risk_check: self.retry.apply_to_risk_check,
            decryption_duration_days: self.decryption.duration_days,
            poll_interval: Duration::from_secs(self.poller.interval_secs),
        }
    }

    /// Deployments file merged with inline `[[deployments]]` (inline entries win)
    pub fn deployments(&self) -> GlucoseCheckResult<Deployments> {
        let mut deployments = Deployments::load(&self.contract.deployments_file)?;
        for entry in &self.deployments {
            deployments.insert(Deployment {
                address: entry.address,
                chain_id: entry.chain_id,
                chain_name: entry.chain_name.clone(),
            });
        }
        Ok(deployments)
    }

    pub fn wallet(&self) -> GlucoseCheckResult<LocalWallet> {
        match &self.wallet.private_key {
            Some(key) => LocalWallet::from_hex(key),
            None => {
                if !self.network.name.is_local() {
                    warn!("No private key configured for {}; using devnet account {}", self.network.name, self.wallet.account_index);
                }
                Ok(LocalWallet::devnet_account(self.wallet.account_index))
            }
        }
    }
}
