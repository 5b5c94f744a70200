//! Cluster configuration via `tessera.toml`
//!
//! Both the client-side transaction layer and the server-side lock manager
//! read their knobs from one file. On first start a default `tessera.toml` is
//! written; edit it and restart to change settings.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name placed in the node's data directory.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Which server lock behaviour to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Grant uncontended locks to the whole client node and recall on demand
    Greedy,
    /// Grant every lock to the requesting thread only
    NonGreedy,
}

/// `[locks]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockConfig {
    /// Lock behaviour: `"greedy"` (default) or `"non_greedy"`
    #[serde(default = "default_policy")]
    pub policy: LockPolicy,
}

fn default_policy() -> LockPolicy {
    LockPolicy::Greedy
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
        }
    }
}

/// `[transactions]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionConfig {
    /// Batches allowed in flight before new commits accumulate in the open
    /// batch (default: 1)
    #[serde(default = "default_max_outstanding_batches")]
    pub max_outstanding_batches: usize,
    /// Transactions per batch before it is sent regardless (default: 128)
    #[serde(default = "default_max_batch_transactions")]
    pub max_batch_transactions: usize,
    /// Encoded bytes per batch before it is sent regardless (default: 128 KiB)
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    /// Incomplete transactions allowed before commit blocks; 0 = unbounded
    #[serde(default)]
    pub max_pending_transactions: usize,
    /// How often blocking waits re-check their abort token, in milliseconds
    #[serde(default = "default_abort_poll_interval_ms")]
    pub abort_poll_interval_ms: u64,
}

fn default_max_outstanding_batches() -> usize {
    1
}

fn default_max_batch_transactions() -> usize {
    128
}

fn default_max_batch_bytes() -> usize {
    128 * 1024
}

fn default_abort_poll_interval_ms() -> u64 {
    25
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_outstanding_batches: default_max_outstanding_batches(),
            max_batch_transactions: default_max_batch_transactions(),
            max_batch_bytes: default_max_batch_bytes(),
            max_pending_transactions: 0,
            abort_poll_interval_ms: default_abort_poll_interval_ms(),
        }
    }
}

impl TransactionConfig {
    /// Poll interval as a `Duration`
    pub fn abort_poll_interval(&self) -> Duration {
        Duration::from_millis(self.abort_poll_interval_ms.max(1))
    }
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ServerConfig {
    /// Stripe this server orders transactions for
    #[serde(default)]
    pub stripe: u32,
}

/// Configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// [locks]
/// policy = "greedy"
///
/// [transactions]
/// max_outstanding_batches = 1
/// max_batch_transactions = 128
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TesseraConfig {
    /// Lock manager settings
    #[serde(default)]
    pub locks: LockConfig,
    /// Client transaction and batching settings
    #[serde(default)]
    pub transactions: TransactionConfig,
    /// Server ordering settings
    #[serde(default)]
    pub server: ServerConfig,
}

impl TesseraConfig {
    /// Check values that parse but cannot work.
    ///
    /// # Errors
    ///
    /// Returns an error if a batching limit is zero.
    pub fn validate(&self) -> Result<()> {
        if self.transactions.max_outstanding_batches == 0 {
            return Err(TesseraError::config(
                "transactions.max_outstanding_batches must be at least 1",
            ));
        }
        if self.transactions.max_batch_transactions == 0 {
            return Err(TesseraError::config(
                "transactions.max_batch_transactions must be at least 1",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera configuration

[locks]
# Lock behaviour: "greedy" (default) or "non_greedy"
#   "greedy"     = uncontended locks are granted to the whole client node and
#                  recalled when another node needs them
#   "non_greedy" = every grant goes to the requesting thread only
policy = "greedy"

[transactions]
# Batches in flight before new commits accumulate in the open batch
max_outstanding_batches = 1
# A batch is sent once it holds this many transactions...
max_batch_transactions = 128
# ...or this many encoded bytes
max_batch_bytes = 131072
# Incomplete transactions allowed before commit blocks (0 = unbounded)
max_pending_transactions = 0
# How often blocking waits re-check their abort token
abort_poll_interval_ms = 25

[server]
# Stripe this server orders transactions for
stripe = 0
"#
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TesseraConfig = toml::from_str(content)
            .map_err(|e| TesseraError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TesseraError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml_str(&content).map_err(|e| match e {
            TesseraError::Config(msg) => {
                TesseraError::config(format!("{} (in '{}')", msg, path.display()))
            }
            other => other,
        })?;
        tracing::info!(
            target: "tessera::config",
            path = %path.display(),
            policy = ?config.locks.policy,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                TesseraError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TesseraError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            TesseraError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
