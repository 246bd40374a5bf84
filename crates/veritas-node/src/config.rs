//! Node configuration, read from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use veritas_core::{Address, NodeKey};
use veritas_state::RetryPolicy;

pub const DEFAULT_RPC_URL: &str = "https://evmrpc-testnet.0g.ai";
pub const DEFAULT_MODEL: &str = "llama3-8b-8192";
pub const DEFAULT_PROVIDER_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_INDEXER_URL: &str = "https://indexer-storage-testnet.0g.ai";
pub const DEFAULT_FLOW_CONTRACT: &str = "0x22E03a6A89B950F1c82ec5e74F8eCa321a105296";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Everything the worker needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_key: NodeKey,
    pub contract_address: Address,
    pub rpc_url: String,

    pub provider_api_key: String,
    pub provider_base_url: String,
    pub default_model: String,

    pub indexer_url: String,
    pub flow_contract_address: Address,

    pub http_port: u16,

    pub reconcile_interval: Duration,
    pub event_poll_interval: Duration,
    /// Blocks to look back for events on the first live poll.
    pub event_lookback_blocks: u64,
    /// Largest block range asked for in one `eth_getLogs`.
    pub max_log_range: u64,

    pub worker_concurrency: usize,
    pub queue_capacity: usize,

    pub encryption_enabled: bool,
    pub verify_prompt_hash: bool,
    pub state_dir: Option<PathBuf>,

    pub registry_wait: Duration,
    pub registry_wait_attempts: u32,

    pub provider_timeout: Duration,
    pub storage_timeout: Duration,
    pub ledger_timeout: Duration,

    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl NodeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let node_key = NodeKey::from_hex(&required("PRIVATE_KEY")?).map_err(|e| {
            ConfigError::Invalid {
                name: "PRIVATE_KEY",
                reason: e.to_string(),
            }
        })?;
        let contract_address = parse_address("CONTRACT_ADDRESS", &required("CONTRACT_ADDRESS")?)?;
        let provider_api_key = required("GROQ_API_KEY")?;

        let flow_contract_address = parse_address(
            "FLOW_CONTRACT_ADDRESS",
            &get("FLOW_CONTRACT_ADDRESS").unwrap_or_else(|| DEFAULT_FLOW_CONTRACT.to_string()),
        )?;

        let config = Self {
            node_key,
            contract_address,
            rpc_url: get("RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            provider_api_key,
            provider_base_url: get("GROQ_BASE_URL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string()),
            default_model: get("GROQ_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            indexer_url: get("INDEXER_URL").unwrap_or_else(|| DEFAULT_INDEXER_URL.to_string()),
            flow_contract_address,
            http_port: parse_or(&get, "WORKER_PORT", 3001)?,
            reconcile_interval: millis_or(&get, "POLL_INTERVAL_MS", 5_000)?,
            event_poll_interval: millis_or(&get, "EVENT_POLL_INTERVAL_MS", 2_000)?,
            event_lookback_blocks: parse_or(&get, "EVENT_LOOKBACK_BLOCKS", 0)?,
            max_log_range: parse_or(&get, "MAX_LOG_RANGE", 1_000)?,
            worker_concurrency: parse_or(&get, "WORKER_CONCURRENCY", 4)?,
            queue_capacity: parse_or(&get, "QUEUE_CAPACITY", 256)?,
            encryption_enabled: bool_or(&get, "ENCRYPTION_ENABLED", true)?,
            verify_prompt_hash: bool_or(&get, "VERIFY_PROMPT_HASH", false)?,
            state_dir: get("STATE_DIR").map(PathBuf::from),
            registry_wait: millis_or(&get, "REGISTRY_WAIT_MS", 500)?,
            registry_wait_attempts: parse_or(&get, "REGISTRY_WAIT_ATTEMPTS", 3)?,
            provider_timeout: millis_or(&get, "PROVIDER_TIMEOUT_MS", 60_000)?,
            storage_timeout: millis_or(&get, "STORAGE_TIMEOUT_MS", 30_000)?,
            ledger_timeout: millis_or(&get, "LEDGER_TIMEOUT_MS", 120_000)?,
            retry_base: millis_or(&get, "RETRY_BASE_MS", 1_000)?,
            retry_max: millis_or(&get, "RETRY_MAX_MS", 60_000)?,
        };

        Ok(config)
    }

    /// Reject values the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("POLL_INTERVAL_MS", self.reconcile_interval.is_zero()),
            ("EVENT_POLL_INTERVAL_MS", self.event_poll_interval.is_zero()),
            ("PROVIDER_TIMEOUT_MS", self.provider_timeout.is_zero()),
            ("STORAGE_TIMEOUT_MS", self.storage_timeout.is_zero()),
            ("LEDGER_TIMEOUT_MS", self.ledger_timeout.is_zero()),
            ("WORKER_CONCURRENCY", self.worker_concurrency == 0),
            ("QUEUE_CAPACITY", self.queue_capacity == 0),
            ("MAX_LOG_RANGE", self.max_log_range == 0),
        ];
        for (name, is_zero) in nonzero {
            if is_zero {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.retry_max < self.retry_base {
            return Err(ConfigError::Invalid {
                name: "RETRY_MAX_MS",
                reason: "must not be smaller than RETRY_BASE_MS".to_string(),
            });
        }

        for (name, url) in [
            ("RPC_URL", &self.rpc_url),
            ("GROQ_BASE_URL", &self.provider_base_url),
            ("INDEXER_URL", &self.indexer_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid {
                    name,
                    reason: format!("expected an http(s) URL, got {url}"),
                });
            }
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http_port))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.retry_base,
            max_delay: self.retry_max,
        }
    }
}

fn parse_address(name: &'static str, value: &str) -> Result<Address, ConfigError> {
    value.parse().map_err(|e: veritas_core::VeritasError| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn parse_or<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
    }
}

fn millis_or<G>(get: &G, name: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, name, default_ms).map(Duration::from_millis)
}

fn bool_or<G>(get: &G, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "1" || v == "true" || v == "yes" => Ok(true),
        Some(v) if v == "0" || v == "false" || v == "no" => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a boolean, got {v}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("PRIVATE_KEY", DEV_KEY),
            ("CONTRACT_ADDRESS", "0x915cc86fe0871835e750e93e025080fff9927a3f"),
            ("GROQ_API_KEY", "gsk_test"),
        ]
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::from_lookup(env(&required())).unwrap();
        config.validate().unwrap();

        assert_eq!(config.rpc_url, DEFAULT_RPC_URL);
        assert_eq!(config.default_model, DEFAULT_MODEL);
        assert_eq!(config.http_port, 3001);
        assert_eq!(config.reconcile_interval, Duration::from_millis(5_000));
        assert!(config.encryption_enabled);
        assert!(!config.verify_prompt_hash);
        assert!(config.state_dir.is_none());
        assert_eq!(
            config.node_key.address().to_checksum(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
        );
    }

    #[test]
    fn test_missing_required_is_fatal() {
        let mut vars = required();
        vars.retain(|(k, _)| *k != "GROQ_API_KEY");
        let err = NodeConfig::from_lookup(env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("GROQ_API_KEY")));
    }

    #[test]
    fn test_overrides_and_validation() {
        let mut vars = required();
        vars.push(("POLL_INTERVAL_MS", "250"));
        vars.push(("ENCRYPTION_ENABLED", "false"));
        vars.push(("STATE_DIR", "/var/lib/veritas"));
        let config = NodeConfig::from_lookup(env(&vars)).unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_millis(250));
        assert!(!config.encryption_enabled);
        assert_eq!(config.state_dir, Some(PathBuf::from("/var/lib/veritas")));

        let mut vars = required();
        vars.push(("WORKER_CONCURRENCY", "0"));
        let config = NodeConfig::from_lookup(env(&vars)).unwrap();
        assert!(config.validate().is_err());

        let mut vars = required();
        vars.push(("WORKER_PORT", "not-a-port"));
        assert!(NodeConfig::from_lookup(env(&vars)).is_err());
    }
}
