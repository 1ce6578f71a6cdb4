//! Application configuration loaded from environment variables.

use crate::errors::{CoordinatorError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Port for the REST API server
    pub api_port: u16,
    /// SQLite database holding the chain receipt log
    pub database_url: String,
    /// EVM JSON-RPC endpoint (e.g. https://testnet.hashio.io/api)
    pub rpc_url: String,
    /// EIP-155 chain id used when signing transactions
    pub chain_id: u64,
    /// Deployed AgentStaking contract address (0x-prefixed)
    pub contract_address: Option<String>,
    /// Hex-encoded secp256k1 key of the operator account
    pub operator_private_key: Option<String>,
    /// Gas limit attached to every contract transaction
    pub gas_limit: u64,
    /// Delay between two `eth_getTransactionReceipt` polls
    pub receipt_poll_ms: u64,
    /// Number of receipt polls before a transaction is reported as unconfirmed
    pub receipt_max_polls: u32,
    /// Block explorer prefix used to build `hashscanUrl`
    pub explorer_tx_url: String,
    /// Base URL of the external negotiation agent service
    pub agent_service_url: Option<String>,
    /// Participants needed before a pool counts as ready
    pub ready_threshold: usize,
    /// Upper bound for the negotiated stake percentage
    pub max_stake_percent: u32,
    /// USD price of one HBAR
    pub usd_per_hbar: f64,
    /// Timeout applied to every outbound HTTP request
    pub http_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            api_port: parse_or("API_PORT", "3001")?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./wanderlink_receipts.db".to_string()),
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "https://testnet.hashio.io/api".to_string()),
            chain_id: parse_or("CHAIN_ID", "296")?,
            contract_address: env_var("CONTRACT_ADDRESS").ok(),
            operator_private_key: env_var("OPERATOR_PRIVATE_KEY").ok(),
            gas_limit: parse_or("GAS_LIMIT", "1000000")?,
            receipt_poll_ms: parse_or("RECEIPT_POLL_MS", "1000")?,
            receipt_max_polls: parse_or("RECEIPT_MAX_POLLS", "60")?,
            explorer_tx_url: env_var("EXPLORER_TX_URL")
                .unwrap_or_else(|_| "https://hashscan.io/testnet/transaction".to_string()),
            agent_service_url: env_var("AGENT_SERVICE_URL").ok(),
            ready_threshold: parse_or("READY_THRESHOLD", "3")?,
            max_stake_percent: parse_or("MAX_STAKE_PERCENT", "6")?,
            usd_per_hbar: parse_or("USD_PER_HBAR", "0.05")?,
            http_timeout_secs: parse_or("HTTP_TIMEOUT_SECS", "30")?,
        })
    }

    /// Explorer link for a transaction hash.
    pub fn explorer_url(&self, tx_hash: &str) -> String {
        format!("{}/{tx_hash}", self.explorer_tx_url.trim_end_matches('/'))
    }

    /// Both the contract address and the operator key are needed for chain access.
    pub fn chain_credentials(&self) -> Option<(&str, &str)> {
        match (&self.contract_address, &self.operator_private_key) {
            (Some(contract), Some(key)) => Some((contract.as_str(), key.as_str())),
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_port: 3001,
            database_url: "sqlite::memory:".to_string(),
            rpc_url: "https://testnet.hashio.io/api".to_string(),
            chain_id: 296,
            contract_address: None,
            operator_private_key: None,
            gas_limit: 1_000_000,
            receipt_poll_ms: 1000,
            receipt_max_polls: 60,
            explorer_tx_url: "https://hashscan.io/testnet/transaction".to_string(),
            agent_service_url: None,
            ready_threshold: 3,
            max_stake_percent: 6,
            usd_per_hbar: 0.05,
            http_timeout_secs: 30,
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| CoordinatorError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| CoordinatorError::Config(format!("Invalid {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explorer_url_joins_without_double_slash() {
        let config = Config {
            explorer_tx_url: "https://hashscan.io/testnet/transaction/".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.explorer_url("0xabc"),
            "https://hashscan.io/testnet/transaction/0xabc"
        );
    }

    #[test]
    fn chain_credentials_need_both_values() {
        let mut config = Config::default();
        assert!(config.chain_credentials().is_none());

        config.contract_address = Some("0x0000000000000000000000000000000000001234".into());
        assert!(config.chain_credentials().is_none());

        config.operator_private_key = Some("01".repeat(32));
        assert!(config.chain_credentials().is_some());
    }
}
