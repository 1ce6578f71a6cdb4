//! EVM JSON-RPC client for the `AgentStaking` contract.
//!
//! ## Calls
//!
//! * Reads go through `eth_call` against the `latest` block.
//! * Writes are legacy EIP-155 transactions signed locally with the operator
//!   key and submitted with `eth_sendRawTransaction`.  The client then polls
//!   `eth_getTransactionReceipt` until the receipt shows up.
//!
//! Every RPC method is attempted exactly once; callers decide what a failure
//! means for their workflow.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use reqwest::Client;
use rlp::RlpStream;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use tracing::{debug, info};

use crate::config::Config;
use crate::errors::{CoordinatorError, Result};
use crate::staking::StakingLedger;

/// Gas attached to a plain value transfer.
const TRANSFER_GAS_LIMIT: u64 = 21_000;

const WEI_DECIMALS: usize = 18;

// ─────────────────────────────────────────────────────────
// Contract surface
// ─────────────────────────────────────────────────────────

pub const GET_BALANCE: &str = "getBalance(address)";
pub const GET_TRIP_TOTAL: &str = "getTripTotal(uint256)";
pub const TRIP_COMPLETED: &str = "tripCompleted(uint256)";
pub const COMPLETE_TRIP: &str = "completeTrip(uint256,bool)";
pub const STAKE_ON_BEHALF: &str = "stakeOnBehalf(address,uint256,uint256)";
pub const SET_PAUSED: &str = "setPaused(bool)";
pub const EMERGENCY_WITHDRAW: &str = "emergencyWithdraw()";

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct TxReceipt {
    pub status: Option<String>,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Primitive types
// ─────────────────────────────────────────────────────────

/// 20-byte account or contract address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address(pub [u8; 20]);

impl FromStr for Address {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = strip_hex_prefix(s.trim());
        if digits.len() != 40 {
            return Err(CoordinatorError::InvalidAddress(s.to_string()));
        }
        let bytes =
            hex::decode(digits).map_err(|_| CoordinatorError::InvalidAddress(s.to_string()))?;
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&bytes);
        Ok(Address(addr))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A static ABI argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(u128),
    Bool(bool),
}

impl Token {
    fn encode_word(&self) -> [u8; 32] {
        let mut word = [0u8; 32];
        match self {
            Token::Address(addr) => word[12..].copy_from_slice(&addr.0),
            Token::Uint(n) => word[16..].copy_from_slice(&n.to_be_bytes()),
            Token::Bool(b) => word[31] = u8::from(*b),
        }
        word
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// First four bytes of keccak256 over the canonical signature.
pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Selector followed by one 32-byte word per argument.
pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&function_selector(signature));
    for arg in args {
        data.extend_from_slice(&arg.encode_word());
    }
    data
}

/// Decode a single `uint256` return word.  Values above `u128::MAX` are rejected.
pub fn decode_uint(data: &[u8]) -> Result<u128> {
    if data.len() < 32 {
        return Err(CoordinatorError::Rpc(format!(
            "expected a 32-byte word, got {} bytes",
            data.len()
        )));
    }
    if data[..16].iter().any(|&b| b != 0) {
        return Err(CoordinatorError::Rpc("uint256 value exceeds u128".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&data[16..32]);
    Ok(u128::from_be_bytes(low))
}

pub fn decode_bool(data: &[u8]) -> Result<bool> {
    match decode_uint(data)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CoordinatorError::Rpc(format!("invalid bool word: {other}"))),
    }
}

/// Parse a JSON-RPC hex quantity such as `0x1a`.
pub fn parse_quantity(raw: &str) -> Result<u128> {
    let digits = strip_hex_prefix(raw);
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| CoordinatorError::Rpc(format!("invalid hex quantity: {raw}")))
}

fn decode_hex_data(raw: &str) -> Result<Vec<u8>> {
    hex::decode(strip_hex_prefix(raw))
        .map_err(|_| CoordinatorError::Rpc(format!("invalid hex data: {raw}")))
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Render a wei amount with 18 decimals, e.g. `1500000000000000000` → `1.5`.
pub fn format_ether(wei: u128) -> String {
    let digits = format!("{wei:0>width$}", width = WEI_DECIMALS + 1);
    let (whole, frac) = digits.split_at(digits.len() - WEI_DECIMALS);
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        format!("{whole}.0")
    } else {
        format!("{whole}.{frac}")
    }
}

/// Convert a decimal amount of the native token into wei.
pub fn parse_ether(amount: f64) -> Result<u128> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(CoordinatorError::Validation(format!(
            "Invalid token amount: {amount}"
        )));
    }
    let repr = amount.to_string();
    let (whole, frac) = repr.split_once('.').unwrap_or((repr.as_str(), ""));
    let frac: String = frac.chars().chain(std::iter::repeat('0')).take(WEI_DECIMALS).collect();

    let overflow = || CoordinatorError::Validation(format!("Token amount too large: {amount}"));
    let whole: u128 = whole.parse().map_err(|_| overflow())?;
    let frac: u128 = frac.parse().map_err(|_| overflow())?;
    whole
        .checked_mul(10u128.pow(WEI_DECIMALS as u32))
        .and_then(|w| w.checked_add(frac))
        .ok_or_else(overflow)
}

/// Big-endian bytes without leading zeros, the RLP form of an integer.
fn trim_be(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

// ─────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    pub to: Address,
    pub value: u128,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&trim_be(&self.nonce.to_be_bytes()));
        stream.append(&trim_be(&self.gas_price.to_be_bytes()));
        stream.append(&trim_be(&self.gas_limit.to_be_bytes()));
        stream.append(&self.to.0.to_vec());
        stream.append(&trim_be(&self.value.to_be_bytes()));
        stream.append(&self.data);
    }

    /// EIP-155 payload whose keccak256 gets signed.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&trim_be(&self.chain_id.to_be_bytes()));
        stream.append_empty_data();
        stream.append_empty_data();
        stream.out().to_vec()
    }

    fn encode_signed(&self, v: u64, r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&trim_be(&v.to_be_bytes()));
        stream.append(&trim_be(r));
        stream.append(&trim_be(s));
        stream.out().to_vec()
    }
}

/// The operator (agent) account that signs every coordinator transaction.
pub struct Operator {
    key: SigningKey,
    address: Address,
}

impl Operator {
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let bytes = hex::decode(strip_hex_prefix(private_key.trim()))
            .map_err(|_| CoordinatorError::Config("Invalid OPERATOR_PRIVATE_KEY".to_string()))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|_| CoordinatorError::Config("Invalid OPERATOR_PRIVATE_KEY".to_string()))?;

        let point = key.verifying_key().to_encoded_point(false);
        let hash = keccak256(&point.as_bytes()[1..]);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&hash[12..]);

        Ok(Operator {
            key,
            address: Address(addr),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign `tx` and return the raw RLP bytes ready for `eth_sendRawTransaction`.
    pub fn sign(&self, tx: &LegacyTransaction) -> Result<Vec<u8>> {
        let hash = keccak256(&tx.signing_payload());
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&hash)
            .map_err(|e| CoordinatorError::Signing(e.to_string()))?;

        let v = u64::from(recovery_id.to_byte()) + 35 + 2 * tx.chain_id;
        let rs = signature.to_bytes();
        Ok(tx.encode_signed(v, &rs[..32], &rs[32..]))
    }
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct EvmClient {
    client: Client,
    rpc_url: String,
    chain_id: u64,
    contract: Address,
    operator: Operator,
    gas_limit: u64,
    receipt_poll: Duration,
    receipt_max_polls: u32,
}

impl EvmClient {
    /// Build a client from config.  Returns `Ok(None)` when chain credentials
    /// are not configured.
    pub fn from_config(client: Client, config: &Config) -> Result<Option<Self>> {
        let Some((contract, private_key)) = config.chain_credentials() else {
            return Ok(None);
        };
        let contract: Address = contract.parse().map_err(|_| {
            CoordinatorError::Config(format!("Invalid CONTRACT_ADDRESS: {contract}"))
        })?;
        let operator = Operator::from_hex(private_key)?;
        info!(
            "Chain client ready, contract {contract}, operator {}",
            operator.address()
        );

        Ok(Some(EvmClient {
            client,
            rpc_url: config.rpc_url.clone(),
            chain_id: config.chain_id,
            contract,
            operator,
            gas_limit: config.gas_limit,
            receipt_poll: Duration::from_millis(config.receipt_poll_ms),
            receipt_max_polls: config.receipt_max_polls,
        }))
    }

    /// Issue one JSON-RPC request and return its raw `result` (may be null).
    async fn rpc_raw(&self, method: &str, params: Value) -> Result<Option<Value>> {
        let body: RpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = body.error {
            return Err(CoordinatorError::Rpc(format!(
                "{method} failed ({}): {}",
                err.code, err.message
            )));
        }
        Ok(body.result.filter(|v| !v.is_null()))
    }

    async fn rpc_string(&self, method: &str, params: Value) -> Result<String> {
        match self.rpc_raw(method, params).await? {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(CoordinatorError::Rpc(format!(
                "unexpected {method} result: {other}"
            ))),
            None => Err(CoordinatorError::Rpc(format!("Empty result from {method}"))),
        }
    }

    async fn call(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let raw = self
            .rpc_string(
                "eth_call",
                json!([
                    {
                        "to": self.contract.to_string(),
                        "data": format!("0x{}", hex::encode(data)),
                    },
                    "latest"
                ]),
            )
            .await?;
        decode_hex_data(&raw)
    }

    async fn send(&self, to: Address, value: u128, data: Vec<u8>, gas_limit: u64) -> Result<String> {
        let nonce = self
            .rpc_string(
                "eth_getTransactionCount",
                json!([self.operator.address().to_string(), "pending"]),
            )
            .await?;
        let gas_price = self.rpc_string("eth_gasPrice", json!([])).await?;

        let nonce = u64::try_from(parse_quantity(&nonce)?)
            .map_err(|_| CoordinatorError::Rpc(format!("nonce out of range: {nonce}")))?;
        let tx = LegacyTransaction {
            nonce,
            gas_price: parse_quantity(&gas_price)?,
            gas_limit,
            to,
            value,
            data,
            chain_id: self.chain_id,
        };
        let raw = self.operator.sign(&tx)?;

        let tx_hash = self
            .rpc_string(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(raw))]),
            )
            .await?;
        debug!("Sent tx {tx_hash} (nonce {nonce}) to {to}");

        self.wait_for_receipt(&tx_hash).await?;
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<()> {
        for _ in 0..self.receipt_max_polls {
            if let Some(raw) = self
                .rpc_raw("eth_getTransactionReceipt", json!([tx_hash]))
                .await?
            {
                let receipt: TxReceipt = serde_json::from_value(raw)?;
                return match receipt.status.as_deref() {
                    Some("0x1") => {
                        debug!(
                            "Tx {tx_hash} confirmed in block {}",
                            receipt.block_number.as_deref().unwrap_or("?")
                        );
                        Ok(())
                    }
                    _ => Err(CoordinatorError::Rpc(format!(
                        "Transaction {tx_hash} reverted"
                    ))),
                };
            }
            tokio::time::sleep(self.receipt_poll).await;
        }
        Err(CoordinatorError::Rpc(format!(
            "Transaction {tx_hash} not confirmed after {} polls",
            self.receipt_max_polls
        )))
    }

    async fn send_to_contract(&self, value: u128, data: Vec<u8>) -> Result<String> {
        self.send(self.contract, value, data, self.gas_limit).await
    }
}

#[async_trait]
impl StakingLedger for EvmClient {
    async fn balance_of(&self, wallet: &str) -> Result<u128> {
        let wallet: Address = wallet.parse()?;
        let out = self
            .call(encode_call(GET_BALANCE, &[Token::Address(wallet)]))
            .await?;
        decode_uint(&out)
    }

    async fn trip_total(&self, trip_id: u64) -> Result<u128> {
        let out = self
            .call(encode_call(GET_TRIP_TOTAL, &[Token::Uint(trip_id.into())]))
            .await?;
        decode_uint(&out)
    }

    async fn trip_completed(&self, trip_id: u64) -> Result<bool> {
        let out = self
            .call(encode_call(TRIP_COMPLETED, &[Token::Uint(trip_id.into())]))
            .await?;
        decode_bool(&out)
    }

    async fn complete_trip(&self, trip_id: u64, success: bool) -> Result<String> {
        let data = encode_call(
            COMPLETE_TRIP,
            &[Token::Uint(trip_id.into()), Token::Bool(success)],
        );
        self.send_to_contract(0, data).await
    }

    async fn stake_on_behalf(&self, wallet: &str, amount_wei: u128, trip_id: u64) -> Result<String> {
        let wallet: Address = wallet.parse()?;
        let data = encode_call(
            STAKE_ON_BEHALF,
            &[
                Token::Address(wallet),
                Token::Uint(amount_wei),
                Token::Uint(trip_id.into()),
            ],
        );
        self.send_to_contract(amount_wei, data).await
    }

    async fn set_paused(&self, paused: bool) -> Result<String> {
        self.send_to_contract(0, encode_call(SET_PAUSED, &[Token::Bool(paused)]))
            .await
    }

    async fn emergency_withdraw(&self) -> Result<String> {
        self.send_to_contract(0, encode_call(EMERGENCY_WITHDRAW, &[]))
            .await
    }

    async fn transfer(&self, to: &str, amount_wei: u128) -> Result<String> {
        let to: Address = to.parse()?;
        self.send(to, amount_wei, Vec::new(), TRANSFER_GAS_LIMIT)
            .await
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_function_selectors() {
        assert_eq!(hex::encode(function_selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(function_selector("balanceOf(address)")), "70a08231");
    }

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            hex::encode(keccak256(&[])),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn encode_call_pads_static_arguments() {
        let user: Address = "0x00000000000000000000000000000000000000AB".parse().unwrap();
        let data = encode_call(
            STAKE_ON_BEHALF,
            &[Token::Address(user), Token::Uint(5), Token::Uint(1)],
        );
        assert_eq!(data.len(), 4 + 3 * 32);
        assert_eq!(&data[..4], &function_selector(STAKE_ON_BEHALF));
        assert_eq!(data[4 + 31], 0xab);
        assert_eq!(data[36 + 31], 5);
        assert_eq!(data[68 + 31], 1);

        let toggle = encode_call(SET_PAUSED, &[Token::Bool(true)]);
        assert_eq!(toggle[35], 1);
        assert_eq!(encode_call(EMERGENCY_WITHDRAW, &[]).len(), 4);
    }

    #[test]
    fn address_parsing() {
        let addr: Address = "0x2C7536E3605D9C16A7A3D7B1898E529396A65C23".parse().unwrap();
        assert_eq!(addr.to_string(), "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23");
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0xzz7536e3605d9c16a7a3d7b1898e529396a65c23"
            .parse::<Address>()
            .is_err());
    }

    #[test]
    fn decode_return_words() {
        let mut word = [0u8; 32];
        word[31] = 42;
        assert_eq!(decode_uint(&word).unwrap(), 42);
        word[31] = 1;
        assert!(decode_bool(&word).unwrap());
        word[31] = 2;
        assert!(decode_bool(&word).is_err());

        let mut huge = [0u8; 32];
        huge[0] = 1;
        assert!(decode_uint(&huge).is_err());
        assert!(decode_uint(&[0u8; 4]).is_err());
    }

    #[test]
    fn quantities() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0x1a").unwrap(), 26);
        assert!(parse_quantity("0xnope").is_err());
    }

    #[test]
    fn ether_formatting() {
        assert_eq!(format_ether(0), "0.0");
        assert_eq!(format_ether(1_000_000_000_000_000_000), "1.0");
        assert_eq!(format_ether(1_500_000_000_000_000_000), "1.5");
        assert_eq!(format_ether(1), "0.000000000000000001");
        assert_eq!(format_ether(25_000_000_000_000_000_000), "25.0");
    }

    #[test]
    fn ether_parsing() {
        assert_eq!(parse_ether(1.0).unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_ether(0.1).unwrap(), 100_000_000_000_000_000);
        assert_eq!(parse_ether(1000.0).unwrap(), 1_000_000_000_000_000_000_000);
        assert!(parse_ether(-1.0).is_err());
        assert!(parse_ether(f64::NAN).is_err());
    }

    #[test]
    fn operator_address_from_key() {
        let op = Operator::from_hex(
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        )
        .unwrap();
        assert_eq!(
            op.address().to_string(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
        assert!(Operator::from_hex("not-a-key").is_err());
    }

    // EIP-155 reference transaction.
    fn eip155_example() -> LegacyTransaction {
        LegacyTransaction {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: "0x3535353535353535353535353535353535353535".parse().unwrap(),
            value: 1_000_000_000_000_000_000,
            data: Vec::new(),
            chain_id: 1,
        }
    }

    #[test]
    fn eip155_signing_payload() {
        assert_eq!(
            hex::encode(eip155_example().signing_payload()),
            "ec098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a764000080018080"
        );
    }

    #[test]
    fn eip155_signed_transaction() {
        let op = Operator::from_hex(&"46".repeat(32)).unwrap();
        let raw = op.sign(&eip155_example()).unwrap();
        assert_eq!(
            hex::encode(raw),
            "f86c098504a817c800825208943535353535353535353535353535353535353535880de0b6b3a76400008025a028ef61340bd939bc2195fe537567866003e1a15d3c71ff63e1590620aa636276a067cbe9d8997f761aecb703304b3800ccf555c9f3dc64214b297fb1966a3b6d83"
        );
    }
}
