//! Ethereum JSON-RPC client that mints delivery certificates.
//!
//! The mint call is built as an EIP-1559 transaction, signed locally with
//! the configured key and submitted with `eth_sendRawTransaction`, so any
//! hosted provider works. The receipt is then polled until it is mined.
//!
//! ## Resilience
//!
//! * The send itself is never retried, so a flaky connection cannot mint twice.
//! * Nonce lookup and send are serialized, so concurrent mints do not reuse
//!   a nonce.
//! * Transport errors while polling for the receipt are logged and the poll
//!   continues until [`ChainConfig::receipt_poll_attempts`] is exhausted.

use std::time::Duration;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use reqwest::Client;
use rlp::RlpStream;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ChainConfig;
use crate::errors::{FoodLoopError, Result};

const MINT_SIGNATURE: &str = "confirmDeliveryAndMintNFT(uint256,address,string,string,string,string)";
const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";
const WEI_PER_GWEI: u128 = 1_000_000_000;
const EIP1559_TX_TYPE: u8 = 0x02;

/// Arguments of the certificate contract's mint call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintRequest {
    pub delivery_id: u64,
    pub donor_address: String,
    pub food_type: String,
    pub weight: String,
    pub location: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintReceipt {
    pub transaction_hash: String,
    /// Decimal id of the minted token, when the receipt carried a Transfer log.
    pub token_id: Option<String>,
}

#[async_trait]
pub trait Notarizer: Send + Sync + 'static {
    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt>;
}

/// Used when no chain is configured: every mint fails, which makes delivery
/// confirmation fall back to an off-chain `confirmed` status.
pub struct DisabledNotarizer;

#[async_trait]
impl Notarizer for DisabledNotarizer {
    async fn mint(&self, _request: &MintRequest) -> Result<MintReceipt> {
        Err(FoodLoopError::Chain(
            "certificate contract is not configured".to_string(),
        ))
    }
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct TransactionReceipt {
    /// `0x1` on success, `0x0` when the call reverted.
    status: Option<String>,
    #[serde(default)]
    logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub topics: Vec<String>,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct EthRpcNotarizer {
    client: Client,
    config: ChainConfig,
    sender: String,
    send_lock: Mutex<()>,
}

impl EthRpcNotarizer {
    pub fn new(client: Client, config: ChainConfig) -> Self {
        let sender = format!("0x{}", hex::encode(signer_address(&config.signing_key)));
        info!("Certificates will be minted from {sender}");
        Self {
            client,
            config,
            sender,
            send_lock: Mutex::new(()),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<Option<T>> {
        let body: RpcResponse<T> = self
            .client
            .post(&self.config.rpc_url)
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
            return Err(FoodLoopError::Chain(format!(
                "{method} failed with RPC error {}: {}",
                err.code, err.message
            )));
        }
        Ok(body.result)
    }

    async fn quantity_of(&self, method: &str, params: Value) -> Result<u64> {
        let raw: String = self
            .call(method, params)
            .await?
            .ok_or_else(|| FoodLoopError::Chain(format!("{method} returned no result")))?;
        parse_quantity(&raw)
    }

    async fn chain_id(&self) -> Result<u64> {
        match self.config.chain_id {
            Some(id) => Ok(id),
            None => self.quantity_of("eth_chainId", json!([])).await,
        }
    }

    /// Sign and submit the call, returning the transaction hash.
    async fn send_signed(&self, to: [u8; 20], data: &[u8]) -> Result<String> {
        let chain_id = self.chain_id().await?;

        let _guard = self.send_lock.lock().await;
        let nonce = self
            .quantity_of("eth_getTransactionCount", json!([self.sender, "pending"]))
            .await?;

        let tx = Eip1559Transaction {
            chain_id,
            nonce,
            max_priority_fee_per_gas: u128::from(self.config.priority_fee_gwei) * WEI_PER_GWEI,
            max_fee_per_gas: u128::from(self.config.max_fee_gwei) * WEI_PER_GWEI,
            gas_limit: self.config.gas_limit,
            to,
            data,
        };
        let raw = tx.sign(&self.config.signing_key)?;
        debug!("Sending mint with nonce {nonce} on chain {chain_id}");

        self.call(
            "eth_sendRawTransaction",
            json!([format!("0x{}", hex::encode(raw))]),
        )
        .await?
        .ok_or_else(|| FoodLoopError::Chain("eth_sendRawTransaction returned no hash".to_string()))
    }

    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TransactionReceipt> {
        let interval = Duration::from_millis(self.config.receipt_poll_interval_ms);
        for attempt in 1..=self.config.receipt_poll_attempts {
            match self
                .call::<TransactionReceipt>("eth_getTransactionReceipt", json!([tx_hash]))
                .await
            {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => debug!("Receipt for {tx_hash} not available yet (attempt {attempt})"),
                Err(FoodLoopError::Http(e)) => {
                    warn!("Receipt poll for {tx_hash} failed (attempt {attempt}): {e}")
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
        Err(FoodLoopError::Chain(format!(
            "no receipt for {tx_hash} after {} attempts",
            self.config.receipt_poll_attempts
        )))
    }
}

#[async_trait]
impl Notarizer for EthRpcNotarizer {
    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt> {
        let donor = parse_address(&request.donor_address)?;
        let data = encode_call(
            MINT_SIGNATURE,
            &[
                AbiValue::Uint(u128::from(request.delivery_id)),
                AbiValue::Address(donor),
                AbiValue::Str(&request.food_type),
                AbiValue::Str(&request.weight),
                AbiValue::Str(&request.location),
                AbiValue::Str(&request.timestamp),
            ],
        );

        let contract = parse_address(&self.config.contract_address)?;
        let tx_hash = self.send_signed(contract, &data).await?;
        info!("Mint for delivery {} sent: {tx_hash}", request.delivery_id);

        let receipt = self.wait_for_receipt(&tx_hash).await?;
        if receipt.status.as_deref() == Some("0x0") {
            return Err(FoodLoopError::Chain(format!("mint transaction {tx_hash} reverted")));
        }

        let token_id = minted_token_id(&receipt.logs);
        if token_id.is_none() {
            warn!("Mint {tx_hash} succeeded but no Transfer log was found");
        }
        Ok(MintReceipt {
            transaction_hash: tx_hash,
            token_id,
        })
    }
}

fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|e| FoodLoopError::Chain(format!("invalid quantity {raw}: {e}")))
}

// ─────────────────────────────────────────────────────────
// Transaction signing
// ─────────────────────────────────────────────────────────

/// A contract call with zero value and an empty access list.
struct Eip1559Transaction<'a> {
    chain_id: u64,
    nonce: u64,
    max_priority_fee_per_gas: u128,
    max_fee_per_gas: u128,
    gas_limit: u64,
    to: [u8; 20],
    data: &'a [u8],
}

impl Eip1559Transaction<'_> {
    fn append_fields(&self, stream: &mut RlpStream) {
        stream.append(&trimmed(&u128::from(self.chain_id).to_be_bytes()));
        stream.append(&trimmed(&u128::from(self.nonce).to_be_bytes()));
        stream.append(&trimmed(&self.max_priority_fee_per_gas.to_be_bytes()));
        stream.append(&trimmed(&self.max_fee_per_gas.to_be_bytes()));
        stream.append(&trimmed(&u128::from(self.gas_limit).to_be_bytes()));
        stream.append(&self.to.to_vec());
        // value
        stream.append(&Vec::<u8>::new());
        stream.append(&self.data.to_vec());
        // access list
        stream.begin_list(0);
    }

    fn signing_hash(&self) -> [u8; 32] {
        let mut stream = RlpStream::new_list(9);
        self.append_fields(&mut stream);
        let mut payload = vec![EIP1559_TX_TYPE];
        payload.extend_from_slice(&stream.out());
        keccak(&payload)
    }

    /// Typed transaction envelope ready for `eth_sendRawTransaction`.
    fn sign(&self, key: &SigningKey) -> Result<Vec<u8>> {
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&self.signing_hash())
            .map_err(|e| FoodLoopError::Chain(format!("signing failed: {e}")))?;
        let rs = signature.to_bytes();

        let mut stream = RlpStream::new_list(12);
        self.append_fields(&mut stream);
        stream.append(&trimmed(&[recovery_id.to_byte()]));
        stream.append(&trimmed(&rs[..32]));
        stream.append(&trimmed(&rs[32..]));

        let mut raw = vec![EIP1559_TX_TYPE];
        raw.extend_from_slice(&stream.out());
        Ok(raw)
    }
}

/// Big-endian integer bytes without leading zeros, as RLP expects.
fn trimmed(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Ethereum address of a signing key.
fn signer_address(key: &SigningKey) -> [u8; 20] {
    let point = PublicKey::from(key.verifying_key()).to_encoded_point(false);
    let hash = keccak(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

// ─────────────────────────────────────────────────────────
// ABI encoding
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum AbiValue<'a> {
    Uint(u128),
    Address([u8; 20]),
    Str(&'a str),
}

fn keccak(input: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(input));
    out
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn word_from_u128(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Encode a call with the standard head/tail layout: static values inline,
/// dynamic values as an offset into the tail.
fn encode_call(signature: &str, args: &[AbiValue<'_>]) -> Vec<u8> {
    let head_len = args.len() * 32;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for arg in args {
        match arg {
            AbiValue::Uint(n) => head.extend_from_slice(&word_from_u128(*n)),
            AbiValue::Address(addr) => {
                head.extend_from_slice(&[0u8; 12]);
                head.extend_from_slice(addr);
            }
            AbiValue::Str(s) => {
                head.extend_from_slice(&word_from_u128((head_len + tail.len()) as u128));
                let bytes = s.as_bytes();
                tail.extend_from_slice(&word_from_u128(bytes.len() as u128));
                tail.extend_from_slice(bytes);
                let padding = (32 - bytes.len() % 32) % 32;
                tail.resize(tail.len() + padding, 0);
            }
        }
    }

    let mut out = selector(signature).to_vec();
    out.extend(head);
    out.extend(tail);
    out
}

fn parse_address(address: &str) -> Result<[u8; 20]> {
    let digits = address.strip_prefix("0x").unwrap_or(address);
    let bytes = hex::decode(digits)
        .map_err(|e| FoodLoopError::Chain(format!("invalid address {address}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| FoodLoopError::Chain(format!("invalid address {address}: expected 20 bytes")))
}

// ─────────────────────────────────────────────────────────
// Receipt decoding
// ─────────────────────────────────────────────────────────

fn transfer_topic() -> String {
    format!("0x{}", hex::encode(keccak(TRANSFER_SIGNATURE.as_bytes())))
}

/// Token id from the first ERC-721 Transfer log in a receipt.
pub fn minted_token_id(logs: &[LogEntry]) -> Option<String> {
    let topic = transfer_topic();
    logs.iter()
        .filter(|log| log.topics.len() >= 4)
        .find(|log| log.topics[0].eq_ignore_ascii_case(&topic))
        .and_then(|log| word_to_decimal(&log.topics[3]))
}

/// Render a 32-byte hex word as a decimal string. Values wider than 128
/// bits are returned in hex.
fn word_to_decimal(word: &str) -> Option<String> {
    let digits = word.strip_prefix("0x").unwrap_or(word);
    let bytes = hex::decode(digits).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    if bytes[..16].iter().any(|b| *b != 0) {
        return Some(format!("0x{digits}"));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&bytes[16..]);
    Some(u128::from_be_bytes(low).to_string())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
