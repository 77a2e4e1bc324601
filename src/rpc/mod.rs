/// RPC Client Module
///
/// This module handles all interactions with the chain via Ethereum JSON-RPC.
/// Only the block header fields needed for harvesting are requested: block
/// numbers and their timestamps.
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{HarvestError, Result};
use crate::models::{BlockRecord, ConnectionInfo};

/// Max `eth_getBlockByNumber` calls per HTTP request
const MAX_CALLS_PER_REQUEST: usize = 100;

/// Read-only view of the chain used by the block fetcher
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn latest_block_number(&self) -> Result<u64>;

    /// Timestamps for the given blocks, in the order requested
    async fn block_timestamps(&self, numbers: &[u64]) -> Result<Vec<BlockRecord>>;
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    number: String,
    timestamp: String,
}

pub struct EvmRpcClient {
    client: reqwest::Client,
    endpoint: String,
}

impl EvmRpcClient {
    /// Create a new RPC client for the specified endpoint
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, endpoint })
    }

    /// Get the endpoint URL this client talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Get connection information for display
    pub async fn get_connection_info(&self) -> Result<ConnectionInfo> {
        let chain_id = self.chain_id().await?;
        let head = self.latest_block_number().await?;

        Ok(ConnectionInfo { endpoint: self.endpoint.clone(), chain_id, head })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let request = RpcRequest { jsonrpc: "2.0", id: 1, method, params };

        let response: RpcResponse =
            self.client.post(&self.endpoint).json(&request).send().await?.error_for_status()?.json().await?;

        decode_result(method, response)
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    async fn chain_id(&self) -> Result<u64> {
        let raw: String = self.call("eth_chainId", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn latest_block_number(&self) -> Result<u64> {
        let raw: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&raw)
    }

    async fn block_timestamps(&self, numbers: &[u64]) -> Result<Vec<BlockRecord>> {
        let mut records = Vec::with_capacity(numbers.len());

        for chunk in numbers.chunks(MAX_CALLS_PER_REQUEST) {
            let requests: Vec<RpcRequest> = chunk
                .iter()
                .enumerate()
                .map(|(i, number)| RpcRequest {
                    jsonrpc: "2.0",
                    id: i as u64,
                    method: "eth_getBlockByNumber",
                    params: json!([format!("0x{:x}", number), false]),
                })
                .collect();

            tracing::debug!("Requesting {} block headers starting at {}", chunk.len(), chunk[0]);

            let responses: Vec<RpcResponse> =
                self.client.post(&self.endpoint).json(&requests).send().await?.error_for_status()?.json().await?;

            // batch responses may arrive in any order
            let mut by_id: HashMap<u64, RpcResponse> = responses.into_iter().map(|r| (r.id, r)).collect();

            for (i, number) in chunk.iter().enumerate() {
                let response = by_id.remove(&(i as u64)).ok_or_else(|| {
                    HarvestError::ChainUnavailable(format!("no response for block {} in batch", number))
                })?;
                let header: Option<RpcBlockHeader> = decode_result("eth_getBlockByNumber", response)?;
                let header = header
                    .ok_or_else(|| HarvestError::ChainUnavailable(format!("block {} is not available", number)))?;

                records.push(header_to_record(*number, &header)?);
            }
        }

        Ok(records)
    }
}

fn decode_result<T: DeserializeOwned>(method: &str, response: RpcResponse) -> Result<T> {
    if let Some(err) = response.error {
        return Err(HarvestError::ChainUnavailable(format!("{} failed ({}): {}", method, err.code, err.message)));
    }

    serde_json::from_value(response.result.unwrap_or(Value::Null))
        .map_err(|e| HarvestError::ChainUnavailable(format!("unexpected {} result: {}", method, e)))
}

fn header_to_record(requested: u64, header: &RpcBlockHeader) -> Result<BlockRecord> {
    let number = parse_quantity(&header.number)?;
    if number != requested {
        return Err(HarvestError::ChainUnavailable(format!("asked for block {}, node returned {}", requested, number)));
    }

    Ok(BlockRecord::new(number, parse_quantity(&header.timestamp)?))
}

/// Decode a JSON-RPC hex quantity such as `0x1b4`
pub fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| HarvestError::ChainUnavailable(format!("'{}' is not a hex quantity", raw)))?;

    u64::from_str_radix(digits, 16)
        .map_err(|e| HarvestError::ChainUnavailable(format!("'{}' is not a hex quantity: {}", raw, e)))
}
