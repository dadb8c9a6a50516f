//! JSON-RPC chain client
//!
//! HTTP requests go through `reqwest`; log subscriptions use
//! `eth_subscribe("logs")` over a WebSocket when a WS endpoint is configured.
//! Signing is delegated to the node (or a signer proxy in front of it) via
//! `eth_sendTransaction`.

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::types::{quantity, BlockTag, FeeData, Log, LogFilter, Receipt, TransactionRequest};
use super::{ChainClient, LogStream};
use crate::config::RpcConfig;
use crate::error::{Error, Result};

/// Capacity of the buffer between the WebSocket reader and the pipeline
const SUBSCRIPTION_BUFFER: usize = 4096;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC implementation of [`ChainClient`]
pub struct RpcChainClient {
    http: reqwest::Client,
    endpoint: String,
    ws_endpoint: Option<String>,
    chain_id: Option<u64>,
    next_id: AtomicU64,
}

impl RpcChainClient {
    /// Create a new client from RPC configuration
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let ws_endpoint = if config.ws_endpoint.trim().is_empty() {
            None
        } else {
            Some(config.ws_endpoint.clone())
        };

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            ws_endpoint,
            chain_id: config.chain_id,
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rpc(format!(
                "{} {} from {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error"),
                method
            )));
        }

        let parsed: RpcResponse = response.json().await?;
        if let Some(err) = parsed.error {
            return Err(Error::Rpc(format!("{} (code {})", err.message, err.code)));
        }

        Ok(serde_json::from_value(parsed.result.unwrap_or(Value::Null))?)
    }

    async fn request_quantity(&self, method: &str, params: Value) -> Result<u128> {
        let raw: String = self.request(method, params).await?;
        quantity::parse(&raw).map_err(Error::Rpc)
    }

    fn transaction_json(&self, request: &TransactionRequest) -> Value {
        let mut tx = serde_json::Map::new();
        tx.insert("from".into(), json!(request.from));
        if let Some(to) = request.to {
            tx.insert("to".into(), json!(to));
        }
        tx.insert("value".into(), json!(format!("{:#x}", request.value)));
        tx.insert("input".into(), json!(request.data));
        if let Some(nonce) = request.nonce {
            tx.insert("nonce".into(), json!(format!("{:#x}", nonce)));
        }
        if let Some(gas) = request.gas_limit {
            tx.insert("gas".into(), json!(format!("{:#x}", gas)));
        }
        if let Some(max_fee) = request.max_fee_per_gas {
            tx.insert("maxFeePerGas".into(), json!(format!("{:#x}", max_fee)));
            let priority = request.max_priority_fee_per_gas.unwrap_or(0);
            tx.insert(
                "maxPriorityFeePerGas".into(),
                json!(format!("{:#x}", priority)),
            );
        } else if let Some(gas_price) = request.gas_price {
            tx.insert("gasPrice".into(), json!(format!("{:#x}", gas_price)));
        }
        if let Some(chain_id) = request.chain_id.or(self.chain_id) {
            tx.insert("chainId".into(), json!(format!("{:#x}", chain_id)));
        }
        Value::Object(tx)
    }
}

fn filter_json(filter: &LogFilter) -> Value {
    let mut obj = serde_json::Map::new();
    if let Some(address) = filter.address {
        obj.insert("address".into(), json!(address));
    }
    if !filter.topics.is_empty() {
        obj.insert("topics".into(), json!([filter.topics]));
    }
    Value::Object(obj)
}

/// Extract a log from an `eth_subscription` notification.
///
/// Subscription acknowledgements and unrelated messages yield `None`.
fn parse_subscription_message(text: &str) -> Result<Option<Log>> {
    let value: Value = serde_json::from_str(text)?;
    if let Some(err) = value.get("error") {
        return Err(Error::Rpc(format!("subscription error: {}", err)));
    }
    if value.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return Ok(None);
    }
    let result = value
        .get("params")
        .and_then(|p| p.get("result"))
        .cloned()
        .ok_or_else(|| Error::Decode("subscription message without result".into()))?;
    Ok(Some(serde_json::from_value(result)?))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn get_transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64> {
        let count = self
            .request_quantity("eth_getTransactionCount", json!([address, tag.as_str()]))
            .await?;
        u64::try_from(count).map_err(|e| Error::Rpc(e.to_string()))
    }

    async fn get_block_number(&self) -> Result<u64> {
        let number = self.request_quantity("eth_blockNumber", json!([])).await?;
        u64::try_from(number).map_err(|e| Error::Rpc(e.to_string()))
    }

    async fn get_fee_data(&self) -> Result<FeeData> {
        let gas_price = self.request_quantity("eth_gasPrice", json!([])).await.ok();
        let priority = match self
            .request_quantity("eth_maxPriorityFeePerGas", json!([]))
            .await
        {
            Ok(p) => Some(p),
            Err(e) => {
                debug!("eth_maxPriorityFeePerGas unavailable: {}", e);
                None
            }
        };
        let block: Value = self
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let base_fee = block
            .get("baseFeePerGas")
            .and_then(Value::as_str)
            .and_then(|s| quantity::parse(s).ok());

        let (max_fee, max_priority) = match (base_fee, priority) {
            (Some(base), Some(prio)) => (Some(base.saturating_mul(2).saturating_add(prio)), Some(prio)),
            (Some(base), None) => {
                let prio = 1_000_000_000u128;
                (Some(base.saturating_mul(2).saturating_add(prio)), Some(prio))
            }
            _ => (None, None),
        };

        Ok(FeeData {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: max_priority,
            gas_price,
        })
    }

    async fn send_transaction(&self, request: &TransactionRequest) -> Result<B256> {
        let tx = self.transaction_json(request);
        self.request("eth_sendTransaction", json!([tx])).await
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>> {
        self.request("eth_getTransactionReceipt", json!([hash])).await
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>> {
        let mut params = filter_json(filter);
        if let Value::Object(obj) = &mut params {
            obj.insert("fromBlock".into(), json!(format!("{:#x}", from_block)));
            obj.insert("toBlock".into(), json!(format!("{:#x}", to_block)));
        }
        self.request("eth_getLogs", json!([params])).await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.request("eth_call", json!([{ "to": to, "input": data }, "latest"]))
            .await
    }

    async fn subscribe_logs(&self, filters: Vec<LogFilter>) -> Result<LogStream> {
        let ws_endpoint = self
            .ws_endpoint
            .as_ref()
            .ok_or(Error::SubscriptionUnsupported)?;
        let url = url::Url::parse(ws_endpoint)
            .map_err(|e| Error::Config(format!("Invalid WebSocket URL: {}", e)))?;

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::RpcConnection(format!("WebSocket connect failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        for (idx, filter) in filters.iter().enumerate() {
            let msg = json!({
                "jsonrpc": "2.0",
                "id": idx + 1,
                "method": "eth_subscribe",
                "params": ["logs", filter_json(filter)],
            });
            write
                .send(Message::Text(msg.to_string()))
                .await
                .map_err(|e| Error::RpcConnection(format!("Failed to subscribe: {}", e)))?;
        }
        info!("Subscribed to {} log filter(s) over WebSocket", filters.len());

        let (tx, rx) = async_channel::bounded::<Result<Log>>(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match parse_subscription_message(&text) {
                        Ok(Some(log)) => {
                            if tx.send(Ok(log)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Dropping malformed subscription message: {}", e);
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            let _ = tx
                                .send(Err(Error::SubscriptionClosed("pong failed".into())))
                                .await;
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        let _ = tx
                            .send(Err(Error::SubscriptionClosed("closed by server".into())))
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(Error::SubscriptionClosed(e.to_string()))).await;
                        break;
                    }
                    _ => {}
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(Box::pin(rx))
    }
}
