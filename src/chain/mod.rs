//! Chain client adapter
//!
//! The engine talks to the chain only through [`ChainClient`]. The JSON-RPC
//! implementation lives in [`rpc`]; tests use the scripted [`mock::MockChain`].

pub mod rpc;
pub mod types;

#[cfg(test)]
pub mod mock;

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

pub use rpc::RpcChainClient;
pub use types::{BlockTag, FeeData, Log, LogFilter, Receipt, TransactionRequest};

/// Stream of raw logs from a live subscription
pub type LogStream = BoxStream<'static, Result<Log>>;

/// Contract the core needs from an EVM node
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Transaction count for `address` at the given tag
    async fn get_transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64>;

    /// Latest block number
    async fn get_block_number(&self) -> Result<u64>;

    /// Current fee suggestion
    async fn get_fee_data(&self) -> Result<FeeData>;

    /// Broadcast a transaction; resolves once the node accepted it
    async fn send_transaction(&self, request: &TransactionRequest) -> Result<B256>;

    /// Receipt for a mined transaction, `None` while pending
    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>>;

    /// Logs matching `filter` in the inclusive block range
    async fn get_logs(&self, filter: &LogFilter, from_block: u64, to_block: u64)
        -> Result<Vec<Log>>;

    /// Read-only contract call at the latest block
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes>;

    /// Push subscription for logs matching any of `filters`.
    ///
    /// Transports without push support return [`Error::SubscriptionUnsupported`].
    async fn subscribe_logs(&self, filters: Vec<LogFilter>) -> Result<LogStream>;

    /// Wait until `hash` is mined, polling every `poll`.
    async fn wait_for_receipt(
        &self,
        hash: B256,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Receipt> {
        let started = Instant::now();
        loop {
            match self.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!("Receipt poll for {} failed: {}", hash, e);
                }
                Err(e) => return Err(e),
            }
            if started.elapsed() >= timeout {
                return Err(Error::ConfirmationTimeout {
                    hash: hash.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}
