//! Scripted in-memory chain used by unit tests

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::types::{BlockTag, FeeData, Log, LogFilter, Receipt, TransactionRequest};
use super::{ChainClient, LogStream};
use crate::error::{Error, Result};

type CallHandler = Arc<dyn Fn(Address, &Bytes) -> Result<Bytes> + Send + Sync>;

pub struct MockState {
    pub latest_nonce: u64,
    pub pending_nonce: u64,
    pub block_number: u64,
    pub fee: FeeData,
    /// Every accepted broadcast, in order
    pub sent: Vec<TransactionRequest>,
    /// Error messages returned by the next `send_transaction` calls
    pub send_failures: VecDeque<String>,
    /// Create a successful receipt for every accepted broadcast
    pub auto_mine: bool,
    /// Advance the latest nonce past every accepted broadcast
    pub mine_on_send: bool,
    pub send_delay: Duration,
    pub receipts: HashMap<B256, Receipt>,
    pub failing_receipts: HashSet<B256>,
    pub logs: Vec<Log>,
    pub failing_get_logs: usize,
    pub receipt_fetches: usize,
    pub nonce_queries: usize,
    pub call_handler: Option<CallHandler>,
}

pub struct MockChain {
    pub state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::with_nonces(0, 0)
    }

    pub fn with_nonces(latest: u64, pending: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                latest_nonce: latest,
                pending_nonce: pending,
                block_number: 100,
                fee: FeeData {
                    max_fee_per_gas: Some(40_000_000_000),
                    max_priority_fee_per_gas: Some(2_000_000_000),
                    gas_price: Some(20_000_000_000),
                },
                sent: Vec::new(),
                send_failures: VecDeque::new(),
                auto_mine: true,
                mine_on_send: false,
                send_delay: Duration::ZERO,
                receipts: HashMap::new(),
                failing_receipts: HashSet::new(),
                logs: Vec::new(),
                failing_get_logs: 0,
                receipt_fetches: 0,
                nonce_queries: 0,
                call_handler: None,
            }),
        }
    }

    pub fn fail_next_sends<I: IntoIterator<Item = &'static str>>(&self, messages: I) {
        let mut state = self.state.lock().unwrap();
        state
            .send_failures
            .extend(messages.into_iter().map(String::from));
    }

    pub fn sent_nonces(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.sent.iter().filter_map(|tx| tx.nonce).collect()
    }

    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn insert_receipt(&self, receipt: Receipt) {
        let mut state = self.state.lock().unwrap();
        state.receipts.insert(receipt.transaction_hash, receipt);
    }
}

pub fn tx_hash(n: u64) -> B256 {
    B256::from(U256::from(n))
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_transaction_count(&self, _address: Address, tag: BlockTag) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.nonce_queries += 1;
        Ok(match tag {
            BlockTag::Latest => state.latest_nonce,
            BlockTag::Pending => state.pending_nonce,
        })
    }

    async fn get_block_number(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn get_fee_data(&self) -> Result<FeeData> {
        Ok(self.state.lock().unwrap().fee.clone())
    }

    async fn send_transaction(&self, request: &TransactionRequest) -> Result<B256> {
        let delay = self.state.lock().unwrap().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.send_failures.pop_front() {
            return Err(Error::Rpc(msg));
        }

        state.sent.push(request.clone());
        let hash = tx_hash(1_000 + state.sent.len() as u64);
        let nonce = request.nonce.unwrap_or(state.pending_nonce);
        state.pending_nonce = state.pending_nonce.max(nonce + 1);
        if state.mine_on_send {
            state.latest_nonce = state.latest_nonce.max(nonce + 1);
        }
        if state.auto_mine {
            let block_number = state.block_number;
            state.receipts.insert(
                hash,
                Receipt {
                    transaction_hash: hash,
                    block_number,
                    status: true,
                    from: request.from,
                    to: request.to,
                    gas_used: Some(21_000),
                    logs: vec![],
                },
            );
        }
        Ok(hash)
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<Option<Receipt>> {
        let mut state = self.state.lock().unwrap();
        state.receipt_fetches += 1;
        if state.failing_receipts.contains(&hash) {
            return Err(Error::Rpc("receipt fetch failed".into()));
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn get_logs(
        &self,
        filter: &LogFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>> {
        let mut state = self.state.lock().unwrap();
        if state.failing_get_logs > 0 {
            state.failing_get_logs -= 1;
            return Err(Error::Rpc("502 Bad Gateway".into()));
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or(0);
                block >= from_block
                    && block <= to_block
                    && filter.address.map_or(true, |a| a == log.address)
                    && (filter.topics.is_empty()
                        || log.topic0().map_or(false, |t| filter.topics.contains(&t)))
            })
            .cloned()
            .collect())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let handler = self.state.lock().unwrap().call_handler.clone();
        match handler {
            Some(handler) => handler(to, &data),
            None => Err(Error::Rpc("execution reverted".into())),
        }
    }

    async fn subscribe_logs(&self, _filters: Vec<LogFilter>) -> Result<LogStream> {
        Err(Error::SubscriptionUnsupported)
    }
}
