//! Detection and trading strategies
//!
//! A strategy ("tracker") declares the logs it cares about, decides from a
//! receipt whether a transaction created a pool worth buying, and executes
//! and unwinds the resulting position. The pipeline only ever sees the
//! [`Strategy`] trait; protocol specifics live behind it.
//!
//! - `tracker` - shared detect/buy/sell flow over a [`tracker::PoolProtocol`]
//! - `uniswap_v2` / `uniswap_v3` - protocol adapters
//! - `factory` - builds a strategy from its protocol tag
//! - `registry` - the live strategy set
//! - `dex` - contract bindings

pub mod dex;
pub mod factory;
pub mod registry;
pub mod tracker;
pub mod uniswap_v2;
pub mod uniswap_v3;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::chain::{ChainClient, LogFilter, Receipt, TransactionRequest};
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::events::{DetectionNotice, EventBus};
use crate::ledger::ExposureLedger;
use crate::position::{Trade, TradeBook};
use crate::queue::TxQueue;

pub use factory::build_strategy;
pub use registry::Registry;

/// Result of evaluating one receipt against one strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub strategy_id: String,
    pub protocol: String,
    pub tx_hash: B256,
    pub block_number: u64,
    pub token0: Address,
    pub token1: Address,
    pub pool: Address,
    /// V3 fee tier
    pub fee: Option<u32>,
    /// Token the strategy would buy
    pub target_token: Option<Address>,
    pub amount_in_wei: U256,
    /// Set when the strategy rejects the candidate
    pub reason: Option<String>,
    /// A trade slot was reserved in the ledger during detection
    pub reserved: bool,
}

impl Detection {
    /// No rejection reason and no failed reservation
    pub fn is_match(&self) -> bool {
        self.reason.is_none()
    }

    pub fn reject(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn notice(&self) -> DetectionNotice {
        DetectionNotice {
            tx_hash: self.tx_hash,
            strategy_id: self.strategy_id.clone(),
            protocol: self.protocol.clone(),
            pass: self.is_match(),
            reason: self.reason.clone(),
            block_number: self.block_number,
            pool: self.pool,
            token0: self.token0,
            token1: self.token1,
            target_token: self.target_token,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectOptions {
    /// Reserve a trade slot for a match
    pub reserve: bool,
}

/// Sell transactions for part of a position
#[derive(Debug, Clone)]
pub struct SellPlan {
    /// Allowance for the router, when the current one does not cover the sale
    pub approve: Option<TransactionRequest>,
    pub sell: TransactionRequest,
    /// Quoted ETH out
    pub expected_out_wei: U256,
    /// Contract that pays out the ETH/WETH
    pub router: Address,
}

/// Everything a strategy needs to trade
pub struct TradeContext {
    pub client: Arc<dyn ChainClient>,
    pub queue: Arc<TxQueue>,
    pub ledger: Arc<ExposureLedger>,
    pub trades: Arc<TradeBook>,
    pub events: EventBus,
    pub signer: Address,
    pub weth: Address,
    /// Detect and log, never broadcast buys
    pub dry_run: bool,
}

/// A pluggable detection and trading strategy
#[async_trait]
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> String;

    /// Protocol tag (`uniswap_v2`, `uniswap_v3`)
    fn protocol(&self) -> &'static str;

    fn enabled(&self) -> bool;

    /// Higher wins arbitration
    fn priority(&self) -> i32;

    /// Logs this strategy wants delivered
    fn log_filters(&self) -> Vec<LogFilter>;

    /// Current settings
    fn settings(&self) -> TrackerConfig;

    /// Replace settings at runtime. The id and protocol cannot change.
    fn update_settings(&self, settings: TrackerConfig) -> Result<()>;

    /// Evaluate a receipt. `Ok(None)` means the transaction is irrelevant.
    async fn detect(&self, receipt: &Receipt, opts: DetectOptions) -> Result<Option<Detection>>;

    /// Execute the buy for a winning detection
    async fn process(&self, detection: Detection) -> Result<()>;

    /// Called for a match that lost arbitration; releases what `detect` reserved
    fn abandon(&self, _detection: &Detection) {}

    /// Current ETH value of the tokens still held by `trade`
    async fn quote_exit(&self, trade: &Trade) -> Result<U256>;

    /// Transactions selling `token_amount` of `trade`
    async fn build_sell(&self, trade: &Trade, token_amount: U256) -> Result<SellPlan>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::audit::AuditLog;
    use crate::chain::mock::MockChain;
    use crate::config::{ExitConfig, QueueConfig};
    use crate::store::MemoryStore;

    pub fn signer() -> Address {
        Address::repeat_byte(0xaa)
    }

    pub fn weth() -> Address {
        Address::repeat_byte(0xee)
    }

    pub fn context(chain: Arc<MockChain>) -> Arc<TradeContext> {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new(256);
        let audit = AuditLog::new(store.clone(), 100);
        let queue = TxQueue::new(
            chain.clone(),
            QueueConfig {
                base_backoff_ms: 1,
                max_backoff_ms: 2,
                receipt_poll_ms: 5,
                confirm_timeout_ms: 500,
                ..Default::default()
            },
            events.clone(),
            audit,
        );
        Arc::new(TradeContext {
            client: chain,
            queue,
            ledger: Arc::new(ExposureLedger::new()),
            trades: Arc::new(TradeBook::new(store)),
            events,
            signer: signer(),
            weth: weth(),
            dry_run: false,
        })
    }

    pub fn tracker_config(id: &str, protocol: &str) -> TrackerConfig {
        TrackerConfig {
            id: id.to_string(),
            name: String::new(),
            protocol: protocol.to_string(),
            enabled: true,
            priority: 0,
            factory: Address::repeat_byte(0xfa),
            router: Address::repeat_byte(0x70),
            quoter: Some(Address::repeat_byte(0x90)),
            buy_amount_eth: 0.1,
            slippage_bps: 1_000,
            max_trades: 0,
            max_active_buy_eth: 0.0,
            gas_limit: 300_000,
            deadline_secs: 60,
            exits: ExitConfig::default(),
            blocked_tokens: vec![],
            manual_mode: false,
        }
    }
}
