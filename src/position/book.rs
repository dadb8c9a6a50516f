//! Trade book
//!
//! Tracks every trade from the moment a buy is queued until it is closed,
//! and mirrors each record into the store hash `trades`.

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::KvStore;

/// Store hash holding one JSON record per trade
pub const TRADES_KEY: &str = "trades";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    /// Buy queued, not yet confirmed
    Pending,
    Open,
    /// First take-profit sold
    PartialTp1,
    /// Sell in flight
    Selling,
    Closed,
    Failed,
}

impl TradeStatus {
    /// Holding tokens and eligible for exits
    pub fn is_active(&self) -> bool {
        matches!(self, TradeStatus::Open | TradeStatus::PartialTp1)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TradeStatus::Closed | TradeStatus::Failed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Open => "open",
            TradeStatus::PartialTp1 => "partial_tp1",
            TradeStatus::Selling => "selling",
            TradeStatus::Closed => "closed",
            TradeStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A sell the node accepted whose receipt has not been seen yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSell {
    pub hash: B256,
    /// Tokens the sell spends
    pub token_amount: U256,
    /// Quoted ETH out, used when the receipt shows no WETH transfer
    pub expected_out_wei: U256,
    /// Contract paying out the ETH/WETH
    pub router: Address,
    /// Exit reason tag, e.g. `take_profit_1`
    pub reason: String,
}

/// A single position opened by a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub strategy_id: String,
    pub protocol: String,
    /// Token bought
    pub token: Address,
    pub pool: Address,
    /// V3 fee tier
    pub fee: Option<u32>,
    pub status: TradeStatus,
    /// ETH spent on the buy
    pub amount_in_wei: U256,
    /// Tokens received by the buy
    pub initial_token_amount: U256,
    /// Tokens still held
    pub token_amount: U256,
    /// ETH received from sells so far
    pub proceeds_wei: U256,
    pub buy_tx: Option<B256>,
    pub detected_in: B256,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Highest quoted value of the remaining tokens
    pub highest_value_wei: U256,
    /// PnL at the previous monitor tick
    pub last_pnl_pct: Option<f64>,
    /// Status to restore if an in-flight sell fails
    #[serde(default)]
    pub status_before_sell: Option<TradeStatus>,
    #[serde(default)]
    pub pending_sell: Option<PendingSell>,
    pub manual_mode: bool,
}

impl Trade {
    pub fn pending(
        id: String,
        strategy_id: String,
        protocol: String,
        token: Address,
        pool: Address,
        fee: Option<u32>,
        amount_in_wei: U256,
        detected_in: B256,
        manual_mode: bool,
    ) -> Self {
        Self {
            id,
            strategy_id,
            protocol,
            token,
            pool,
            fee,
            status: TradeStatus::Pending,
            amount_in_wei,
            initial_token_amount: U256::ZERO,
            token_amount: U256::ZERO,
            proceeds_wei: U256::ZERO,
            buy_tx: None,
            detected_in,
            opened_at: Utc::now(),
            closed_at: None,
            highest_value_wei: U256::ZERO,
            last_pnl_pct: None,
            status_before_sell: None,
            pending_sell: None,
            manual_mode,
        }
    }

    /// Cost basis of `tokens` out of the initial amount
    pub fn cost_of(&self, tokens: U256) -> U256 {
        if self.initial_token_amount.is_zero() {
            return U256::ZERO;
        }
        self.amount_in_wei * tokens / self.initial_token_amount
    }

    /// Hash of the broadcast whose receipt decides this trade's next state
    pub fn awaiting_receipt(&self) -> Option<B256> {
        match self.status {
            TradeStatus::Pending => self.buy_tx,
            TradeStatus::Selling => self.pending_sell.as_ref().map(|p| p.hash),
            _ => None,
        }
    }

    /// Cost basis of the tokens still held
    pub fn remaining_cost_wei(&self) -> U256 {
        self.cost_of(self.token_amount)
    }

    /// PnL percentage of the remaining position valued at `value_wei`
    pub fn pnl_pct(&self, value_wei: U256) -> f64 {
        let cost = u256_to_f64(self.remaining_cost_wei());
        if cost == 0.0 {
            return 0.0;
        }
        (u256_to_f64(value_wei) - cost) / cost * 100.0
    }
}

/// Lossy conversion for percentages
pub fn u256_to_f64(value: U256) -> f64 {
    value.to_string().parse().unwrap_or(f64::MAX)
}

/// Saturating conversion for signed PnL arithmetic
pub fn u256_to_i128(value: U256) -> i128 {
    value.saturating_to::<u128>().min(i128::MAX as u128) as i128
}

/// In-memory trade records backed by the store
pub struct TradeBook {
    trades: RwLock<HashMap<String, Trade>>,
    store: Arc<dyn KvStore>,
}

impl TradeBook {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            trades: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Load trades saved by a previous run.
    ///
    /// A trade left `Selling` with no broadcast on record goes back to the
    /// status it had before the sell began.
    pub async fn load(&self) -> Result<usize> {
        let raw = self.store.hgetall(TRADES_KEY).await?;
        let mut loaded = HashMap::with_capacity(raw.len());
        let mut restored = Vec::new();
        for (id, json) in raw {
            match serde_json::from_str::<Trade>(&json) {
                Ok(mut trade) => {
                    if trade.status == TradeStatus::Selling && trade.pending_sell.is_none() {
                        trade.status = trade.status_before_sell.take().unwrap_or(TradeStatus::Open);
                        warn!("Trade {} was mid-sell at shutdown; restored to {}", id, trade.status);
                        restored.push(trade.clone());
                    }
                    loaded.insert(id, trade);
                }
                Err(e) => warn!("Skipping unreadable trade {}: {}", id, e),
            }
        }
        let count = loaded.len();
        *self.trades.write().await = loaded;
        for trade in &restored {
            self.persist(trade).await;
        }
        info!("Loaded {} trades from store", count);
        Ok(count)
    }

    async fn persist(&self, trade: &Trade) {
        let json = match serde_json::to_string(trade) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize trade {}: {}", trade.id, e);
                return;
            }
        };
        if let Err(e) = self.store.hset(TRADES_KEY, &trade.id, json).await {
            warn!("Failed to persist trade {}: {}", trade.id, e);
        }
    }

    pub async fn insert(&self, trade: Trade) {
        debug!("Recording trade {} ({})", trade.id, trade.status);
        self.trades
            .write()
            .await
            .insert(trade.id.clone(), trade.clone());
        self.persist(&trade).await;
    }

    pub async fn get(&self, id: &str) -> Option<Trade> {
        self.trades.read().await.get(id).cloned()
    }

    /// Mutate a trade in place and persist it
    pub async fn update<F>(&self, id: &str, f: F) -> Result<Trade>
    where
        F: FnOnce(&mut Trade),
    {
        let updated = {
            let mut trades = self.trades.write().await;
            let trade = trades
                .get_mut(id)
                .ok_or_else(|| Error::TradeNotFound(id.to_string()))?;
            f(trade);
            trade.clone()
        };
        self.persist(&updated).await;
        Ok(updated)
    }

    /// Atomically move an active trade to `Selling`.
    ///
    /// Returns `None` when the trade is not active, so two exit paths can
    /// never sell the same tokens twice.
    pub async fn begin_sell(&self, id: &str) -> Result<Option<Trade>> {
        let claimed = {
            let mut trades = self.trades.write().await;
            let trade = trades
                .get_mut(id)
                .ok_or_else(|| Error::TradeNotFound(id.to_string()))?;
            if !trade.status.is_active() {
                return Ok(None);
            }
            trade.status_before_sell = Some(trade.status);
            trade.status = TradeStatus::Selling;
            trade.clone()
        };
        self.persist(&claimed).await;
        Ok(Some(claimed))
    }

    /// Trades eligible for exits
    pub async fn active(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .await
            .values()
            .filter(|t| t.status.is_active())
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.opened_at);
        trades
    }

    /// Trades waiting on a receipt: broadcast buys and sells
    pub async fn in_flight(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .await
            .values()
            .filter(|t| t.awaiting_receipt().is_some())
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.opened_at);
        trades
    }

    /// Every trade, oldest first
    pub async fn all(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.trades.read().await.values().cloned().collect();
        trades.sort_by_key(|t| t.opened_at);
        trades
    }
}
