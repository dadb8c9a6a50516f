//! Engine events
//!
//! Everything observable (queue phases, detections, trades) is published on
//! an [`EventBus`]. Dashboards and notifiers subscribe; the engine never waits
//! for them.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queue phase notification payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxNotice {
    pub address: Address,
    pub hash: B256,
    pub label: String,
    pub nonce: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
}

/// Queue failure payload. `hash` is absent when the broadcast itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxErrorNotice {
    pub address: Address,
    pub hash: Option<B256>,
    pub label: String,
    pub phase: TxPhase,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxPhase {
    Broadcast,
    Confirmation,
}

/// Per-strategy detection outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionNotice {
    pub tx_hash: B256,
    pub strategy_id: String,
    pub protocol: String,
    pub pass: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub block_number: u64,
    pub pool: Address,
    pub token0: Address,
    pub token1: Address,
    pub target_token: Option<Address>,
}

/// Per-transaction aggregate over every strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionTxNotice {
    pub tx_hash: B256,
    pub block_number: u64,
    pub pass: bool,
    pub primary_token: Option<Address>,
    /// Strategies that matched
    pub matched: Vec<String>,
    /// Strategy whose `process` was invoked
    pub winner: Option<String>,
}

/// Trade lifecycle payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeNotice {
    pub trade_id: String,
    pub strategy_id: String,
    pub token: Address,
    pub amount_wei: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Skipped buy payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSkipNotice {
    pub strategy_id: String,
    pub tx_hash: B256,
    pub token: Option<Address>,
    pub reason: String,
}

/// Periodic position valuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMonitorNotice {
    pub trade_id: String,
    pub strategy_id: String,
    pub token: Address,
    pub value_wei: U256,
    pub cost_wei: U256,
    pub pnl_pct: f64,
    pub highest_value_wei: U256,
}

/// Every event the engine emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Event {
    #[serde(rename = "tx:sent")]
    TxSent(TxNotice),
    #[serde(rename = "tx:confirmed")]
    TxConfirmed(TxNotice),
    #[serde(rename = "tx:error")]
    TxError(TxErrorNotice),
    #[serde(rename = "detection")]
    Detection(DetectionNotice),
    #[serde(rename = "detection:tx")]
    DetectionTx(DetectionTxNotice),
    #[serde(rename = "trade:buy")]
    TradeBuy(TradeNotice),
    #[serde(rename = "trade:sell")]
    TradeSell(TradeNotice),
    #[serde(rename = "trade:skip")]
    TradeSkip(TradeSkipNotice),
    #[serde(rename = "trade:monitor")]
    TradeMonitor(TradeMonitorNotice),
}

impl Event {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Event::TxSent(_) => "tx:sent",
            Event::TxConfirmed(_) => "tx:confirmed",
            Event::TxError(_) => "tx:error",
            Event::Detection(_) => "detection",
            Event::DetectionTx(_) => "detection:tx",
            Event::TradeBuy(_) => "trade:buy",
            Event::TradeSell(_) => "trade:sell",
            Event::TradeSkip(_) => "trade:skip",
            Event::TradeMonitor(_) => "trade:monitor",
        }
    }
}

/// Fan-out channel for engine events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Log every event until cancelled
pub fn spawn_event_logger(bus: &EventBus, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event logger lagged, skipped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn log_event(event: &Event) {
    match event {
        Event::TxSent(n) => info!("[tx:sent] {} nonce={} hash={}", n.label, n.nonce, n.hash),
        Event::TxConfirmed(n) => info!(
            "[tx:confirmed] {} nonce={} hash={} block={}",
            n.label,
            n.nonce,
            n.hash,
            n.block_number.unwrap_or_default()
        ),
        Event::TxError(n) => warn!("[tx:error] {} ({:?}): {}", n.label, n.phase, n.error),
        Event::Detection(n) if n.pass => info!(
            "[detection] {} matched pool {} in {}",
            n.strategy_id, n.pool, n.tx_hash
        ),
        Event::Detection(n) => debug!(
            "[detection] {} rejected {}: {}",
            n.strategy_id,
            n.tx_hash,
            n.reason.as_deref().unwrap_or("-")
        ),
        Event::DetectionTx(n) => debug!(
            "[detection:tx] {} pass={} primary={:?} winner={:?}",
            n.tx_hash, n.pass, n.primary_token, n.winner
        ),
        Event::TradeBuy(n) => info!(
            "[trade:buy] {} {} token={} amount={}",
            n.strategy_id, n.trade_id, n.token, n.amount_wei
        ),
        Event::TradeSell(n) => info!(
            "[trade:sell] {} {} token={} amount={} {}",
            n.strategy_id,
            n.trade_id,
            n.token,
            n.amount_wei,
            n.reason.as_deref().unwrap_or("")
        ),
        Event::TradeSkip(n) => warn!("[trade:skip] {} {}: {}", n.strategy_id, n.tx_hash, n.reason),
        Event::TradeMonitor(n) => debug!(
            "[trade:monitor] {} value={} pnl={:.2}%",
            n.trade_id, n.value_wei, n.pnl_pct
        ),
    }
}
