//! Exposure ledger
//!
//! Per-strategy counters (open trades, historical trade count, active ETH
//! exposure, realized PnL) and the reservation protocol used at detection
//! time. All checks and increments happen under one synchronous lock with no
//! suspension point in between, so concurrent detections for the same
//! strategy cannot both pass a limit.
//!
//! Every mutation bumps a change counter; a writer task persists the full
//! snapshot to the store behind the caller's back. A crash between a mutation
//! and the next write loses that delta.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::KvStore;

/// Store key holding the serialized strategy set
pub const LEDGER_KEY: &str = "strategies:ledger";

/// Configured limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyLimits {
    pub max_trades: u32,
    pub max_active_buy_wei: U256,
}

/// Live counters for one strategy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyCounters {
    /// Trades reserved and not yet closed or rolled back
    pub open_trades: u32,
    /// Every successful reservation ever made; never decremented
    pub trades_count: u64,
    pub active_exposure_wei: U256,
    pub realized_pnl_wei: i128,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub limits: StrategyLimits,
    pub counters: StrategyCounters,
}

impl StrategyEntry {
    fn can_trade(&self) -> bool {
        self.limits.max_trades == 0 || self.counters.open_trades < self.limits.max_trades
    }

    fn can_buy(&self, amount_wei: U256) -> bool {
        self.limits.max_active_buy_wei.is_zero()
            || self
                .counters
                .active_exposure_wei
                .saturating_add(amount_wei)
                <= self.limits.max_active_buy_wei
    }
}

/// Why a reservation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveRejection {
    MaxTradesReached,
    MaxActiveBuyEth,
}

impl ReserveRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReserveRejection::MaxTradesReached => "max_trades_reached",
            ReserveRejection::MaxActiveBuyEth => "maxActiveBuyEth",
        }
    }
}

impl std::fmt::Display for ReserveRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized form of the whole strategy set
pub type LedgerSnapshot = BTreeMap<String, StrategyEntry>;

/// Sole owner of the per-strategy counters
pub struct ExposureLedger {
    entries: Mutex<HashMap<String, StrategyEntry>>,
    changes: watch::Sender<u64>,
}

impl ExposureLedger {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            entries: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StrategyEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn touched(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Apply `f` to the entry for `id`, creating it when missing
    fn mutate<T>(&self, id: &str, f: impl FnOnce(&mut StrategyEntry) -> T) -> T {
        let out = {
            let mut entries = self.lock();
            f(entries.entry(id.to_string()).or_default())
        };
        self.touched();
        out
    }

    /// Install or update the limits for a strategy, keeping its counters
    pub fn set_limits(&self, id: &str, limits: StrategyLimits) {
        self.mutate(id, |entry| entry.limits = limits);
    }

    pub fn can_trade(&self, id: &str) -> bool {
        self.lock().get(id).map_or(true, StrategyEntry::can_trade)
    }

    pub fn can_buy(&self, id: &str, amount_wei: U256) -> bool {
        self.lock().get(id).map_or(true, |e| e.can_buy(amount_wei))
    }

    /// Check both limits and, on success, take a trade slot.
    ///
    /// A rejection leaves every counter untouched.
    pub fn reserve(&self, id: &str, amount_wei: U256) -> std::result::Result<(), ReserveRejection> {
        let result = {
            let mut entries = self.lock();
            let entry = entries.entry(id.to_string()).or_default();
            if !entry.can_trade() {
                Err(ReserveRejection::MaxTradesReached)
            } else if !entry.can_buy(amount_wei) {
                Err(ReserveRejection::MaxActiveBuyEth)
            } else {
                entry.counters.open_trades += 1;
                entry.counters.trades_count += 1;
                Ok(())
            }
        };
        match result {
            Ok(()) => {
                self.touched();
                debug!("Reserved trade slot for {} ({} wei)", id, amount_wei);
            }
            Err(reason) => debug!("Reservation refused for {}: {}", id, reason),
        }
        result
    }

    /// Undo a reservation whose buy never went through
    pub fn rollback(&self, id: &str) {
        self.mutate(id, |entry| {
            entry.counters.open_trades = entry.counters.open_trades.saturating_sub(1);
        });
        debug!("Rolled back trade slot for {}", id);
    }

    /// Free the slot of a fully closed trade
    pub fn release(&self, id: &str) {
        self.mutate(id, |entry| {
            entry.counters.open_trades = entry.counters.open_trades.saturating_sub(1);
        });
    }

    pub fn add_active_eth(&self, id: &str, amount_wei: U256) {
        self.mutate(id, |entry| {
            entry.counters.active_exposure_wei =
                entry.counters.active_exposure_wei.saturating_add(amount_wei);
        });
    }

    /// Floors at zero
    pub fn sub_active_eth(&self, id: &str, amount_wei: U256) {
        self.mutate(id, |entry| {
            entry.counters.active_exposure_wei =
                entry.counters.active_exposure_wei.saturating_sub(amount_wei);
        });
    }

    pub fn add_realized_pnl(&self, id: &str, pnl_wei: i128) {
        self.mutate(id, |entry| {
            entry.counters.realized_pnl_wei = entry.counters.realized_pnl_wei.saturating_add(pnl_wei);
        });
    }

    pub fn entry(&self, id: &str) -> Option<StrategyEntry> {
        self.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Load counters persisted by a previous run. Limits from the current
    /// configuration win over persisted ones.
    pub async fn restore(&self, store: &dyn KvStore) -> Result<usize> {
        let Some(raw) = store.get(LEDGER_KEY).await? else {
            return Ok(0);
        };
        let snapshot: LedgerSnapshot = serde_json::from_str(&raw)?;
        let restored = snapshot.len();
        {
            let mut entries = self.lock();
            for (id, persisted) in snapshot {
                let entry = entries.entry(id).or_insert_with(|| StrategyEntry {
                    limits: persisted.limits,
                    counters: StrategyCounters::default(),
                });
                entry.counters = persisted.counters;
            }
        }
        info!("Restored ledger counters for {} strategies", restored);
        Ok(restored)
    }

    async fn persist(&self, store: &dyn KvStore) {
        let snapshot = self.snapshot();
        match serde_json::to_string(&snapshot) {
            Ok(json) => {
                if let Err(e) = store.set(LEDGER_KEY, json).await {
                    warn!("Failed to persist ledger: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize ledger: {}", e),
        }
    }

    /// Spawn the write-behind task. Bursts of mutations coalesce into one
    /// write; a final write runs on cancellation.
    pub fn spawn_writer(
        self: &Arc<Self>,
        store: Arc<dyn KvStore>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let ledger = self.clone();
        let mut rx = self.changes.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        rx.borrow_and_update();
                        ledger.persist(store.as_ref()).await;
                    }
                }
            }
            ledger.persist(store.as_ref()).await;
            debug!("Ledger writer stopped");
        })
    }
}

impl Default for ExposureLedger {
    fn default() -> Self {
        Self::new()
    }
}
