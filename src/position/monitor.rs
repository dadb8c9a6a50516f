//! Position monitor and exit execution
//!
//! WARNING: exits are best-effort. Positions are re-quoted on a fixed poll
//! interval, so a fast rug can gap through the stop loss between two ticks.

use alloy_primitives::{B256, U256};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::book::{u256_to_f64, u256_to_i128, PendingSell, Trade, TradeStatus};
use crate::chain::Receipt;
use crate::config::{ExitConfig, MonitorConfig};
use crate::error::{Error, Result};
use crate::events::{Event, TradeMonitorNotice, TradeNotice};
use crate::queue::{self, EnqueueOptions, SentJob, Settlement};
use crate::strategy::tracker::settle_buy;
use crate::strategy::{dex, Registry, Strategy, TradeContext};

/// Why a position is being sold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit1,
    TakeProfit2,
    MaxHold,
    /// Requested by the operator
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit1 => "take_profit_1",
            ExitReason::TakeProfit2 => "take_profit_2",
            ExitReason::MaxHold => "max_hold",
            ExitReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    Hold,
    Sell { percent: u8, reason: ExitReason },
}

/// Decide what to do with `trade` valued at `value_wei`.
///
/// Checked in order: stop loss, trailing stop (only in profit), take-profit 1
/// (while open), take-profit 2 (after the first take-profit), max hold time.
/// Manual-mode trades only react to the PnL crossing the stop loss between
/// the previous observation and this one.
pub fn evaluate_exit(
    trade: &Trade,
    exits: &ExitConfig,
    value_wei: U256,
    previous_pnl: Option<f64>,
    now: DateTime<Utc>,
) -> ExitAction {
    let pnl = trade.pnl_pct(value_wei);
    let stop = -exits.stop_loss_pct;
    let sell_all = |reason| ExitAction::Sell {
        percent: 100,
        reason,
    };

    if trade.manual_mode {
        return match previous_pnl {
            Some(prev) if exits.stop_loss_pct > 0.0 && prev > stop && pnl <= stop => {
                sell_all(ExitReason::StopLoss)
            }
            _ => ExitAction::Hold,
        };
    }

    if exits.stop_loss_pct > 0.0 && pnl <= stop {
        return sell_all(ExitReason::StopLoss);
    }

    if exits.trailing_stop_pct > 0.0 && pnl > 0.0 && !trade.highest_value_wei.is_zero() {
        let highest = u256_to_f64(trade.highest_value_wei);
        let drop = (highest - u256_to_f64(value_wei)) / highest * 100.0;
        if drop >= exits.trailing_stop_pct {
            return sell_all(ExitReason::TrailingStop);
        }
    }

    if trade.status == TradeStatus::Open && exits.take_profit1_pct > 0.0 && pnl >= exits.take_profit1_pct {
        return ExitAction::Sell {
            percent: 50,
            reason: ExitReason::TakeProfit1,
        };
    }

    if trade.status == TradeStatus::PartialTp1
        && exits.take_profit2_pct > 0.0
        && pnl >= exits.take_profit2_pct
    {
        return sell_all(ExitReason::TakeProfit2);
    }

    if exits.max_hold_secs > 0 {
        let held = now.signed_duration_since(trade.opened_at).num_seconds();
        if held >= exits.max_hold_secs as i64 {
            return sell_all(ExitReason::MaxHold);
        }
    }

    ExitAction::Hold
}

/// Watches open trades and executes their exits
pub struct PositionMonitor {
    ctx: Arc<TradeContext>,
    registry: Arc<Registry>,
    config: MonitorConfig,
}

impl PositionMonitor {
    pub fn new(ctx: Arc<TradeContext>, registry: Arc<Registry>, config: MonitorConfig) -> Self {
        Self {
            ctx,
            registry,
            config,
        }
    }

    /// Poll until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Position monitor disabled");
            return;
        }
        info!("Position monitor polling every {}ms", self.config.poll_interval_ms);

        let mut tick = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.tick().await;
        }
        info!("Position monitor stopped");
    }

    /// Check every active trade once. Returns the number of sells executed.
    pub async fn tick(&self) -> usize {
        self.settle_in_flight().await;

        let mut sells = 0;
        for trade in self.ctx.trades.active().await {
            let id = trade.id.clone();
            match self.check(trade).await {
                Ok(true) => sells += 1,
                Ok(false) => {}
                Err(e) => warn!("Monitor check for trade {} failed: {}", id, e),
            }
        }
        sells
    }

    /// Settle buys and sells whose receipt appeared after their confirmation
    /// wait gave up
    async fn settle_in_flight(&self) {
        for trade in self.ctx.trades.in_flight().await {
            let Some(hash) = trade.awaiting_receipt() else {
                continue;
            };
            let receipt = match self.ctx.client.get_transaction_receipt(hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Receipt check for trade {} failed: {}", trade.id, e);
                    continue;
                }
            };

            let settled = if trade.status == TradeStatus::Pending {
                settle_buy(&self.ctx, &trade.id, &receipt).await.map(|_| ())
            } else if receipt.status {
                self.finish_sell(&trade.id, &receipt).await.map(|_| ())
            } else {
                warn!("Sell {} for trade {} reverted", hash, trade.id);
                self.restore_after_sell(&trade.id, Some(hash)).await.map(|_| ())
            };
            if let Err(e) = settled {
                warn!("Settling trade {} failed: {}", trade.id, e);
            }
        }
    }

    fn strategy_for(&self, trade: &Trade) -> Result<Arc<dyn Strategy>> {
        self.registry
            .get(&trade.strategy_id)
            .ok_or_else(|| Error::StrategyNotFound(trade.strategy_id.clone()))
    }

    async fn check(&self, trade: Trade) -> Result<bool> {
        let strategy = self.strategy_for(&trade)?;
        let value = strategy.quote_exit(&trade).await?;
        let pnl = trade.pnl_pct(value);
        let highest = trade.highest_value_wei.max(value);

        self.ctx.events.emit(Event::TradeMonitor(TradeMonitorNotice {
            trade_id: trade.id.clone(),
            strategy_id: trade.strategy_id.clone(),
            token: trade.token,
            value_wei: value,
            cost_wei: trade.remaining_cost_wei(),
            pnl_pct: pnl,
            highest_value_wei: highest,
        }));

        let previous_pnl = trade.last_pnl_pct;
        let observed = self
            .ctx
            .trades
            .update(&trade.id, |t| {
                t.highest_value_wei = highest;
                t.last_pnl_pct = Some(pnl);
            })
            .await?;

        let exits = strategy.settings().exits;
        match evaluate_exit(&observed, &exits, value, previous_pnl, Utc::now()) {
            ExitAction::Hold => Ok(false),
            ExitAction::Sell { percent, reason } => {
                info!(
                    "Trade {} at {:.2}% PnL: selling {}% ({})",
                    trade.id, pnl, percent, reason
                );
                Ok(self.sell(&trade.id, percent, reason, false).await?.is_some())
            }
        }
    }

    /// Sell `percent` of a trade's remaining tokens.
    ///
    /// Returns `None` when the trade is not active (already closed or another
    /// sell is in flight). A sell that broadcast but was not confirmed in time
    /// leaves the trade `Selling` until its receipt shows up. `priority` jobs
    /// skip the signer's queue chain.
    pub async fn sell(
        &self,
        trade_id: &str,
        percent: u8,
        reason: ExitReason,
        priority: bool,
    ) -> Result<Option<Trade>> {
        let Some(trade) = self.ctx.trades.begin_sell(trade_id).await? else {
            debug!("Trade {} not sellable right now", trade_id);
            return Ok(None);
        };

        let sent = match self.send_sell(&trade, percent.clamp(1, 100), reason, priority).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Sell of trade {} failed: {}", trade_id, e);
                self.restore_after_sell(trade_id, None).await?;
                return Err(e);
            }
        };

        let hash = sent.hash;
        match sent.settled().await {
            Settlement::Mined(receipt) => self.finish_sell(trade_id, &receipt).await.map(Some),
            Settlement::Reverted(_) => {
                warn!("Sell {} for trade {} reverted", hash, trade_id);
                self.restore_after_sell(trade_id, Some(hash)).await?;
                Err(Error::Reverted {
                    hash: hash.to_string(),
                })
            }
            Settlement::Unknown(why) => {
                warn!(
                    "Sell {} for trade {} not confirmed ({}); holding it as selling",
                    hash, trade_id, why
                );
                self.ctx
                    .trades
                    .get(trade_id)
                    .await
                    .ok_or_else(|| Error::TradeNotFound(trade_id.to_string()))
                    .map(Some)
            }
        }
    }

    /// Broadcast the approval (if needed) and the sell, recording the sell
    /// on the trade. An error means the sell never reached the node.
    async fn send_sell(
        &self,
        trade: &Trade,
        percent: u8,
        reason: ExitReason,
        priority: bool,
    ) -> Result<SentJob> {
        let strategy = self.strategy_for(trade)?;
        let amount = if percent >= 100 {
            trade.token_amount
        } else {
            trade.token_amount * U256::from(percent) / U256::from(100u8)
        };
        if amount.is_zero() {
            return Err(Error::Strategy(format!("trade {} has nothing to sell", trade.id)));
        }

        let plan = strategy.build_sell(trade, amount).await?;
        let options = |label: String, action: &str| {
            let opts = EnqueueOptions::new(label).trade(&trade.id).action(action);
            if priority {
                opts.priority()
            } else {
                opts
            }
        };

        let queue = &self.ctx.queue;
        if let Some(approve) = plan.approve {
            let sent = queue
                .enqueue(
                    self.ctx.signer,
                    queue::fixed(approve),
                    options(format!("approve:{}", trade.id), "approve"),
                )
                .await?;
            debug!("Approval for trade {} sent: {}", trade.id, sent.hash());
        }

        let sent = queue
            .enqueue(
                self.ctx.signer,
                queue::fixed(plan.sell),
                options(format!("sell:{}:{}", trade.id, reason), "sell"),
            )
            .into_sent()
            .await?;

        let pending = PendingSell {
            hash: sent.hash,
            token_amount: amount,
            expected_out_wei: plan.expected_out_wei,
            router: plan.router,
            reason: reason.as_str().to_string(),
        };
        self.ctx
            .trades
            .update(&trade.id, |t| t.pending_sell = Some(pending))
            .await?;
        Ok(sent)
    }

    /// Book a mined sell. A trade no longer waiting on `receipt` is returned
    /// unchanged.
    async fn finish_sell(&self, trade_id: &str, receipt: &Receipt) -> Result<Trade> {
        let hash = receipt.transaction_hash;
        let (weth, signer) = (self.ctx.weth, self.ctx.signer);
        let mut booked = None;

        let updated = self
            .ctx
            .trades
            .update(trade_id, |t| {
                if t.status != TradeStatus::Selling
                    || t.pending_sell.as_ref().map(|p| p.hash) != Some(hash)
                {
                    return;
                }
                let Some(pending) = t.pending_sell.take() else {
                    return;
                };

                let mut proceeds = dex::received_weth(receipt, weth, signer, pending.router);
                if proceeds.is_zero() {
                    proceeds = pending.expected_out_wei;
                }
                let before = t.token_amount;
                let amount = pending.token_amount.min(before);
                let cost = t.cost_of(amount);
                let remaining = before - amount;
                let previous = t.status_before_sell.take().unwrap_or(TradeStatus::Open);

                t.token_amount = remaining;
                t.proceeds_wei += proceeds;
                t.highest_value_wei = if before.is_zero() {
                    U256::ZERO
                } else {
                    t.highest_value_wei * remaining / before
                };
                if remaining.is_zero() {
                    t.status = TradeStatus::Closed;
                    t.closed_at = Some(Utc::now());
                } else if pending.reason == ExitReason::TakeProfit1.as_str() {
                    t.status = TradeStatus::PartialTp1;
                } else {
                    t.status = previous;
                }
                booked = Some((amount, cost, proceeds, remaining.is_zero(), pending.reason));
            })
            .await?;

        let Some((amount, cost, proceeds, closed, reason)) = booked else {
            return Ok(updated);
        };

        let ledger = &self.ctx.ledger;
        ledger.sub_active_eth(&updated.strategy_id, cost);
        ledger.add_realized_pnl(&updated.strategy_id, u256_to_i128(proceeds) - u256_to_i128(cost));
        if closed {
            ledger.release(&updated.strategy_id);
        }

        info!(
            "Sold {} of {} for trade {} ({}), proceeds {} wei",
            amount, updated.token, trade_id, reason, proceeds
        );
        self.ctx.events.emit(Event::TradeSell(TradeNotice {
            trade_id: trade_id.to_string(),
            strategy_id: updated.strategy_id.clone(),
            token: updated.token,
            amount_wei: proceeds,
            hash: Some(hash),
            reason: Some(reason),
        }));
        Ok(updated)
    }

    /// Put a `Selling` trade back to its previous status. `sent` is the sell
    /// being abandoned, `None` when nothing was broadcast.
    async fn restore_after_sell(&self, trade_id: &str, sent: Option<B256>) -> Result<Trade> {
        self.ctx
            .trades
            .update(trade_id, |t| {
                if t.status == TradeStatus::Selling && t.pending_sell.as_ref().map(|p| p.hash) == sent {
                    t.status = t.status_before_sell.take().unwrap_or(TradeStatus::Open);
                    t.pending_sell = None;
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::{tx_hash, MockChain};
    use crate::strategy::dex::test_logs::transfer;
    use crate::strategy::dex::{IERC20, IUniswapV2Router};
    use crate::strategy::testing::{context, tracker_config};
    use crate::strategy::build_strategy;
    use alloy_primitives::{Address, Bytes};
    use alloy_sol_types::SolCall;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn exits() -> ExitConfig {
        ExitConfig {
            take_profit1_pct: 50.0,
            take_profit2_pct: 100.0,
            stop_loss_pct: 30.0,
            trailing_stop_pct: 20.0,
            max_hold_secs: 0,
        }
    }

    fn trade(status: TradeStatus) -> Trade {
        let mut t = Trade::pending(
            "t1".into(),
            "v2".into(),
            "uniswap_v2".into(),
            Address::repeat_byte(0x42),
            Address::repeat_byte(0x55),
            None,
            U256::from(1_000u64),
            B256::ZERO,
            false,
        );
        t.status = status;
        t.initial_token_amount = U256::from(1_000u64);
        t.token_amount = U256::from(1_000u64);
        t.highest_value_wei = U256::from(1_000u64);
        t
    }

    fn wei(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn test_exit_order() {
        let now = Utc::now();
        let open = trade(TradeStatus::Open);

        assert_eq!(
            evaluate_exit(&open, &exits(), wei(700), None, now),
            ExitAction::Sell { percent: 100, reason: ExitReason::StopLoss }
        );
        assert_eq!(evaluate_exit(&open, &exits(), wei(1_200), None, now), ExitAction::Hold);
        assert_eq!(
            evaluate_exit(&open, &exits(), wei(1_500), None, now),
            ExitAction::Sell { percent: 50, reason: ExitReason::TakeProfit1 }
        );

        // TP2 only after TP1
        assert_eq!(
            evaluate_exit(&open, &exits(), wei(2_000), None, now),
            ExitAction::Sell { percent: 50, reason: ExitReason::TakeProfit1 }
        );
        let partial = trade(TradeStatus::PartialTp1);
        assert_eq!(
            evaluate_exit(&partial, &exits(), wei(2_000), None, now),
            ExitAction::Sell { percent: 100, reason: ExitReason::TakeProfit2 }
        );
        assert_eq!(evaluate_exit(&partial, &exits(), wei(1_900), None, now), ExitAction::Hold);
    }

    #[test]
    fn test_trailing_stop_only_in_profit() {
        let now = Utc::now();
        let mut t = trade(TradeStatus::PartialTp1);
        t.highest_value_wei = wei(1_900);
        // 1400 is +40% but 26% below the peak
        assert_eq!(
            evaluate_exit(&t, &exits(), wei(1_400), None, now),
            ExitAction::Sell { percent: 100, reason: ExitReason::TrailingStop }
        );
        // Below cost the trailing stop is inactive and the stop loss is not hit
        assert_eq!(evaluate_exit(&t, &exits(), wei(900), None, now), ExitAction::Hold);
    }

    #[test]
    fn test_max_hold() {
        let mut config = exits();
        config.max_hold_secs = 60;
        let t = trade(TradeStatus::Open);
        let later = t.opened_at + chrono::Duration::seconds(61);
        assert_eq!(
            evaluate_exit(&t, &config, wei(1_000), None, later),
            ExitAction::Sell { percent: 100, reason: ExitReason::MaxHold }
        );
        assert_eq!(evaluate_exit(&t, &config, wei(1_000), None, t.opened_at), ExitAction::Hold);
    }

    #[test]
    fn test_manual_mode_requires_crossing() {
        let now = Utc::now();
        let mut t = trade(TradeStatus::Open);
        t.manual_mode = true;

        // First observation never acts, even far below the stop
        assert_eq!(evaluate_exit(&t, &exits(), wei(500), None, now), ExitAction::Hold);
        // Already below on the previous tick: no crossing
        assert_eq!(evaluate_exit(&t, &exits(), wei(500), Some(-40.0), now), ExitAction::Hold);
        // Crossing from above
        assert_eq!(
            evaluate_exit(&t, &exits(), wei(700), Some(-10.0), now),
            ExitAction::Sell { percent: 100, reason: ExitReason::StopLoss }
        );
        // Take-profits are left to the operator
        assert_eq!(evaluate_exit(&t, &exits(), wei(3_000), Some(10.0), now), ExitAction::Hold);
    }

    struct Harness {
        chain: Arc<MockChain>,
        ctx: Arc<TradeContext>,
        monitor: PositionMonitor,
        value: Arc<AtomicU64>,
    }

    /// V2 tracker `v2` with one open trade `t1` (1000 tokens for 1000 wei).
    /// The router quotes whatever `value` holds; allowance is always zero.
    async fn harness() -> Harness {
        let chain = Arc::new(MockChain::new());
        let value = Arc::new(AtomicU64::new(1_000));
        let quoted = value.clone();
        chain.state.lock().unwrap().call_handler = Some(Arc::new(
            move |_to: Address, data: &Bytes| -> Result<Bytes> {
                let selector = &data[..4];
                if selector == IUniswapV2Router::getAmountsOutCall::SELECTOR {
                    let out = vec![U256::ZERO, U256::from(quoted.load(Ordering::SeqCst))];
                    Ok(IUniswapV2Router::getAmountsOutCall::abi_encode_returns(&(out,)).into())
                } else if selector == IERC20::allowanceCall::SELECTOR {
                    Ok(IERC20::allowanceCall::abi_encode_returns(&(U256::ZERO,)).into())
                } else {
                    Err(Error::Rpc("execution reverted".into()))
                }
            },
        ));

        let ctx = context(chain.clone());
        let registry = Arc::new(Registry::new(ctx.ledger.clone()));
        registry
            .register(build_strategy(tracker_config("v2", "uniswap_v2"), ctx.clone()).unwrap())
            .unwrap();
        ctx.ledger.reserve("v2", wei(1_000)).unwrap();
        ctx.ledger.add_active_eth("v2", wei(1_000));
        ctx.trades.insert(trade(TradeStatus::Open)).await;

        let monitor = PositionMonitor::new(ctx.clone(), registry, MonitorConfig::default());
        Harness {
            chain,
            ctx,
            monitor,
            value,
        }
    }

    #[tokio::test]
    async fn test_take_profit_then_stop_loss() {
        let h = harness().await;
        let mut events = h.ctx.events.subscribe();

        h.value.store(1_600, Ordering::SeqCst);
        assert_eq!(h.monitor.tick().await, 1);

        // Approval plus sell
        assert_eq!(h.chain.sent().len(), 2);
        let t = h.ctx.trades.get("t1").await.unwrap();
        assert_eq!(t.status, TradeStatus::PartialTp1);
        assert_eq!(t.token_amount, wei(500));
        assert_eq!(t.proceeds_wei, wei(1_600));
        let entry = h.ctx.ledger.entry("v2").unwrap();
        assert_eq!(entry.counters.active_exposure_wei, wei(500));
        assert_eq!(entry.counters.realized_pnl_wei, 1_100);
        assert_eq!(entry.counters.open_trades, 1);

        h.value.store(100, Ordering::SeqCst);
        assert_eq!(h.monitor.tick().await, 1);
        let t = h.ctx.trades.get("t1").await.unwrap();
        assert_eq!(t.status, TradeStatus::Closed);
        assert!(t.closed_at.is_some());
        let entry = h.ctx.ledger.entry("v2").unwrap();
        assert_eq!(entry.counters.active_exposure_wei, U256::ZERO);
        assert_eq!(entry.counters.open_trades, 0);
        assert_eq!(entry.counters.realized_pnl_wei, 1_100 - 400);
        assert!(h.ctx.trades.active().await.is_empty());

        let mut reasons = Vec::new();
        let mut monitored = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::TradeSell(n) => reasons.push(n.reason.unwrap()),
                Event::TradeMonitor(_) => monitored += 1,
                _ => {}
            }
        }
        assert_eq!(reasons, vec!["take_profit_1", "stop_loss"]);
        assert_eq!(monitored, 2);
    }

    #[tokio::test]
    async fn test_hold_records_observation() {
        let h = harness().await;
        h.value.store(1_200, Ordering::SeqCst);
        assert_eq!(h.monitor.tick().await, 0);
        let t = h.ctx.trades.get("t1").await.unwrap();
        assert_eq!(t.last_pnl_pct, Some(20.0));
        assert_eq!(t.highest_value_wei, wei(1_200));
        assert!(h.chain.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sell_restores_status() {
        let h = harness().await;
        h.chain.fail_next_sends(["insufficient funds for gas * price + value"]);

        let err = h.monitor.sell("t1", 100, ExitReason::Manual, true).await;
        assert!(err.is_err());
        let t = h.ctx.trades.get("t1").await.unwrap();
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.token_amount, wei(1_000));
        assert_eq!(h.ctx.ledger.entry("v2").unwrap().counters.open_trades, 1);
    }

    fn mined(hash: B256, status: bool, logs: Vec<crate::chain::Log>) -> Receipt {
        Receipt {
            transaction_hash: hash,
            block_number: 101,
            status,
            from: crate::strategy::testing::signer(),
            to: Some(Address::repeat_byte(0x70)),
            gas_used: None,
            logs,
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_sell_is_not_resold() {
        let h = harness().await;
        h.chain.state.lock().unwrap().auto_mine = false;
        h.value.store(100, Ordering::SeqCst);

        // Broadcast, then the confirmation wait runs out
        assert_eq!(h.monitor.tick().await, 1);
        assert_eq!(h.chain.sent().len(), 2);
        let t = h.ctx.trades.get("t1").await.unwrap();
        assert_eq!(t.status, TradeStatus::Selling);
        assert_eq!(t.token_amount, wei(1_000));
        let sell_hash = tx_hash(1_002);
        assert_eq!(t.pending_sell.as_ref().map(|p| p.hash), Some(sell_hash));

        // Nothing new goes out while the sell is unsettled
        assert_eq!(h.monitor.tick().await, 0);
        assert_eq!(h.chain.sent().len(), 2);
        assert_eq!(h.ctx.ledger.entry("v2").unwrap().counters.open_trades, 1);

        // The receipt lands later and the next tick books it
        h.chain.insert_receipt(mined(sell_hash, true, vec![]));
        assert_eq!(h.monitor.tick().await, 0);
        let t = h.ctx.trades.get("t1").await.unwrap();
        assert_eq!(t.status, TradeStatus::Closed);
        assert!(t.pending_sell.is_none());
        assert_eq!(t.proceeds_wei, wei(100));
        let entry = h.ctx.ledger.entry("v2").unwrap();
        assert_eq!(entry.counters.open_trades, 0);
        assert_eq!(entry.counters.active_exposure_wei, U256::ZERO);
        assert_eq!(entry.counters.realized_pnl_wei, -900);
        assert_eq!(h.chain.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_reverted_sell_restores_status() {
        let h = harness().await;
        h.chain.state.lock().unwrap().auto_mine = false;

        let (result, _) = tokio::join!(
            h.monitor.sell("t1", 100, ExitReason::Manual, true),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                h.chain.insert_receipt(mined(tx_hash(1_002), false, vec![]));
            }
        );
        assert!(matches!(result, Err(Error::Reverted { .. })));

        let t = h.ctx.trades.get("t1").await.unwrap();
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.token_amount, wei(1_000));
        assert!(t.pending_sell.is_none());
        assert!(t.status_before_sell.is_none());
        let entry = h.ctx.ledger.entry("v2").unwrap();
        assert_eq!(entry.counters.open_trades, 1);
        assert_eq!(entry.counters.active_exposure_wei, wei(1_000));
    }

    #[tokio::test]
    async fn test_tick_settles_pending_buy() {
        let h = harness().await;
        let buy_hash = B256::repeat_byte(0x77);
        let mut pending = trade(TradeStatus::Pending);
        pending.id = "t2".into();
        pending.initial_token_amount = U256::ZERO;
        pending.token_amount = U256::ZERO;
        pending.highest_value_wei = U256::ZERO;
        pending.buy_tx = Some(buy_hash);
        h.ctx.trades.insert(pending).await;
        h.ctx.ledger.reserve("v2", wei(1_000)).unwrap();
        h.ctx.ledger.add_active_eth("v2", wei(1_000));

        // Not mined yet
        h.monitor.tick().await;
        assert_eq!(h.ctx.trades.get("t2").await.unwrap().status, TradeStatus::Pending);

        let token = Address::repeat_byte(0x42);
        let signer = crate::strategy::testing::signer();
        let log = transfer(token, Address::repeat_byte(0x55), signer, wei(2_000), buy_hash);
        h.chain.insert_receipt(mined(buy_hash, true, vec![log]));
        h.monitor.tick().await;

        let t = h.ctx.trades.get("t2").await.unwrap();
        assert_eq!(t.status, TradeStatus::Open);
        assert_eq!(t.token_amount, wei(2_000));
        let entry = h.ctx.ledger.entry("v2").unwrap();
        assert_eq!(entry.counters.open_trades, 2);
        assert_eq!(entry.counters.active_exposure_wei, wei(2_000));
    }

    #[tokio::test]
    async fn test_manual_sell_and_double_sell() {
        let h = harness().await;
        let sold = h.monitor.sell("t1", 100, ExitReason::Manual, true).await.unwrap();
        assert_eq!(sold.unwrap().status, TradeStatus::Closed);
        // Closed trades are not sellable
        assert!(h.monitor.sell("t1", 100, ExitReason::Manual, true).await.unwrap().is_none());
        assert!(h.monitor.sell("missing", 100, ExitReason::Manual, true).await.is_err());
    }
}
