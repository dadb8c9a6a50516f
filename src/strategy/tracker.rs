//! Pool-creation tracker shared by every protocol adapter
//!
//! [`PoolTracker`] owns the protocol-independent flow: find the factory's
//! pool-creation log, check the WETH side and the block list, reserve a slot,
//! buy through the queue, and quote/build exits. A [`PoolProtocol`] supplies
//! decoding, quoting and swap calldata.

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use super::dex::{self, apply_slippage};
use super::{DetectOptions, Detection, SellPlan, Strategy, TradeContext};
use crate::chain::{Log, LogFilter, Receipt, TransactionRequest};
use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::events::{Event, TradeNotice, TradeSkipNotice};
use crate::ledger::StrategyLimits;
use crate::position::{u256_to_i128, Trade, TradeStatus};
use crate::queue::{self, EnqueueOptions, SentJob, Settlement};

/// Decoded pool-creation event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEvent {
    pub token0: Address,
    pub token1: Address,
    pub pool: Address,
    pub fee: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// ETH in, token out
    Buy,
    /// Token in, ETH (or WETH) out
    Sell,
}

/// One swap against WETH
#[derive(Debug, Clone, Copy)]
pub struct Swap {
    pub side: Side,
    pub token: Address,
    pub fee: Option<u32>,
    pub amount_in: U256,
}

/// Protocol-specific part of a tracker
#[async_trait]
pub trait PoolProtocol: Send + Sync + 'static {
    fn tag(&self) -> &'static str;

    /// topic0 of the factory's pool-creation event
    fn creation_topic(&self) -> B256;

    fn decode_pool(&self, log: &Log) -> Result<PoolEvent>;

    /// Expected output of `swap`
    async fn quote(&self, ctx: &TradeContext, settings: &TrackerConfig, swap: Swap) -> Result<U256>;

    /// Swap transaction paying out to the signer
    fn swap_request(
        &self,
        ctx: &TradeContext,
        settings: &TrackerConfig,
        swap: Swap,
        min_out: U256,
    ) -> TransactionRequest;
}

/// Ledger limits implied by tracker settings
pub fn limits_of(settings: &TrackerConfig) -> StrategyLimits {
    StrategyLimits {
        max_trades: settings.max_trades,
        max_active_buy_wei: settings.max_active_buy_wei(),
    }
}

/// A [`Strategy`] watching one factory for new pools
pub struct PoolTracker<P> {
    id: String,
    protocol: P,
    settings: RwLock<TrackerConfig>,
    ctx: Arc<TradeContext>,
}

impl<P: PoolProtocol> PoolTracker<P> {
    pub fn new(protocol: P, settings: TrackerConfig, ctx: Arc<TradeContext>) -> Self {
        Self {
            id: settings.id.clone(),
            protocol,
            settings: RwLock::new(settings),
            ctx,
        }
    }

    fn current(&self) -> TrackerConfig {
        self.settings
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Undo the reservation and record why the buy did not happen
    async fn skip_buy(&self, detection: &Detection, trade_id: &str, reason: String) {
        if detection.reserved {
            self.ctx.ledger.rollback(&self.id);
        }
        let closed = self
            .ctx
            .trades
            .update(trade_id, |t| {
                t.status = TradeStatus::Failed;
                t.closed_at = Some(chrono::Utc::now());
            })
            .await;
        if let Err(e) = closed {
            warn!("Could not mark trade {} failed: {}", trade_id, e);
        }
        self.ctx.events.emit(Event::TradeSkip(TradeSkipNotice {
            strategy_id: self.id.clone(),
            tx_hash: detection.tx_hash,
            token: detection.target_token,
            reason,
        }));
    }

    /// Quote, build and broadcast the buy. An error means nothing reached
    /// the node.
    async fn send_buy(
        &self,
        settings: &TrackerConfig,
        detection: &Detection,
        token: Address,
        trade_id: &str,
    ) -> Result<SentJob> {
        let swap = Swap {
            side: Side::Buy,
            token,
            fee: detection.fee,
            amount_in: detection.amount_in_wei,
        };
        let expected = self.protocol.quote(&self.ctx, settings, swap).await?;
        if expected.is_zero() {
            return Err(Error::Strategy("quote returned zero output".into()));
        }
        let min_out = apply_slippage(expected, settings.slippage_bps);
        let mut request = self.protocol.swap_request(&self.ctx, settings, swap, min_out);
        request.gas_limit = Some(settings.gas_limit);

        self.ctx
            .queue
            .enqueue(
                self.ctx.signer,
                queue::fixed(request),
                EnqueueOptions::new(format!("buy:{}:{}", self.id, token))
                    .trade(trade_id)
                    .action("buy"),
            )
            .into_sent()
            .await
    }
}

/// Apply the mined outcome of a trade's buy.
///
/// Opens the position, or unwinds the ledger when the buy reverted or
/// delivered no tokens. Returns `None` when the trade was no longer waiting
/// on this receipt.
pub async fn settle_buy(
    ctx: &TradeContext,
    trade_id: &str,
    receipt: &Receipt,
) -> Result<Option<Trade>> {
    let trade = ctx
        .trades
        .get(trade_id)
        .await
        .ok_or_else(|| Error::TradeNotFound(trade_id.to_string()))?;
    let hash = receipt.transaction_hash;
    if trade.status != TradeStatus::Pending || trade.buy_tx != Some(hash) {
        return Ok(None);
    }

    let mut received = U256::ZERO;
    if receipt.status {
        received = dex::received_tokens(receipt, trade.token, ctx.signer);
        if received.is_zero() {
            received = dex::balance_of(ctx.client.as_ref(), trade.token, ctx.signer)
                .await
                .unwrap_or(U256::ZERO);
        }
    }

    let mut claimed = false;
    let updated = ctx
        .trades
        .update(trade_id, |t| {
            if t.status != TradeStatus::Pending {
                return;
            }
            claimed = true;
            if received.is_zero() {
                t.status = TradeStatus::Failed;
                t.closed_at = Some(chrono::Utc::now());
            } else {
                t.status = TradeStatus::Open;
                t.initial_token_amount = received;
                t.token_amount = received;
                t.highest_value_wei = t.amount_in_wei;
            }
        })
        .await?;
    if !claimed {
        return Ok(None);
    }

    let ledger = &ctx.ledger;
    let cost = trade.amount_in_wei;
    let skip = |reason: &str| {
        ctx.events.emit(Event::TradeSkip(TradeSkipNotice {
            strategy_id: trade.strategy_id.clone(),
            tx_hash: trade.detected_in,
            token: Some(trade.token),
            reason: reason.to_string(),
        }))
    };

    if !receipt.status {
        warn!("{}: buy {} for trade {} reverted", trade.strategy_id, hash, trade_id);
        ledger.sub_active_eth(&trade.strategy_id, cost);
        ledger.rollback(&trade.strategy_id);
        skip("buy_reverted");
    } else if received.is_zero() {
        warn!(
            "{}: buy {} confirmed but no {} received; booking trade {} as a loss",
            trade.strategy_id, hash, trade.token, trade_id
        );
        ledger.sub_active_eth(&trade.strategy_id, cost);
        ledger.add_realized_pnl(&trade.strategy_id, -u256_to_i128(cost));
        ledger.release(&trade.strategy_id);
        skip("no_tokens_received");
    } else {
        info!(
            "{}: bought {} of {} for {} wei ({})",
            trade.strategy_id, received, trade.token, cost, hash
        );
        ctx.events.emit(Event::TradeBuy(TradeNotice {
            trade_id: trade_id.to_string(),
            strategy_id: trade.strategy_id.clone(),
            token: trade.token,
            amount_wei: cost,
            hash: Some(hash),
            reason: None,
        }));
    }
    Ok(Some(updated))
}

#[async_trait]
impl<P: PoolProtocol> Strategy for PoolTracker<P> {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> String {
        self.current().display_name().to_string()
    }

    fn protocol(&self) -> &'static str {
        self.protocol.tag()
    }

    fn enabled(&self) -> bool {
        self.current().enabled
    }

    fn priority(&self) -> i32 {
        self.current().priority
    }

    fn log_filters(&self) -> Vec<LogFilter> {
        vec![LogFilter {
            address: Some(self.current().factory),
            topics: vec![self.protocol.creation_topic()],
        }]
    }

    fn settings(&self) -> TrackerConfig {
        self.current()
    }

    fn update_settings(&self, settings: TrackerConfig) -> Result<()> {
        if settings.id != self.id || settings.protocol != self.protocol.tag() {
            return Err(Error::Strategy(format!(
                "cannot change id/protocol of {} via settings update",
                self.id
            )));
        }
        *self.settings.write().unwrap_or_else(|p| p.into_inner()) = settings;
        Ok(())
    }

    async fn detect(&self, receipt: &Receipt, opts: DetectOptions) -> Result<Option<Detection>> {
        let settings = self.current();
        let topic = self.protocol.creation_topic();
        let Some(log) = receipt.logs.iter().find(|log| {
            !log.removed && log.address == settings.factory && log.topic0() == Some(topic)
        }) else {
            return Ok(None);
        };

        let pool = self.protocol.decode_pool(log)?;
        let mut detection = Detection {
            strategy_id: self.id.clone(),
            protocol: self.protocol.tag().to_string(),
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            token0: pool.token0,
            token1: pool.token1,
            pool: pool.pool,
            fee: pool.fee,
            target_token: None,
            amount_in_wei: settings.buy_amount_wei(),
            reason: None,
            reserved: false,
        };

        let weth = self.ctx.weth;
        let target = if pool.token0 == weth {
            pool.token1
        } else if pool.token1 == weth {
            pool.token0
        } else {
            return Ok(Some(detection.reject("no_weth_pair")));
        };
        detection.target_token = Some(target);

        if settings.blocked_tokens.contains(&target) {
            return Ok(Some(detection.reject("blocked_token")));
        }

        if opts.reserve {
            // Check and increment happen inside the ledger's lock
            match self.ctx.ledger.reserve(&self.id, detection.amount_in_wei) {
                Ok(()) => detection.reserved = true,
                Err(rejection) => return Ok(Some(detection.reject(rejection.as_str()))),
            }
        }

        debug!("{}: pool {} for token {} in {}", self.id, pool.pool, target, receipt.transaction_hash);
        Ok(Some(detection))
    }

    async fn process(&self, detection: Detection) -> Result<()> {
        let settings = self.current();
        let token = detection
            .target_token
            .ok_or_else(|| Error::Strategy("detection has no target token".into()))?;

        let trade_id = uuid::Uuid::new_v4().to_string();
        self.ctx
            .trades
            .insert(Trade::pending(
                trade_id.clone(),
                self.id.clone(),
                self.protocol.tag().to_string(),
                token,
                detection.pool,
                detection.fee,
                detection.amount_in_wei,
                detection.tx_hash,
                settings.manual_mode,
            ))
            .await;

        if self.ctx.dry_run {
            info!("[dry-run] {} would buy {} in pool {}", self.id, token, detection.pool);
            self.skip_buy(&detection, &trade_id, "dry_run".into()).await;
            return Ok(());
        }

        let sent = match self.send_buy(&settings, &detection, token, &trade_id).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("{}: buy of {} failed: {}", self.id, token, e);
                self.skip_buy(&detection, &trade_id, e.to_string()).await;
                return Err(e);
            }
        };

        // Exposure counts from broadcast; settle_buy undoes it if the buy fails on chain
        let hash = sent.hash;
        self.ctx.ledger.add_active_eth(&self.id, detection.amount_in_wei);
        self.ctx
            .trades
            .update(&trade_id, |t| t.buy_tx = Some(hash))
            .await?;

        match sent.settled().await {
            Settlement::Mined(receipt) => {
                settle_buy(&self.ctx, &trade_id, &receipt).await?;
                Ok(())
            }
            Settlement::Reverted(receipt) => {
                settle_buy(&self.ctx, &trade_id, &receipt).await?;
                Err(Error::Reverted {
                    hash: hash.to_string(),
                })
            }
            Settlement::Unknown(reason) => {
                // The position monitor settles it once a receipt shows up
                warn!(
                    "{}: buy {} for trade {} not confirmed ({}); keeping it pending",
                    self.id, hash, trade_id, reason
                );
                Ok(())
            }
        }
    }

    fn abandon(&self, detection: &Detection) {
        if detection.reserved {
            debug!("{}: releasing reservation for {}", self.id, detection.tx_hash);
            self.ctx.ledger.rollback(&self.id);
        }
    }

    async fn quote_exit(&self, trade: &Trade) -> Result<U256> {
        if trade.token_amount.is_zero() {
            return Ok(U256::ZERO);
        }
        let settings = self.current();
        self.protocol
            .quote(
                &self.ctx,
                &settings,
                Swap {
                    side: Side::Sell,
                    token: trade.token,
                    fee: trade.fee,
                    amount_in: trade.token_amount,
                },
            )
            .await
    }

    async fn build_sell(&self, trade: &Trade, token_amount: U256) -> Result<SellPlan> {
        let settings = self.current();
        let swap = Swap {
            side: Side::Sell,
            token: trade.token,
            fee: trade.fee,
            amount_in: token_amount,
        };
        let expected = self.protocol.quote(&self.ctx, &settings, swap).await?;
        let min_out = apply_slippage(expected, settings.slippage_bps);
        let mut sell = self.protocol.swap_request(&self.ctx, &settings, swap, min_out);
        sell.gas_limit = Some(settings.gas_limit);

        let approve = dex::approval_if_needed(
            self.ctx.client.as_ref(),
            trade.token,
            self.ctx.signer,
            settings.router,
            token_amount,
        )
        .await?;

        Ok(SellPlan {
            approve,
            sell,
            expected_out_wei: expected,
            router: settings.router,
        })
    }
}
