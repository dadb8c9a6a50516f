//! Detection pipeline: debounced receipt fetch and strategy arbitration

use alloy_primitives::{Address, B256};
use alloy_sol_types::SolEvent;
use futures::future::join_all;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::batch::LogBatcher;
use crate::cache::DedupeCache;
use crate::chain::{ChainClient, Log, Receipt};
use crate::config::SubscriberConfig;
use crate::events::{DetectionTxNotice, Event, EventBus};
use crate::strategy::dex::IERC20;
use crate::strategy::{DetectOptions, Detection, Registry, Strategy};

/// Most frequently transferred ERC20 in the receipt, ignoring `known`.
/// Ties go to the token that appeared first.
pub fn primary_token(receipt: &Receipt, known: &[Address]) -> Option<Address> {
    let mut counts: HashMap<Address, (usize, usize)> = HashMap::new();
    for (position, log) in receipt.logs.iter().enumerate() {
        // ERC721 Transfer has the same signature but a fourth topic
        if log.topics.len() != 3 || log.topic0() != Some(IERC20::Transfer::SIGNATURE_HASH) {
            continue;
        }
        if known.contains(&log.address) {
            continue;
        }
        counts.entry(log.address).or_insert((0, position)).0 += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, (count, first))| (*count, Reverse(*first)))
        .map(|(token, _)| token)
}

pub struct Pipeline {
    client: Arc<dyn ChainClient>,
    registry: Arc<Registry>,
    events: EventBus,
    batcher: LogBatcher,
    debounce: Duration,
    known_tokens: Vec<Address>,
    seen_tx: DedupeCache<B256>,
    claimed_tx: DedupeCache<B256>,
    emitted_detections: DedupeCache<String>,
    emitted_tx_events: DedupeCache<B256>,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn ChainClient>,
        registry: Arc<Registry>,
        events: EventBus,
        config: &SubscriberConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            registry,
            events,
            batcher: LogBatcher::new(),
            debounce: Duration::from_millis(config.debounce_ms),
            known_tokens: config.known_tokens.clone(),
            seen_tx: DedupeCache::new(config.seen_capacity),
            claimed_tx: DedupeCache::new(config.seen_capacity),
            emitted_detections: DedupeCache::new(config.emitted_capacity),
            emitted_tx_events: DedupeCache::new(config.emitted_capacity),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Queue a log for the next flush, scheduling one if none is pending
    pub fn ingest(self: &Arc<Self>, log: Log) {
        if log.removed {
            debug!("Ignoring removed log in {}", log.transaction_hash);
            return;
        }
        if self.batcher.push(log) {
            let pipeline = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(pipeline.debounce).await;
                pipeline.flush().await;
            });
        }
    }

    /// Fetch receipts for everything batched so far and arbitrate them.
    ///
    /// Returns the spawned `process` tasks.
    pub async fn flush(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let pending = self.batcher.drain();
        if pending.is_empty() {
            return Vec::new();
        }
        debug!("Flushing {} transactions", pending.len());

        let fetches = pending.iter().map(|tx| {
            let client = self.client.clone();
            let hash = tx.tx_hash;
            async move { (hash, client.get_transaction_receipt(hash).await) }
        });

        let mut processing = Vec::new();
        for (hash, fetched) in join_all(fetches).await {
            match fetched {
                Ok(Some(receipt)) => {
                    if let Some(task) = self.handle_receipt(&receipt).await {
                        processing.push(task);
                    }
                }
                Ok(None) => debug!("Receipt for {} not available yet, dropping", hash),
                Err(e) => warn!("Receipt fetch for {} failed, dropping: {}", hash, e),
            }
        }
        processing
    }

    /// Arbitrate one receipt across every strategy.
    ///
    /// Returns the winner's `process` task, if any.
    pub async fn handle_receipt(self: &Arc<Self>, receipt: &Receipt) -> Option<JoinHandle<()>> {
        let tx = receipt.transaction_hash;
        if !self.seen_tx.insert(tx) {
            debug!("Transaction {} already arbitrated", tx);
            return None;
        }

        let mut results: Vec<Detection> = Vec::new();
        let mut candidates: Vec<(Arc<dyn Strategy>, i32, Detection)> = Vec::new();

        for strategy in self.registry.all() {
            let enabled = strategy.enabled();
            let outcome = strategy
                .detect(receipt, DetectOptions { reserve: enabled })
                .await;
            let detection = match outcome {
                Ok(Some(detection)) => detection,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Strategy {} failed on {}: {}", strategy.id(), tx, e);
                    continue;
                }
            };

            self.emit_detection(&detection);
            if detection.is_match() && enabled {
                candidates.push((strategy.clone(), strategy.priority(), detection.clone()));
            }
            results.push(detection);
        }

        // Stable: equal priorities keep registration order
        candidates.sort_by_key(|(_, priority, _)| Reverse(*priority));

        let mut candidates = candidates.into_iter();
        let winner = candidates.next();
        for (loser, priority, detection) in candidates {
            debug!(
                "{} (priority {}) lost arbitration for {}",
                loser.id(),
                priority,
                tx
            );
            loser.abandon(&detection);
        }

        let matched: Vec<String> = results
            .iter()
            .filter(|d| d.is_match())
            .map(|d| d.strategy_id.clone())
            .collect();
        let winner_id = winner.as_ref().map(|(s, _, _)| s.id().to_string());

        if !results.is_empty() && self.emitted_tx_events.insert(tx) {
            let primary = primary_token(receipt, &self.known_tokens).or_else(|| {
                winner
                    .as_ref()
                    .and_then(|(_, _, d)| d.target_token)
                    .or_else(|| results.iter().find_map(|d| d.target_token))
            });
            self.events.emit(Event::DetectionTx(DetectionTxNotice {
                tx_hash: tx,
                block_number: receipt.block_number,
                pass: winner.is_some(),
                primary_token: primary,
                matched,
                winner: winner_id,
            }));
        }

        let (strategy, _, detection) = winner?;
        if !self.claimed_tx.insert(tx) {
            debug!("Transaction {} already claimed", tx);
            strategy.abandon(&detection);
            return None;
        }
        info!(
            "{} wins {} (token {:?})",
            strategy.id(),
            tx,
            detection.target_token
        );
        Some(tokio::spawn(async move {
            let id = strategy.id().to_string();
            if let Err(e) = strategy.process(detection).await {
                warn!("Strategy {} failed to process {}: {}", id, tx, e);
            }
        }))
    }

    fn emit_detection(&self, detection: &Detection) {
        let key = format!("{}:{}", detection.tx_hash, detection.strategy_id);
        if !self.emitted_detections.insert(key) {
            return;
        }
        if let Some(reason) = &detection.reason {
            info!(
                "{} rejected {}: {}",
                detection.strategy_id, detection.tx_hash, reason
            );
        }
        self.events.emit(Event::Detection(detection.notice()));
    }
}
