//! Startup nonce reconciliation
//!
//! Before the queue hands out its first nonce, any transactions stuck between
//! the signer's latest and pending nonce are replaced with zero-value
//! self-transfers at bumped fees. Every loop here is bounded by rounds,
//! attempts or a wait timeout, so the routine terminates even if the chain
//! never converges.

use alloy_primitives::Address;
use backoff::backoff::Backoff;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chain::{BlockTag, ChainClient, FeeData, TransactionRequest};
use crate::config::{gwei_to_wei, CleanupConfig};
use crate::error::{BroadcastFailure, Result};
use crate::queue::retry::exponential;

/// Outcome of a reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// No gap left
    pub ok: bool,
    /// Distinct nonces replaced or found already used
    pub cleared: usize,
    /// Gap left after the last round
    pub remaining: u64,
    pub rounds: u32,
}

/// Fallback base fee when the node suggests nothing
const FALLBACK_FEE_WEI: u128 = 1_000_000_000;

/// Fees for replacement attempt `attempt` (0-based): the suggestion scaled by
/// `initial_multiplier × bump_factor^attempt`, max fee bounded by the soft
/// cap, priority fee at least the floor and never above the max fee.
pub fn bumped_fees(fee: &FeeData, attempt: u32, config: &CleanupConfig) -> (u128, u128) {
    let base = fee
        .max_fee_per_gas
        .or(fee.gas_price)
        .unwrap_or(FALLBACK_FEE_WEI);
    let floor = gwei_to_wei(config.min_priority_gwei);
    let priority = fee.max_priority_fee_per_gas.unwrap_or(0).max(floor);

    let multiplier = config.initial_multiplier * config.bump_factor.powi(attempt as i32);
    let scale = |value: u128| (value as f64 * multiplier).ceil() as u128;

    let mut max_fee = scale(base);
    let mut priority = scale(priority).max(floor);
    let soft_cap = gwei_to_wei(config.soft_cap_gwei);
    if soft_cap > 0 {
        max_fee = max_fee.min(soft_cap);
        priority = priority.min(soft_cap);
    }
    (max_fee.max(priority), priority)
}

async fn gap(client: &dyn ChainClient, signer: Address) -> Result<(u64, u64)> {
    let latest = client.get_transaction_count(signer, BlockTag::Latest).await?;
    let pending = client.get_transaction_count(signer, BlockTag::Pending).await?;
    Ok((latest, pending))
}

enum ReplaceOutcome {
    Cleared,
    Failed,
    OutOfFunds,
}

async fn replace_nonce(
    client: &dyn ChainClient,
    signer: Address,
    nonce: u64,
    fee: &FeeData,
    config: &CleanupConfig,
) -> ReplaceOutcome {
    let mut backoff = exponential(
        Duration::from_millis(config.base_backoff_ms),
        Duration::from_millis(config.max_backoff_ms),
    );
    // Fee step, advanced by underpriced and unclassified rejections only
    let mut bump = 0;

    for attempt in 0..config.attempts_per_nonce {
        let (max_fee, priority) = bumped_fees(fee, bump, config);
        let request = TransactionRequest {
            nonce: Some(nonce),
            max_fee_per_gas: Some(max_fee),
            max_priority_fee_per_gas: Some(priority),
            ..TransactionRequest::self_transfer(signer)
        };

        match client.send_transaction(&request).await {
            Ok(hash) => {
                info!(
                    "Replacement for nonce {} sent: {} (max fee {} wei)",
                    nonce, hash, max_fee
                );
                return ReplaceOutcome::Cleared;
            }
            Err(e) => match e.broadcast_failure() {
                BroadcastFailure::NonceTooLow | BroadcastFailure::AlreadyKnown => {
                    debug!("Nonce {} already resolved: {}", nonce, e);
                    return ReplaceOutcome::Cleared;
                }
                BroadcastFailure::InsufficientFunds => {
                    warn!("Cannot pay for replacement of nonce {}: {}", nonce, e);
                    return ReplaceOutcome::OutOfFunds;
                }
                BroadcastFailure::Underpriced => {
                    debug!("Replacement for nonce {} underpriced, bumping", nonce);
                    bump += 1;
                }
                BroadcastFailure::Transient => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(config.max_backoff_ms));
                    warn!(
                        "Replacement for nonce {} hit a transient error (attempt {}): {} - retrying in {:?}",
                        nonce,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(e) = client.get_block_number().await {
                        debug!("Connectivity probe failed: {}", e);
                    }
                }
                BroadcastFailure::Other => {
                    warn!(
                        "Replacement for nonce {} failed (attempt {}): {}",
                        nonce,
                        attempt + 1,
                        e
                    );
                    bump += 1;
                }
            },
        }
    }
    ReplaceOutcome::Failed
}

/// Poll until `pending <= latest` or the wait timeout elapses
async fn wait_for_convergence(
    client: &dyn ChainClient,
    signer: Address,
    config: &CleanupConfig,
) -> Result<bool> {
    let deadline = Instant::now() + Duration::from_millis(config.wait_timeout_ms);
    loop {
        let (latest, pending) = gap(client, signer).await?;
        if pending <= latest {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            debug!("Still {} pending after wait timeout", pending - latest);
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)).await;
    }
}

/// Clear stuck pending transactions for `signer`
pub async fn reconcile(
    client: &dyn ChainClient,
    signer: Address,
    config: &CleanupConfig,
) -> Result<CleanupReport> {
    let mut cleared = BTreeSet::new();
    let mut rounds = 0;

    while rounds < config.max_rounds {
        let (latest, pending) = gap(client, signer).await?;
        if pending <= latest {
            break;
        }
        rounds += 1;
        info!(
            "Nonce gap {} for {} (latest {}, pending {}), round {}/{}",
            pending - latest,
            signer,
            latest,
            pending,
            rounds,
            config.max_rounds
        );

        let fee = client.get_fee_data().await?;
        for nonce in latest..pending {
            match replace_nonce(client, signer, nonce, &fee, config).await {
                ReplaceOutcome::Cleared => {
                    cleared.insert(nonce);
                }
                ReplaceOutcome::Failed => {}
                ReplaceOutcome::OutOfFunds => {
                    return Ok(CleanupReport {
                        ok: false,
                        cleared: cleared.len(),
                        remaining: pending - latest,
                        rounds,
                    });
                }
            }
        }

        wait_for_convergence(client, signer, config).await?;
    }

    let (latest, pending) = gap(client, signer).await?;
    let remaining = pending.saturating_sub(latest);
    let report = CleanupReport {
        ok: remaining == 0,
        cleared: cleared.len(),
        remaining,
        rounds,
    };
    if report.ok {
        info!(
            "Nonce reconciliation done: cleared {} in {} rounds",
            report.cleared, report.rounds
        );
    } else {
        warn!(
            "Nonce reconciliation incomplete: {} still pending after {} rounds",
            report.remaining, report.rounds
        );
    }
    Ok(report)
}
