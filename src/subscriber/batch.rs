//! Per-transaction log batching between debounce flushes

use alloy_primitives::B256;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::chain::Log;

/// Logs seen for one transaction since the last flush
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub logs: Vec<Log>,
}

#[derive(Default)]
struct BatchInner {
    by_tx: HashMap<B256, PendingTx>,
    order: Vec<B256>,
}

/// Collects logs keyed by transaction hash, in first-seen order
#[derive(Default)]
pub struct LogBatcher {
    inner: Mutex<BatchInner>,
}

impl LogBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a log. Returns `true` when the batch was empty, i.e. the caller
    /// should schedule a flush.
    pub fn push(&self, log: Log) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let was_empty = inner.order.is_empty();
        let hash = log.transaction_hash;
        if let Some(pending) = inner.by_tx.get_mut(&hash) {
            pending.logs.push(log);
        } else {
            inner.order.push(hash);
            inner.by_tx.insert(
                hash,
                PendingTx {
                    tx_hash: hash,
                    block_number: log.block_number,
                    logs: vec![log],
                },
            );
        }
        was_empty
    }

    /// Take everything collected so far
    pub fn drain(&self) -> Vec<PendingTx> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let BatchInner { mut by_tx, order } = std::mem::take(&mut *inner);
        order
            .into_iter()
            .filter_map(|hash| by_tx.remove(&hash))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
