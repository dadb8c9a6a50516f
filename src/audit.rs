//! Audit log
//!
//! Append-only record of every queue phase, kept in the store as a capped
//! global list (`audit:tx`) plus one list per linked trade
//! (`trade:<id>:history`). Store failures are logged and swallowed.

use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::store::KvStore;

pub const AUDIT_KEY: &str = "audit:tx";

/// Per-trade history list key
pub fn trade_history_key(trade_id: &str) -> String {
    format!("trade:{}:history", trade_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Sent,
    Confirmed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub phase: AuditPhase,
    pub address: Address,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<B256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(phase: AuditPhase, address: Address, label: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            phase,
            address,
            label: label.into(),
            action: None,
            hash: None,
            nonce: None,
            block_number: None,
            trade: None,
            error: None,
        }
    }
}

/// Writer for the audit lists
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn KvStore>,
    cap: usize,
}

impl AuditLog {
    pub fn new(store: Arc<dyn KvStore>, cap: usize) -> Self {
        Self {
            store,
            cap: cap.max(1),
        }
    }

    /// Append an entry to the global list and, if linked, the trade history
    pub async fn record(&self, entry: &AuditEntry) {
        let payload = match serde_json::to_string(entry) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to serialize audit entry: {}", e);
                return;
            }
        };

        if let Err(e) = self.push_capped(AUDIT_KEY, payload.clone()).await {
            warn!("Audit log write failed: {}", e);
        }
        if let Some(trade) = &entry.trade {
            if let Err(e) = self.push_capped(&trade_history_key(trade), payload).await {
                warn!("Trade history write failed for {}: {}", trade, e);
            }
        }
    }

    async fn push_capped(&self, key: &str, payload: String) -> crate::error::Result<()> {
        self.store.lpush(key, payload).await?;
        self.store.ltrim(key, 0, self.cap - 1).await
    }

    /// Most recent entries first
    pub async fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.read_list(AUDIT_KEY, limit).await
    }

    pub async fn trade_history(&self, trade_id: &str) -> Vec<AuditEntry> {
        self.read_list(&trade_history_key(trade_id), self.cap).await
    }

    async fn read_list(&self, key: &str, limit: usize) -> Vec<AuditEntry> {
        if limit == 0 {
            return vec![];
        }
        match self.store.lrange(key, 0, limit as isize - 1).await {
            Ok(items) => items
                .iter()
                .filter_map(|raw| serde_json::from_str(raw).ok())
                .collect(),
            Err(e) => {
                warn!("Audit read failed for {}: {}", key, e);
                vec![]
            }
        }
    }
}
