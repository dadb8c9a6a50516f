//! Configuration loading and validation

use alloy_primitives::{address, Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    /// Wrapped native asset every tracked pool must pair against
    #[serde(default = "default_weth")]
    pub weth: Address,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub trackers: Vec<TrackerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub endpoint: String,
    /// WebSocket endpoint for log subscriptions; empty means poll over HTTP
    #[serde(default)]
    pub ws_endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub chain_id: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WalletConfig {
    /// Signer address; the node or signer proxy holds the key
    #[serde(default)]
    pub address: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Fee cap in gwei applied to every broadcast (0 = no cap)
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: f64,
    /// Attempt ceiling for transient and unclassified broadcast errors
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Nonce resyncs allowed per job before giving up
    #[serde(default = "default_max_nonce_resyncs")]
    pub max_nonce_resyncs: u32,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cleanup_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_cleanup_attempts")]
    pub attempts_per_nonce: u32,
    /// Multiplier over the suggested fee on the first attempt
    #[serde(default = "default_initial_multiplier")]
    pub initial_multiplier: f64,
    /// Geometric bump applied on every further attempt
    #[serde(default = "default_bump_factor")]
    pub bump_factor: f64,
    #[serde(default = "default_soft_cap_gwei")]
    pub soft_cap_gwei: f64,
    #[serde(default = "default_min_priority_gwei")]
    pub min_priority_gwei: f64,
    #[serde(default = "default_cleanup_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_cleanup_wait_ms")]
    pub wait_timeout_ms: u64,
    /// Backoff after a transient send error
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    /// Window during which logs are collected before receipts are fetched
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
    #[serde(default = "default_emitted_capacity")]
    pub emitted_capacity: usize,
    #[serde(default = "default_filter_refresh_secs")]
    pub filter_refresh_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    /// Polling fallback tick
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Largest block range fetched per poll
    #[serde(default = "default_poll_block_window")]
    pub poll_block_window: u64,
    /// Tokens never picked as the primary token of a transaction
    #[serde(default = "default_known_tokens")]
    pub known_tokens: Vec<Address>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_poll_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot file; empty keeps the store in memory only
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Entries kept in each audit list
    #[serde(default = "default_audit_cap")]
    pub audit_cap: usize,
}

/// One tracker (strategy) instance
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// `uniswap_v2` or `uniswap_v3`
    pub protocol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Higher wins when several trackers match the same transaction
    #[serde(default)]
    pub priority: i32,
    pub factory: Address,
    pub router: Address,
    /// QuoterV2, required for `uniswap_v3`
    #[serde(default)]
    pub quoter: Option<Address>,
    #[serde(default = "default_buy_amount_eth")]
    pub buy_amount_eth: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    /// Concurrent open trades (0 = unlimited)
    #[serde(default)]
    pub max_trades: u32,
    /// Active ETH exposure cap (0 = unlimited)
    #[serde(default)]
    pub max_active_buy_eth: f64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub blocked_tokens: Vec<Address>,
    /// Only sell on a stop-loss crossing; take-profits are left to the user
    #[serde(default)]
    pub manual_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Sell half at this gain
    #[serde(default = "default_take_profit1_pct")]
    pub take_profit1_pct: f64,
    /// Sell the rest at this gain
    #[serde(default = "default_take_profit2_pct")]
    pub take_profit2_pct: f64,
    /// Sell everything at this loss (positive number)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    /// Drop from the highest value that triggers a full sell while in profit (0 = off)
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,
    /// Sell everything after this long (0 = never)
    #[serde(default)]
    pub max_hold_secs: u64,
}

fn default_rpc_endpoint() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_weth() -> Address {
    address!("C02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2")
}

fn default_max_gas_price_gwei() -> f64 {
    200.0
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_max_nonce_resyncs() -> u32 {
    3
}

fn default_confirm_timeout_ms() -> u64 {
    180_000
}

fn default_receipt_poll_ms() -> u64 {
    1_500
}

fn default_cleanup_rounds() -> u32 {
    3
}

fn default_cleanup_attempts() -> u32 {
    4
}

fn default_initial_multiplier() -> f64 {
    1.5
}

fn default_bump_factor() -> f64 {
    1.25
}

fn default_soft_cap_gwei() -> f64 {
    500.0
}

fn default_min_priority_gwei() -> f64 {
    2.0
}

fn default_cleanup_poll_ms() -> u64 {
    3_000
}

fn default_cleanup_wait_ms() -> u64 {
    90_000
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_seen_capacity() -> usize {
    5_000
}

fn default_emitted_capacity() -> usize {
    10_000
}

fn default_filter_refresh_secs() -> u64 {
    30
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_poll_block_window() -> u64 {
    5
}

fn default_known_tokens() -> Vec<Address> {
    vec![
        default_weth(),
        // USDC
        address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
        // USDT
        address!("dAC17F958D2ee523a2206206994597C13D831ec7"),
        // DAI
        address!("6B175474E89094C44Da98b954EedeAC495271d0F"),
    ]
}

fn default_monitor_poll_ms() -> u64 {
    5_000
}

fn default_snapshot_path() -> String {
    "data/store.json".to_string()
}

fn default_flush_interval_secs() -> u64 {
    15
}

fn default_audit_cap() -> usize {
    1_000
}

fn default_buy_amount_eth() -> f64 {
    0.05
}

fn default_slippage_bps() -> u32 {
    1_500
}

fn default_gas_limit() -> u64 {
    400_000
}

fn default_deadline_secs() -> u64 {
    120
}

fn default_take_profit1_pct() -> f64 {
    50.0
}

fn default_take_profit2_pct() -> f64 {
    100.0
}

fn default_stop_loss_pct() -> f64 {
    30.0
}

fn default_trailing_stop_pct() -> f64 {
    20.0
}

fn default_true() -> bool {
    true
}

/// Convert a decimal ETH amount to wei
pub fn eth_to_wei(eth: f64) -> U256 {
    if !eth.is_finite() || eth <= 0.0 {
        return U256::ZERO;
    }
    // Round to gwei precision before scaling to stay exact in integers
    let gwei = (eth * 1e9).round() as u128;
    U256::from(gwei) * U256::from(1_000_000_000u64)
}

/// Convert a gwei amount to wei
pub fn gwei_to_wei(gwei: f64) -> u128 {
    if !gwei.is_finite() || gwei <= 0.0 {
        return 0;
    }
    (gwei * 1e9).round() as u128
}

/// Format a wei amount as decimal ETH for display
pub fn format_eth(wei: U256) -> String {
    let unit = U256::from(10u64).pow(U256::from(18));
    let whole = wei / unit;
    let frac = (wei % unit) / U256::from(10u64).pow(U256::from(12));
    format!("{}.{:06}", whole, frac.to::<u64>())
}

impl QueueConfig {
    /// Fee cap in wei, `None` when disabled
    pub fn gas_cap_wei(&self) -> Option<u128> {
        match gwei_to_wei(self.max_gas_price_gwei) {
            0 => None,
            cap => Some(cap),
        }
    }
}

impl TrackerConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn buy_amount_wei(&self) -> U256 {
        eth_to_wei(self.buy_amount_eth)
    }

    pub fn max_active_buy_wei(&self) -> U256 {
        eth_to_wei(self.max_active_buy_eth)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("rpc.endpoint", default_rpc_endpoint())?
            .set_default("rpc.ws_endpoint", "")?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SNIPER_)
            .add_source(
                config::Environment::with_prefix("SNIPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.rpc.endpoint.trim().is_empty() {
            anyhow::bail!("rpc.endpoint must be set");
        }

        if self.queue.max_gas_price_gwei < 0.0 {
            anyhow::bail!("queue.max_gas_price_gwei cannot be negative");
        }

        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be at least 1");
        }

        if self.queue.base_backoff_ms > self.queue.max_backoff_ms {
            anyhow::bail!("queue.base_backoff_ms cannot exceed queue.max_backoff_ms");
        }

        if self.cleanup.bump_factor < 1.0 || self.cleanup.initial_multiplier < 1.0 {
            anyhow::bail!("cleanup multipliers must be >= 1.0");
        }

        if self.cleanup.max_rounds == 0 || self.cleanup.attempts_per_nonce == 0 {
            anyhow::bail!("cleanup.max_rounds and cleanup.attempts_per_nonce must be at least 1");
        }

        if self.subscriber.seen_capacity == 0 || self.subscriber.emitted_capacity == 0 {
            anyhow::bail!("subscriber dedupe capacities must be positive");
        }

        if self.subscriber.poll_block_window == 0 {
            anyhow::bail!("subscriber.poll_block_window must be at least 1");
        }

        let mut ids = HashSet::new();
        for tracker in &self.trackers {
            if tracker.id.trim().is_empty() {
                anyhow::bail!("tracker id cannot be empty");
            }
            if !ids.insert(tracker.id.as_str()) {
                anyhow::bail!("Duplicate tracker id: {}", tracker.id);
            }
            if tracker.buy_amount_eth <= 0.0 {
                anyhow::bail!("tracker {}: buy_amount_eth must be positive", tracker.id);
            }
            if tracker.slippage_bps >= 10_000 {
                anyhow::bail!("tracker {}: slippage_bps must be below 10000", tracker.id);
            }
            if tracker.max_active_buy_eth < 0.0 {
                anyhow::bail!("tracker {}: max_active_buy_eth cannot be negative", tracker.id);
            }
            let exits = &tracker.exits;
            if exits.stop_loss_pct <= 0.0 || exits.stop_loss_pct >= 100.0 {
                anyhow::bail!("tracker {}: stop_loss_pct must be between 0 and 100", tracker.id);
            }
            if exits.take_profit1_pct <= 0.0 || exits.take_profit2_pct < exits.take_profit1_pct {
                anyhow::bail!(
                    "tracker {}: take profits must be positive and tp2 >= tp1",
                    tracker.id
                );
            }
        }

        if !self.trackers.is_empty() && self.wallet.address == Address::ZERO {
            tracing::warn!("wallet.address is not set - broadcasts will fail");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let mut out = format!(
            r#"Configuration:
  RPC:
    endpoint: {}
    ws_endpoint: {}
    timeout: {}ms
    chain_id: {}
  Wallet:
    address: {}
  WETH: {}
  Queue:
    gas_cap: {} gwei
    max_attempts: {}
    backoff: {}ms..{}ms
    confirm_timeout: {}ms
  Cleanup:
    enabled: {}
    rounds: {}
    soft_cap: {} gwei
  Subscriber:
    debounce: {}ms
    dedupe capacity: {} / {}
    polling: every {}ms, {} blocks
  Monitor:
    enabled: {}
    poll: {}ms
  Store:
    snapshot: {}
  Trackers:
"#,
            mask_url(&self.rpc.endpoint),
            if self.rpc.ws_endpoint.is_empty() {
                "(polling)".to_string()
            } else {
                mask_url(&self.rpc.ws_endpoint)
            },
            self.rpc.timeout_ms,
            self.rpc
                .chain_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "(node)".to_string()),
            self.wallet.address,
            self.weth,
            self.queue.max_gas_price_gwei,
            self.queue.max_attempts,
            self.queue.base_backoff_ms,
            self.queue.max_backoff_ms,
            self.queue.confirm_timeout_ms,
            self.cleanup.enabled,
            self.cleanup.max_rounds,
            self.cleanup.soft_cap_gwei,
            self.subscriber.debounce_ms,
            self.subscriber.seen_capacity,
            self.subscriber.emitted_capacity,
            self.subscriber.poll_interval_ms,
            self.subscriber.poll_block_window,
            self.monitor.enabled,
            self.monitor.poll_interval_ms,
            if self.store.snapshot_path.is_empty() {
                "(memory only)"
            } else {
                self.store.snapshot_path.as_str()
            },
        );
        if self.trackers.is_empty() {
            out.push_str("    (none)\n");
        }
        for t in &self.trackers {
            out.push_str(&format!(
                "    - {} [{}] enabled={} priority={} buy={} ETH max_trades={} max_active={} ETH{}\n",
                t.display_name(),
                t.protocol,
                t.enabled,
                t.priority,
                t.buy_amount_eth,
                t.max_trades,
                t.max_active_buy_eth,
                if t.manual_mode { " (manual)" } else { "" },
            ));
        }
        out
    }
}

/// Mask URL for display (hide API keys in query params and paths)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        return format!("{}?***", &url[..idx]);
    }
    // Providers like Alchemy/Infura put the key in the last path segment
    match url::Url::parse(url) {
        Ok(parsed) => {
            let segments: Vec<&str> = parsed.path().split('/').filter(|s| !s.is_empty()).collect();
            match segments.last() {
                Some(last) if last.len() >= 20 => {
                    let prefix = &url[..url.len() - last.len()];
                    format!("{}***", prefix)
                }
                _ => url.to_string(),
            }
        }
        Err(_) => url.to_string(),
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_rpc_endpoint(),
            ws_endpoint: String::new(),
            timeout_ms: default_timeout_ms(),
            chain_id: None,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_gas_price_gwei: default_max_gas_price_gwei(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_nonce_resyncs: default_max_nonce_resyncs(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            receipt_poll_ms: default_receipt_poll_ms(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rounds: default_cleanup_rounds(),
            attempts_per_nonce: default_cleanup_attempts(),
            initial_multiplier: default_initial_multiplier(),
            bump_factor: default_bump_factor(),
            soft_cap_gwei: default_soft_cap_gwei(),
            min_priority_gwei: default_min_priority_gwei(),
            poll_interval_ms: default_cleanup_poll_ms(),
            wait_timeout_ms: default_cleanup_wait_ms(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            seen_capacity: default_seen_capacity(),
            emitted_capacity: default_emitted_capacity(),
            filter_refresh_secs: default_filter_refresh_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_block_window: default_poll_block_window(),
            known_tokens: default_known_tokens(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_monitor_poll_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            flush_interval_secs: default_flush_interval_secs(),
            audit_cap: default_audit_cap(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit1_pct: default_take_profit1_pct(),
            take_profit2_pct: default_take_profit2_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            trailing_stop_pct: default_trailing_stop_pct(),
            max_hold_secs: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            wallet: WalletConfig::default(),
            weth: default_weth(),
            queue: QueueConfig::default(),
            cleanup: CleanupConfig::default(),
            subscriber: SubscriberConfig::default(),
            monitor: MonitorConfig::default(),
            store: StoreConfig::default(),
            trackers: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(id: &str) -> TrackerConfig {
        TrackerConfig {
            id: id.to_string(),
            name: String::new(),
            protocol: "uniswap_v2".to_string(),
            enabled: true,
            priority: 0,
            factory: Address::repeat_byte(1),
            router: Address::repeat_byte(2),
            quoter: None,
            buy_amount_eth: 0.1,
            slippage_bps: 500,
            max_trades: 2,
            max_active_buy_eth: 0.0,
            gas_limit: default_gas_limit(),
            deadline_secs: default_deadline_secs(),
            exits: ExitConfig::default(),
            blocked_tokens: vec![],
            manual_mode: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.subscriber.known_tokens.len(), 4);
        assert!(config.subscriber.known_tokens.contains(&config.weth));
        assert_eq!(config.queue.gas_cap_wei(), Some(200_000_000_000));
    }

    #[test]
    fn test_gas_cap_disabled() {
        let queue = QueueConfig {
            max_gas_price_gwei: 0.0,
            ..Default::default()
        };
        assert_eq!(queue.gas_cap_wei(), None);
    }

    #[test]
    fn test_duplicate_tracker_ids_rejected() {
        let mut config = Config::default();
        config.trackers = vec![tracker("a"), tracker("a")];
        assert!(config.validate().is_err());

        config.trackers = vec![tracker("a"), tracker("b")];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tracker_deserialize_defaults() {
        let json = r#"{
            "id": "v2-main",
            "protocol": "uniswap_v2",
            "factory": "0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f",
            "router": "0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D"
        }"#;
        let t: TrackerConfig = serde_json::from_str(json).unwrap();
        assert!(t.enabled);
        assert_eq!(t.priority, 0);
        assert_eq!(t.display_name(), "v2-main");
        assert_eq!(t.exits.take_profit1_pct, 50.0);
        assert_eq!(t.buy_amount_wei(), U256::from(50_000_000_000_000_000u64));
    }

    #[test]
    fn test_eth_conversions() {
        assert_eq!(eth_to_wei(1.0), U256::from(1_000_000_000_000_000_000u64));
        assert_eq!(eth_to_wei(-1.0), U256::ZERO);
        assert_eq!(gwei_to_wei(1.5), 1_500_000_000);
        assert_eq!(format_eth(U256::from(1_500_000_000_000_000_000u64)), "1.500000");
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(
            mask_url("https://eth-mainnet.g.alchemy.com/v2/abcdefghijklmnopqrstuvwxyz"),
            "https://eth-mainnet.g.alchemy.com/v2/***"
        );
        assert_eq!(mask_url("http://127.0.0.1:8545"), "http://127.0.0.1:8545");
    }
}
