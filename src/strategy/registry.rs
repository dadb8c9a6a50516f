//! Live strategy set
//!
//! Strategies are kept in registration order; arbitration ties fall back to
//! that order. Registering or updating a strategy also installs its limits in
//! the exposure ledger.

use std::sync::{Arc, RwLock};
use tracing::info;

use super::tracker::limits_of;
use super::{build_strategy, Strategy, TradeContext};
use crate::chain::LogFilter;
use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::ledger::ExposureLedger;

pub struct Registry {
    strategies: RwLock<Vec<Arc<dyn Strategy>>>,
    ledger: Arc<ExposureLedger>,
}

impl Registry {
    pub fn new(ledger: Arc<ExposureLedger>) -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            ledger,
        }
    }

    /// Build one strategy per tracker
    pub fn from_trackers(trackers: &[TrackerConfig], ctx: Arc<TradeContext>) -> Result<Self> {
        let registry = Self::new(ctx.ledger.clone());
        for settings in trackers {
            registry.register(build_strategy(settings.clone(), ctx.clone())?)?;
        }
        Ok(registry)
    }

    pub fn register(&self, strategy: Arc<dyn Strategy>) -> Result<()> {
        let mut strategies = self.strategies.write().unwrap_or_else(|p| p.into_inner());
        if strategies.iter().any(|s| s.id() == strategy.id()) {
            return Err(Error::Config(format!(
                "duplicate strategy id: {}",
                strategy.id()
            )));
        }
        self.ledger
            .set_limits(strategy.id(), limits_of(&strategy.settings()));
        info!(
            "Registered strategy {} ({}, priority {}{})",
            strategy.id(),
            strategy.protocol(),
            strategy.priority(),
            if strategy.enabled() { "" } else { ", disabled" }
        );
        strategies.push(strategy);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Strategy>> {
        self.strategies
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// All strategies in registration order
    pub fn all(&self) -> Vec<Arc<dyn Strategy>> {
        self.strategies
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.strategies.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply new settings to a registered strategy and its ledger limits
    pub fn update(&self, settings: TrackerConfig) -> Result<()> {
        let strategy = self
            .get(&settings.id)
            .ok_or_else(|| Error::StrategyNotFound(settings.id.clone()))?;
        let limits = limits_of(&settings);
        strategy.update_settings(settings)?;
        self.ledger.set_limits(strategy.id(), limits);
        Ok(())
    }

    /// Union of every strategy's filters, without duplicates, in registration order
    pub fn log_filters(&self) -> Vec<LogFilter> {
        let mut filters: Vec<LogFilter> = Vec::new();
        for strategy in self.all() {
            for filter in strategy.log_filters() {
                if !filters.contains(&filter) {
                    filters.push(filter);
                }
            }
        }
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::config::eth_to_wei;
    use crate::strategy::testing::{context, tracker_config};
    use alloy_primitives::{Address, U256};

    #[test]
    fn test_register_order_and_duplicates() {
        let ctx = context(Arc::new(MockChain::new()));
        let mut a = tracker_config("a", "uniswap_v2");
        a.max_trades = 2;
        let b = tracker_config("b", "uniswap_v3");
        let registry = Registry::from_trackers(&[a, b], ctx.clone()).unwrap();

        let ids: Vec<String> = registry.all().iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(ctx.ledger.entry("a").unwrap().limits.max_trades, 2);

        let dup = build_strategy(tracker_config("a", "uniswap_v2"), ctx).unwrap();
        assert!(registry.register(dup).is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_log_filter_union_dedupes() {
        let ctx = context(Arc::new(MockChain::new()));
        let a = tracker_config("a", "uniswap_v2");
        let b = tracker_config("b", "uniswap_v2");
        let mut c = tracker_config("c", "uniswap_v3");
        c.factory = Address::repeat_byte(0xfb);
        let registry = Registry::from_trackers(&[a, b, c], ctx).unwrap();

        let filters = registry.log_filters();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].address, Some(Address::repeat_byte(0xfa)));
        assert_eq!(filters[1].address, Some(Address::repeat_byte(0xfb)));
    }

    #[test]
    fn test_update_changes_limits() {
        let ctx = context(Arc::new(MockChain::new()));
        let registry = Registry::from_trackers(&[tracker_config("a", "uniswap_v2")], ctx.clone()).unwrap();

        let mut cfg = registry.get("a").unwrap().settings();
        cfg.max_active_buy_eth = 0.5;
        cfg.enabled = false;
        registry.update(cfg).unwrap();

        assert!(!registry.get("a").unwrap().enabled());
        assert_eq!(
            ctx.ledger.entry("a").unwrap().limits.max_active_buy_wei,
            eth_to_wei(0.5)
        );
        assert!(!ctx.ledger.can_buy("a", eth_to_wei(0.6)));
        assert!(ctx.ledger.can_buy("a", U256::from(1u64)));

        let missing = tracker_config("zz", "uniswap_v2");
        assert!(matches!(registry.update(missing), Err(Error::StrategyNotFound(_))));
    }
}
