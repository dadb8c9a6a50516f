//! Strategy construction from tracker settings

use std::sync::Arc;

use super::tracker::PoolTracker;
use super::uniswap_v2::{self, UniswapV2};
use super::uniswap_v3::{self, UniswapV3};
use super::{Strategy, TradeContext};
use crate::config::TrackerConfig;
use crate::error::{Error, Result};

/// Build the strategy for `settings.protocol`
pub fn build_strategy(settings: TrackerConfig, ctx: Arc<TradeContext>) -> Result<Arc<dyn Strategy>> {
    match settings.protocol.as_str() {
        uniswap_v2::PROTOCOL => Ok(Arc::new(PoolTracker::new(UniswapV2, settings, ctx))),
        uniswap_v3::PROTOCOL => {
            if settings.quoter.is_none() {
                return Err(Error::Config(format!(
                    "tracker {}: uniswap_v3 requires a quoter address",
                    settings.id
                )));
            }
            Ok(Arc::new(PoolTracker::new(UniswapV3, settings, ctx)))
        }
        other => Err(Error::UnknownProtocol(other.to_string())),
    }
}
