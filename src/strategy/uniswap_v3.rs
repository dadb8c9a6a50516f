//! Uniswap V3 pools (`PoolCreated`, `exactInputSingle`, QuoterV2 quotes)
//!
//! Buys send ETH to the router, which wraps it. Sells pay out WETH to the
//! signer; unwrapping is left to the operator.

use alloy_primitives::aliases::{U160, U24};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;

use super::dex::{self, IQuoterV2, ISwapRouter, IUniswapV3Factory};
use super::tracker::{PoolEvent, PoolProtocol, Side, Swap};
use super::TradeContext;
use crate::chain::{Log, TransactionRequest};
use crate::config::TrackerConfig;
use crate::error::{Error, Result};

pub const PROTOCOL: &str = "uniswap_v3";

/// Tier used when a trade record carries no fee
const DEFAULT_FEE: u32 = 3_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct UniswapV3;

fn fee_tier(swap: &Swap) -> U24 {
    U24::from(swap.fee.unwrap_or(DEFAULT_FEE).min(0xff_ffff))
}

fn tokens(ctx: &TradeContext, swap: &Swap) -> (Address, Address) {
    match swap.side {
        Side::Buy => (ctx.weth, swap.token),
        Side::Sell => (swap.token, ctx.weth),
    }
}

#[async_trait]
impl PoolProtocol for UniswapV3 {
    fn tag(&self) -> &'static str {
        PROTOCOL
    }

    fn creation_topic(&self) -> B256 {
        IUniswapV3Factory::PoolCreated::SIGNATURE_HASH
    }

    fn decode_pool(&self, log: &Log) -> Result<PoolEvent> {
        let event: IUniswapV3Factory::PoolCreated = dex::decode_log(log)?;
        Ok(PoolEvent {
            token0: event.token0,
            token1: event.token1,
            pool: event.pool,
            fee: Some(event.fee.to::<u32>()),
        })
    }

    async fn quote(&self, ctx: &TradeContext, settings: &TrackerConfig, swap: Swap) -> Result<U256> {
        let quoter = settings
            .quoter
            .ok_or_else(|| Error::Config(format!("tracker {} has no quoter", settings.id)))?;
        let (token_in, token_out) = tokens(ctx, &swap);
        let call = IQuoterV2::quoteExactInputSingleCall {
            params: IQuoterV2::QuoteExactInputSingleParams {
                tokenIn: token_in,
                tokenOut: token_out,
                amountIn: swap.amount_in,
                fee: fee_tier(&swap),
                sqrtPriceLimitX96: U160::ZERO,
            },
        };
        Ok(dex::view(ctx.client.as_ref(), quoter, &call).await?.amountOut)
    }

    fn swap_request(
        &self,
        ctx: &TradeContext,
        settings: &TrackerConfig,
        swap: Swap,
        min_out: U256,
    ) -> TransactionRequest {
        let (token_in, token_out) = tokens(ctx, &swap);
        let call = ISwapRouter::exactInputSingleCall {
            params: ISwapRouter::ExactInputSingleParams {
                tokenIn: token_in,
                tokenOut: token_out,
                fee: fee_tier(&swap),
                recipient: ctx.signer,
                deadline: dex::deadline(settings.deadline_secs),
                amountIn: swap.amount_in,
                amountOutMinimum: min_out,
                sqrtPriceLimitX96: U160::ZERO,
            },
        };
        TransactionRequest {
            from: ctx.signer,
            to: Some(settings.router),
            value: match swap.side {
                Side::Buy => swap.amount_in,
                Side::Sell => U256::ZERO,
            },
            data: Bytes::from(call.abi_encode()),
            ..Default::default()
        }
    }
}
