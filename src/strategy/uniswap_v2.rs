//! Uniswap V2 style pairs (`PairCreated`, router swaps supporting fee-on-transfer)

use alloy_primitives::{Bytes, B256, U256};
use alloy_sol_types::{SolCall, SolEvent};
use async_trait::async_trait;

use super::dex::{self, IUniswapV2Factory, IUniswapV2Router};
use super::tracker::{PoolEvent, PoolProtocol, Side, Swap};
use super::TradeContext;
use crate::chain::{Log, TransactionRequest};
use crate::config::TrackerConfig;
use crate::error::{Error, Result};

pub const PROTOCOL: &str = "uniswap_v2";

#[derive(Debug, Clone, Copy, Default)]
pub struct UniswapV2;

impl UniswapV2 {
    fn path(ctx: &TradeContext, swap: &Swap) -> Vec<alloy_primitives::Address> {
        match swap.side {
            Side::Buy => vec![ctx.weth, swap.token],
            Side::Sell => vec![swap.token, ctx.weth],
        }
    }
}

#[async_trait]
impl PoolProtocol for UniswapV2 {
    fn tag(&self) -> &'static str {
        PROTOCOL
    }

    fn creation_topic(&self) -> B256 {
        IUniswapV2Factory::PairCreated::SIGNATURE_HASH
    }

    fn decode_pool(&self, log: &Log) -> Result<PoolEvent> {
        let event: IUniswapV2Factory::PairCreated = dex::decode_log(log)?;
        Ok(PoolEvent {
            token0: event.token0,
            token1: event.token1,
            pool: event.pair,
            fee: None,
        })
    }

    async fn quote(&self, ctx: &TradeContext, settings: &TrackerConfig, swap: Swap) -> Result<U256> {
        let call = IUniswapV2Router::getAmountsOutCall {
            amountIn: swap.amount_in,
            path: Self::path(ctx, &swap),
        };
        let amounts = dex::view(ctx.client.as_ref(), settings.router, &call)
            .await?
            .amounts;
        amounts
            .last()
            .copied()
            .ok_or_else(|| Error::Decode("getAmountsOut returned no amounts".into()))
    }

    fn swap_request(
        &self,
        ctx: &TradeContext,
        settings: &TrackerConfig,
        swap: Swap,
        min_out: U256,
    ) -> TransactionRequest {
        let deadline = dex::deadline(settings.deadline_secs);
        let path = Self::path(ctx, &swap);
        let (data, value) = match swap.side {
            Side::Buy => (
                IUniswapV2Router::swapExactETHForTokensSupportingFeeOnTransferTokensCall {
                    amountOutMin: min_out,
                    path,
                    to: ctx.signer,
                    deadline,
                }
                .abi_encode(),
                swap.amount_in,
            ),
            Side::Sell => (
                IUniswapV2Router::swapExactTokensForETHSupportingFeeOnTransferTokensCall {
                    amountIn: swap.amount_in,
                    amountOutMin: min_out,
                    path,
                    to: ctx.signer,
                    deadline,
                }
                .abi_encode(),
                U256::ZERO,
            ),
        };
        TransactionRequest {
            from: ctx.signer,
            to: Some(settings.router),
            value,
            data: Bytes::from(data),
            ..Default::default()
        }
    }
}
