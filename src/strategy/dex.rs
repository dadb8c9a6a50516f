//! Contract bindings and calldata helpers for the supported DEXes

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{sol, SolCall, SolEvent};

use crate::chain::{ChainClient, Log, Receipt, TransactionRequest};
use crate::error::{Error, Result};

sol! {
    #[derive(Debug, PartialEq, Eq)]
    interface IUniswapV2Factory {
        event PairCreated(address indexed token0, address indexed token1, address pair, uint256 pairIndex);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IUniswapV2Router {
        function swapExactETHForTokensSupportingFeeOnTransferTokens(uint256 amountOutMin, address[] calldata path, address to, uint256 deadline) external payable;
        function swapExactTokensForETHSupportingFeeOnTransferTokens(uint256 amountIn, uint256 amountOutMin, address[] calldata path, address to, uint256 deadline) external;
        function getAmountsOut(uint256 amountIn, address[] calldata path) external view returns (uint256[] memory amounts);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IUniswapV3Factory {
        event PoolCreated(address indexed token0, address indexed token1, uint24 indexed fee, int24 tickSpacing, address pool);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface ISwapRouter {
        struct ExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint24 fee;
            address recipient;
            uint256 deadline;
            uint256 amountIn;
            uint256 amountOutMinimum;
            uint160 sqrtPriceLimitX96;
        }
        function exactInputSingle(ExactInputSingleParams calldata params) external payable returns (uint256 amountOut);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IQuoterV2 {
        struct QuoteExactInputSingleParams {
            address tokenIn;
            address tokenOut;
            uint256 amountIn;
            uint24 fee;
            uint160 sqrtPriceLimitX96;
        }
        function quoteExactInputSingle(QuoteExactInputSingleParams memory params) external returns (uint256 amountOut, uint160 sqrtPriceX96After, uint32 initializedTicksCrossed, uint256 gasEstimate);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IERC20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
        function approve(address spender, uint256 amount) external returns (bool ok);
        function allowance(address owner, address spender) external view returns (uint256 remaining);
        function balanceOf(address owner) external view returns (uint256 balance);
    }

    #[derive(Debug, PartialEq, Eq)]
    interface IWETH {
        event Withdrawal(address indexed src, uint256 wad);
    }
}

/// Decode a typed event from a raw log
pub fn decode_log<E: SolEvent>(log: &Log) -> Result<E> {
    E::decode_raw_log(log.topics.iter().copied(), &log.data, true)
        .map_err(|e| Error::Decode(format!("{}: {}", E::SIGNATURE, e)))
}

/// `amount × (10000 − slippage_bps) / 10000`
pub fn apply_slippage(amount: U256, slippage_bps: u32) -> U256 {
    let keep = 10_000u32.saturating_sub(slippage_bps);
    amount * U256::from(keep) / U256::from(10_000u32)
}

/// Unix deadline `secs` from now
pub fn deadline(secs: u64) -> U256 {
    U256::from(chrono::Utc::now().timestamp().max(0) as u64 + secs)
}

/// Run a view call and decode its return data
pub async fn view<C: SolCall>(client: &dyn ChainClient, to: Address, call: &C) -> Result<C::Return> {
    let raw = client.call(to, Bytes::from(call.abi_encode())).await?;
    C::abi_decode_returns(&raw, true).map_err(|e| Error::Decode(format!("{}: {}", C::SIGNATURE, e)))
}

/// ERC20 balance of `owner`
pub async fn balance_of(client: &dyn ChainClient, token: Address, owner: Address) -> Result<U256> {
    Ok(view(client, token, &IERC20::balanceOfCall { owner }).await?.balance)
}

/// Approval of `amount` for `spender`, or `None` when the allowance already covers it
pub async fn approval_if_needed(
    client: &dyn ChainClient,
    token: Address,
    owner: Address,
    spender: Address,
    amount: U256,
) -> Result<Option<TransactionRequest>> {
    let current = view(client, token, &IERC20::allowanceCall { owner, spender })
        .await
        .map(|r| r.remaining)
        .unwrap_or(U256::ZERO);
    if current >= amount {
        return Ok(None);
    }
    Ok(Some(TransactionRequest {
        from: owner,
        to: Some(token),
        data: Bytes::from(IERC20::approveCall { spender, amount: U256::MAX }.abi_encode()),
        gas_limit: Some(80_000),
        ..Default::default()
    }))
}

/// Sum of `token` transfers to `recipient` in a receipt
pub fn received_tokens(receipt: &Receipt, token: Address, recipient: Address) -> U256 {
    receipt
        .logs
        .iter()
        .filter(|log| log.address == token && log.topic0() == Some(IERC20::Transfer::SIGNATURE_HASH))
        .filter_map(|log| decode_log::<IERC20::Transfer>(log).ok())
        .filter(|transfer| transfer.to == recipient)
        .fold(U256::ZERO, |acc, t| acc + t.value)
}

/// WETH delivered by a sell: transfers of WETH to `recipient`, plus WETH
/// unwrapped by `router` on the recipient's behalf
pub fn received_weth(receipt: &Receipt, weth: Address, recipient: Address, router: Address) -> U256 {
    let unwrapped = receipt
        .logs
        .iter()
        .filter(|log| log.address == weth && log.topic0() == Some(IWETH::Withdrawal::SIGNATURE_HASH))
        .filter_map(|log| decode_log::<IWETH::Withdrawal>(log).ok())
        .filter(|w| w.src == router)
        .fold(U256::ZERO, |acc, w| acc + w.wad);
    unwrapped + received_tokens(receipt, weth, recipient)
}
