//! Position management module
//!
//! - `book` - trade records and their persistence
//! - `monitor` - periodic valuation and exit execution

pub mod book;
pub mod monitor;

pub use book::{u256_to_f64, u256_to_i128, PendingSell, Trade, TradeBook, TradeStatus, TRADES_KEY};
pub use monitor::{evaluate_exit, ExitAction, ExitReason, PositionMonitor};
