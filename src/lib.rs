//! EVM New-Pool Sniper Library
//!
//! Watches DEX factories for newly created pools, arbitrates between the
//! configured strategies and broadcasts buys through a per-signer,
//! nonce-sequenced transaction queue. Open positions are monitored and sold
//! on stop-loss, trailing-stop, take-profit or hold-time exits.

pub mod audit;
pub mod cache;
pub mod chain;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod position;
pub mod queue;
pub mod store;
pub mod strategy;
pub mod subscriber;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
