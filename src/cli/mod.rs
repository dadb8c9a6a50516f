//! Command implementations for the `snipe` binary

pub mod commands;
