//! Error types for the sniper engine

use lazy_static::lazy_static;
use regex::RegexSet;
use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sniper engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    // Log subscription errors
    #[error("Log subscription unsupported by transport")]
    SubscriptionUnsupported,

    #[error("Log subscription closed: {0}")]
    SubscriptionClosed(String),

    // Transaction errors
    #[error("Transaction build failed: {0}")]
    TransactionBuild(String),

    #[error("Broadcast failed ({kind:?}) for {label}: {message}")]
    Broadcast {
        kind: BroadcastFailure,
        label: String,
        message: String,
    },

    #[error("Transaction {hash} reverted")]
    Reverted { hash: String },

    #[error("Transaction {hash} not confirmed within {timeout_ms}ms")]
    ConfirmationTimeout { hash: String, timeout_ms: u64 },

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Queue job dropped before completion: {0}")]
    JobDropped(String),

    // Strategy errors
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    #[error("Log decode failed: {0}")]
    Decode(String),

    // Position management errors
    #[error("Trade not found: {0}")]
    TradeNotFound(String),

    // Store errors
    #[error("Store error: {0}")]
    Store(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// How a failed broadcast should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFailure {
    /// Nonce already used on chain; resync and rebuild
    NonceTooLow,
    /// The node already holds this exact transaction; never rebroadcast
    AlreadyKnown,
    /// Fee too low to replace or enter the pool; bump and retry
    Underpriced,
    /// Signer cannot pay; stop the whole operation
    InsufficientFunds,
    /// Network-level hiccup; back off and retry
    Transient,
    /// Anything else; retry up to the configured ceiling
    Other,
}

lazy_static! {
    static ref NONCE_TOO_LOW: RegexSet = RegexSet::new([
        r"(?i)nonce too low",
        r"(?i)nonce has already been used",
        r"(?i)nonce.*(expired|already used)",
        r"(?i)transaction with (the )?same nonce",
    ])
    .expect("static regex");
    static ref ALREADY_KNOWN: RegexSet = RegexSet::new([
        r"(?i)already known",
        r"(?i)known transaction",
        r"(?i)transaction with (the )?same hash",
        r"(?i)already imported",
    ])
    .expect("static regex");
    static ref UNDERPRICED: RegexSet = RegexSet::new([
        r"(?i)replacement (transaction|fee) underpriced",
        r"(?i)transaction underpriced",
        r"(?i)fee too low",
        r"(?i)max fee per gas less than block base fee",
    ])
    .expect("static regex");
    static ref INSUFFICIENT_FUNDS: RegexSet = RegexSet::new([
        r"(?i)insufficient funds",
        r"(?i)insufficient balance",
    ])
    .expect("static regex");
    static ref TRANSIENT: RegexSet = RegexSet::new([
        r"(?i)timeout",
        r"(?i)timed out",
        r"(?i)econnreset",
        r"(?i)connection (reset|refused|closed)",
        r"(?i)socket hang up",
        r"\b50[234]\b",
        r"(?i)bad gateway",
        r"(?i)service unavailable",
        r"(?i)missing response",
        r"(?i)failed to meet quorum",
        r"(?i)network error",
        r"(?i)rate limit",
    ])
    .expect("static regex");
}

impl BroadcastFailure {
    /// Classify a node/transport error message.
    ///
    /// Funds are checked first because some nodes wrap "insufficient funds"
    /// inside a gateway error body.
    pub fn classify(message: &str) -> Self {
        if INSUFFICIENT_FUNDS.is_match(message) {
            BroadcastFailure::InsufficientFunds
        } else if ALREADY_KNOWN.is_match(message) {
            BroadcastFailure::AlreadyKnown
        } else if NONCE_TOO_LOW.is_match(message) {
            BroadcastFailure::NonceTooLow
        } else if UNDERPRICED.is_match(message) {
            BroadcastFailure::Underpriced
        } else if TRANSIENT.is_match(message) {
            BroadcastFailure::Transient
        } else {
            BroadcastFailure::Other
        }
    }
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Rpc(msg) => BroadcastFailure::classify(msg) == BroadcastFailure::Transient,
            Error::RpcTimeout(_) | Error::RpcConnection(_) | Error::SubscriptionClosed(_) => true,
            Error::Broadcast { kind, .. } => *kind == BroadcastFailure::Transient,
            _ => false,
        }
    }

    /// Classify this error as a broadcast failure
    pub fn broadcast_failure(&self) -> BroadcastFailure {
        match self {
            Error::Broadcast { kind, .. } => *kind,
            Error::InsufficientFunds(_) => BroadcastFailure::InsufficientFunds,
            Error::RpcTimeout(_) | Error::RpcConnection(_) => BroadcastFailure::Transient,
            other => BroadcastFailure::classify(&other.to_string()),
        }
    }
}

// Conversion from HTTP transport errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::RpcTimeout(0)
        } else if e.is_connect() {
            Error::RpcConnection(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
