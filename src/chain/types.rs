//! Wire types shared by the chain adapter, the queue and the pipeline

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Block tag for nonce queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Latest => "latest",
            BlockTag::Pending => "pending",
        }
    }
}

/// Current fee suggestion from the node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeData {
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub gas_price: Option<u128>,
}

/// Outgoing transaction. Immutable once handed to `send_transaction`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    /// Legacy pricing, only used when no EIP-1559 fields are set
    pub gas_price: Option<u128>,
    pub chain_id: Option<u64>,
}

impl TransactionRequest {
    /// Zero-value transfer from the signer to itself
    pub fn self_transfer(signer: Address) -> Self {
        Self {
            from: signer,
            to: Some(signer),
            gas_limit: Some(21_000),
            ..Default::default()
        }
    }

    pub fn has_fees(&self) -> bool {
        self.max_fee_per_gas.is_some() || self.gas_price.is_some()
    }
}

/// Log filter declared by a strategy: one contract, any of the topic0 values
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogFilter {
    pub address: Option<Address>,
    pub topics: Vec<B256>,
}

/// Raw log record as delivered by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub transaction_hash: B256,
    #[serde(default, with = "quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub removed: bool,
}

impl Log {
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

/// Mined transaction receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub transaction_hash: B256,
    #[serde(with = "quantity")]
    pub block_number: u64,
    #[serde(with = "quantity::status")]
    pub status: bool,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default, with = "quantity::opt")]
    pub gas_used: Option<u64>,
    #[serde(default)]
    pub logs: Vec<Log>,
}

/// Hex quantity (de)serializers for JSON-RPC fields
pub mod quantity {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(s: &str) -> Result<u128, String> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        if digits.is_empty() {
            return Ok(0);
        }
        u128::from_str_radix(digits, 16).map_err(|e| format!("invalid quantity {}: {}", s, e))
    }

    pub fn serialize<S: Serializer>(value: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:#x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(d)?;
        let value = parse(&raw).map_err(serde::de::Error::custom)?;
        u64::try_from(value).map_err(serde::de::Error::custom)
    }

    pub mod opt {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => s.serialize_str(&format!("{:#x}", v)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            match raw {
                Some(s) => {
                    let value = super::parse(&s).map_err(serde::de::Error::custom)?;
                    u64::try_from(value)
                        .map(Some)
                        .map_err(serde::de::Error::custom)
                }
                None => Ok(None),
            }
        }
    }

    pub mod status {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(if *value { "0x1" } else { "0x0" })
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            match raw {
                Some(s) => Ok(super::parse(&s).map_err(serde::de::Error::custom)? == 1),
                // Pre-Byzantium receipts have no status; treat as success
                None => Ok(true),
            }
        }
    }
}
