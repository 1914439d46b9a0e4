//! Shared value types for the NLoop core state machine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Serde module for serializing `[u8; 32]` as hex strings.
mod hex_bytes32 {
    use super::*;

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// Opaque identifier of a swap, unique per swap and the primary key of its event
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwapId(pub String);

impl SwapId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The event store's stream key for this swap, per the persistence interface.
    pub fn stream_key(&self) -> String {
        format!("swap-{}", self.0)
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SwapId {
    fn from(s: &str) -> Self {
        SwapId(s.to_string())
    }
}

/// Base-chain asset a swap moves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Asset {
    Btc,
    Ltc,
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Btc => write!(f, "btc"),
            Asset::Ltc => write!(f, "ltc"),
        }
    }
}

impl FromStr for Asset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(Asset::Btc),
            "ltc" | "litecoin" => Ok(Asset::Ltc),
            _ => Err(Error::Input(format!("unknown asset: {s}"))),
        }
    }
}

/// Ordered pair `(base, quote)`. `base` is always the on-chain side, `quote` the
/// off-chain (Lightning) side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairId {
    pub base: Asset,
    pub quote: Asset,
}

impl PairId {
    pub fn new(base: Asset, quote: Asset) -> Self {
        Self { base, quote }
    }

    pub fn btc_ltc() -> Self {
        Self::new(Asset::Btc, Asset::Ltc)
    }

    pub fn base_asset(&self) -> Asset {
        self.base
    }

    pub fn quote_asset(&self) -> Asset {
        self.quote
    }
}

/// 32-byte payment hash: SHA-256 of a [`PaymentPreimage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentHash(#[serde(with = "hex_bytes32")] pub [u8; 32]);

impl PaymentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 32-byte payment preimage whose SHA-256 is the [`PaymentHash`] that gates an HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPreimage(#[serde(with = "hex_bytes32")] pub [u8; 32]);

impl PaymentPreimage {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the payment hash this preimage satisfies.
    pub fn payment_hash(&self) -> PaymentHash {
        let digest = Sha256::digest(self.0);
        PaymentHash(digest.into())
    }
}

/// Fee rate in satoshis per virtual byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Compute the absolute fee for a transaction of the given virtual size.
    pub fn fee_for_vsize(&self, vsize: u64) -> u64 {
        self.0 * vsize
    }
}

/// Unsigned 32-bit block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockHeight(pub u32);

impl BlockHeight {
    /// Blocks remaining until `timeout`, saturating at zero if already past.
    pub fn remaining_until(&self, timeout: BlockHeight) -> u32 {
        timeout.0.saturating_sub(self.0)
    }
}

impl std::ops::Sub for BlockHeight {
    type Output = i64;

    fn sub(self, rhs: BlockHeight) -> i64 {
        self.0 as i64 - rhs.0 as i64
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome of a swap; the only four user-visible results (spec.md §7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Refunded(String),
    Errored(String),
    Timeout(String),
}

/// A Lightning peer connection string: `<node_pubkey_hex>@<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionString {
    pub pubkey_hex: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PeerConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.pubkey_hex, self.host, self.port)
    }
}

impl FromStr for PeerConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pubkey_hex, rest) = s
            .split_once('@')
            .ok_or_else(|| Error::Input(format!("missing '@' in peer string: {s}")))?;

        if pubkey_hex.len() != 66 || hex::decode(pubkey_hex).is_err() {
            return Err(Error::Input(format!(
                "invalid node pubkey hex in peer string: {pubkey_hex}"
            )));
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Input(format!("missing ':<port>' in peer string: {s}")))?;

        if host.is_empty() {
            return Err(Error::Input(format!("empty host in peer string: {s}")));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| Error::Input(format!("invalid port in peer string: {s}")))?;

        Ok(PeerConnectionString {
            pubkey_hex: pubkey_hex.to_string(),
            host: host.to_string(),
            port,
        })
    }
}
