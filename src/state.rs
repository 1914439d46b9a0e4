//! Swap state: the derived, immutable value folded from an event stream.

use serde::{Deserialize, Serialize};

use crate::command::SwapStatus;
use crate::script::RedeemScript;
use crate::types::{Asset, BlockHeight, Outcome, PairId, PaymentPreimage, SwapId};

/// Loop-out (reverse) swap parameters and accumulated on-chain facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOut {
    pub id: SwapId,
    pub pair_id: PairId,
    pub status: String,
    /// Private key controlling the claim path; hex-encoded, never logged.
    #[serde(with = "hex_secret_key")]
    pub claim_key: [u8; 32],
    pub preimage: PaymentPreimage,
    pub redeem_script: RedeemScript,
    pub claim_address: String,
    pub invoice: String,
    pub prepay_invoice: Option<String>,
    pub on_chain_amount: u64,
    pub timeout_block_height: BlockHeight,
    pub sweep_conf_target: u32,
    pub max_miner_fee: u64,
    pub accept_zero_conf: bool,
    pub lockup_tx_hex: Option<String>,
    pub claim_transaction_id: Option<String>,
    /// Last counterparty-reported status that actually drove a lockup-seen
    /// transition (`TxMempool`/`TxConfirmed`); lets a redelivered update of the
    /// same status short-circuit instead of re-broadcasting the claim tx.
    pub last_counterparty_status: Option<SwapStatus>,
}

/// Loop-in (forward) swap parameters and accumulated on-chain facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopIn {
    pub id: SwapId,
    pub pair_id: PairId,
    pub status: String,
    /// Private key controlling the refund path; hex-encoded, never logged.
    #[serde(with = "hex_secret_key")]
    pub refund_private_key: [u8; 32],
    pub redeem_script: RedeemScript,
    pub expected_amount: u64,
    pub timeout_block_height: BlockHeight,
    pub htlc_conf_target: u32,
    pub lockup_tx_hex: Option<String>,
    pub refund_transaction_id: Option<String>,
}

/// The derived state of a swap: the left fold of its event stream from `Zero`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum State {
    HasNotStarted,
    Out {
        block_height: BlockHeight,
        loop_out: LoopOut,
    },
    In {
        block_height: BlockHeight,
        loop_in: LoopIn,
    },
    Finished {
        outcome: Outcome,
    },
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Finished { .. })
    }

    pub fn swap_id(&self) -> Option<&SwapId> {
        match self {
            State::HasNotStarted => None,
            State::Out { loop_out, .. } => Some(&loop_out.id),
            State::In { loop_in, .. } => Some(&loop_in.id),
            State::Finished { .. } => None,
        }
    }

    pub fn base_asset(&self) -> Option<Asset> {
        match self {
            State::Out { loop_out, .. } => Some(loop_out.pair_id.base_asset()),
            State::In { loop_in, .. } => Some(loop_in.pair_id.base_asset()),
            _ => None,
        }
    }
}

/// Hex-encodes a 32-byte secret key for (de)serialization; kept in its own module
/// so the representation can be swapped without touching call sites.
mod hex_secret_key {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

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
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
