//! Commands: the only way a swap's state can change, and the metadata that
//! accompanies every attempt to apply one.

use serde::{Deserialize, Serialize};

use crate::state::{LoopIn, LoopOut};
use crate::types::BlockHeight;

/// Parameters accompanying a brand-new loop-out request, beyond the `LoopOut`
/// record itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLoopOutParams {
    pub max_prepay_fee_sat: u64,
    pub max_payment_fee_sat: u64,
    pub outgoing_chan_id: Option<String>,
}

/// A status update relayed from the counterparty swap-service's status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapStatusUpdate {
    pub status: SwapStatus,
    pub transaction: Option<TransactionUpdate>,
    pub reason: Option<String>,
}

/// A counterparty-reported transaction, as embedded in a status update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    pub tx_hex: String,
}

/// The statuses a counterparty swap-service can report for a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapStatus {
    TxMempool,
    TxConfirmed,
    TxClaimed,
    InvoiceSet,
    InvoicePayed,
    InvoiceFailedToPay,
    SwapExpired,
    Other,
}

/// The coin-chain a `NewBlock` command reports a new tip for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainContext {
    Base,
    Quote,
}

/// Commands accepted by [`crate::exec::exec`]; the only way a swap's event
/// stream grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    NewLoopOut(BlockHeight, NewLoopOutParams, LoopOut),
    NewLoopIn(BlockHeight, LoopIn),
    SwapUpdate(SwapStatusUpdate),
    OffChainOfferResolve(crate::types::PaymentPreimage),
    SetValidationError(String),
    NewBlock(BlockHeight, ChainContext),
}

/// Where a command originated, for audit and sort-key purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandSource {
    /// Issued by our own wallet/CLI/API layer.
    Local,
    /// Relayed from the counterparty swap-service's status stream.
    Counterparty,
    /// Raised by the block-tip watcher.
    BlockWatcher,
}

/// Metadata accompanying every command dispatched to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(with = "time::serde::rfc3339")]
    pub effective_date: time::OffsetDateTime,
    pub source: CommandSource,
}

impl Meta {
    pub fn new(effective_date: time::OffsetDateTime, source: CommandSource) -> Self {
        Self {
            effective_date,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trips_through_json() {
        let meta = Meta::new(time::OffsetDateTime::UNIX_EPOCH, CommandSource::BlockWatcher);
        let json = serde_json::to_string(&meta).unwrap();
        let back: Meta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
