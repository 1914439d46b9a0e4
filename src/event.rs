//! The event union and its wire codec.
//!
//! Events are the only authoritative facts about a swap; everything else
//! ([`crate::state::State`]) is derived by folding them. The wire format is
//! `[u16 BE tag][JSON body]`: the tag selects the variant, the JSON body carries
//! its payload. An unrecognised tag is preserved as [`Event::UnknownTag`] rather
//! than rejected, so a newer writer's events don't break an older reader's replay.

use serde::{Deserialize, Serialize};

use crate::command::SwapStatus;
use crate::deps::PayParams;
use crate::error::{Error, Result};
use crate::state::{LoopIn, LoopOut};
use crate::types::{BlockHeight, PairId, PaymentPreimage, SwapId};

pub const TAG_NEW_LOOP_OUT_ADDED: u16 = 0;
pub const TAG_CLAIM_TX_PUBLISHED: u16 = 1;
pub const TAG_OFF_CHAIN_OFFER_STARTED: u16 = 2;
pub const TAG_OFF_CHAIN_OFFER_RESOLVED: u16 = 3;
pub const TAG_COUNTERPARTY_STATUS_OBSERVED: u16 = 4;
pub const TAG_NEW_LOOP_IN_ADDED: u16 = 256;
pub const TAG_SWAP_TX_PUBLISHED: u16 = 257;
pub const TAG_REFUND_TX_PUBLISHED: u16 = 258;
pub const TAG_NEW_TIP_RECEIVED: u16 = 512;
pub const TAG_FINISHED_SUCCESSFULLY: u16 = 1024;
pub const TAG_FINISHED_BY_REFUND: u16 = 1025;
pub const TAG_FINISHED_BY_ERROR: u16 = 1026;
pub const TAG_FINISHED_BY_TIMEOUT: u16 = 1027;

/// The facts an aggregate's event stream can record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    NewLoopOutAdded(BlockHeight, LoopOut),
    ClaimTxPublished(String),
    OffChainOfferStarted(SwapId, PairId, String, PayParams),
    OffChainOfferResolved(PaymentPreimage),
    /// A counterparty status that actually drove a lockup-seen transition, kept
    /// so a redelivery of the same status can be recognised as a no-op.
    CounterpartyStatusObserved(SwapStatus),
    NewLoopInAdded(BlockHeight, LoopIn),
    SwapTxPublished(String),
    RefundTxPublished(String),
    NewTipReceived(BlockHeight),
    FinishedSuccessfully(SwapId),
    FinishedByRefund(SwapId),
    FinishedByError(SwapId, String),
    FinishedByTimeout(String),
    /// A tag this build doesn't recognise, preserved verbatim for forward-compat replay.
    UnknownTag(u16, Vec<u8>),
}

impl Event {
    pub fn tag(&self) -> u16 {
        match self {
            Event::NewLoopOutAdded(..) => TAG_NEW_LOOP_OUT_ADDED,
            Event::ClaimTxPublished(..) => TAG_CLAIM_TX_PUBLISHED,
            Event::OffChainOfferStarted(..) => TAG_OFF_CHAIN_OFFER_STARTED,
            Event::OffChainOfferResolved(..) => TAG_OFF_CHAIN_OFFER_RESOLVED,
            Event::CounterpartyStatusObserved(..) => TAG_COUNTERPARTY_STATUS_OBSERVED,
            Event::NewLoopInAdded(..) => TAG_NEW_LOOP_IN_ADDED,
            Event::SwapTxPublished(..) => TAG_SWAP_TX_PUBLISHED,
            Event::RefundTxPublished(..) => TAG_REFUND_TX_PUBLISHED,
            Event::NewTipReceived(..) => TAG_NEW_TIP_RECEIVED,
            Event::FinishedSuccessfully(..) => TAG_FINISHED_SUCCESSFULLY,
            Event::FinishedByRefund(..) => TAG_FINISHED_BY_REFUND,
            Event::FinishedByError(..) => TAG_FINISHED_BY_ERROR,
            Event::FinishedByTimeout(..) => TAG_FINISHED_BY_TIMEOUT,
            Event::UnknownTag(tag, _) => *tag,
        }
    }

    /// Encode as `[u16 BE tag][JSON body]`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.tag().to_be_bytes());

        let body = match self {
            Event::NewLoopOutAdded(h, x) => serde_json::to_vec(&(h, x))?,
            Event::ClaimTxPublished(txid) => serde_json::to_vec(txid)?,
            Event::OffChainOfferStarted(id, pair, invoice, params) => {
                serde_json::to_vec(&(id, pair, invoice, params))?
            }
            Event::OffChainOfferResolved(preimage) => serde_json::to_vec(preimage)?,
            Event::CounterpartyStatusObserved(status) => serde_json::to_vec(status)?,
            Event::NewLoopInAdded(h, x) => serde_json::to_vec(&(h, x))?,
            Event::SwapTxPublished(hex) => serde_json::to_vec(hex)?,
            Event::RefundTxPublished(txid) => serde_json::to_vec(txid)?,
            Event::NewTipReceived(h) => serde_json::to_vec(h)?,
            Event::FinishedSuccessfully(id) => serde_json::to_vec(id)?,
            Event::FinishedByRefund(id) => serde_json::to_vec(id)?,
            Event::FinishedByError(id, msg) => serde_json::to_vec(&(id, msg))?,
            Event::FinishedByTimeout(reason) => serde_json::to_vec(reason)?,
            Event::UnknownTag(_, raw_body) => raw_body.clone(),
        };
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a `[u16 BE tag][JSON body]` frame. Unrecognised tags decode to
    /// [`Event::UnknownTag`] with the raw body bytes preserved for re-encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::Input("event frame shorter than the 2-byte tag".to_string()));
        }
        let tag = u16::from_be_bytes([bytes[0], bytes[1]]);
        let body = &bytes[2..];

        let event = match tag {
            TAG_NEW_LOOP_OUT_ADDED => {
                let (h, x) = serde_json::from_slice(body)?;
                Event::NewLoopOutAdded(h, x)
            }
            TAG_CLAIM_TX_PUBLISHED => Event::ClaimTxPublished(serde_json::from_slice(body)?),
            TAG_OFF_CHAIN_OFFER_STARTED => {
                let (id, pair, invoice, params) = serde_json::from_slice(body)?;
                Event::OffChainOfferStarted(id, pair, invoice, params)
            }
            TAG_OFF_CHAIN_OFFER_RESOLVED => {
                Event::OffChainOfferResolved(serde_json::from_slice(body)?)
            }
            TAG_COUNTERPARTY_STATUS_OBSERVED => {
                Event::CounterpartyStatusObserved(serde_json::from_slice(body)?)
            }
            TAG_NEW_LOOP_IN_ADDED => {
                let (h, x) = serde_json::from_slice(body)?;
                Event::NewLoopInAdded(h, x)
            }
            TAG_SWAP_TX_PUBLISHED => Event::SwapTxPublished(serde_json::from_slice(body)?),
            TAG_REFUND_TX_PUBLISHED => Event::RefundTxPublished(serde_json::from_slice(body)?),
            TAG_NEW_TIP_RECEIVED => Event::NewTipReceived(serde_json::from_slice(body)?),
            TAG_FINISHED_SUCCESSFULLY => Event::FinishedSuccessfully(serde_json::from_slice(body)?),
            TAG_FINISHED_BY_REFUND => Event::FinishedByRefund(serde_json::from_slice(body)?),
            TAG_FINISHED_BY_ERROR => {
                let (id, msg) = serde_json::from_slice(body)?;
                Event::FinishedByError(id, msg)
            }
            TAG_FINISHED_BY_TIMEOUT => Event::FinishedByTimeout(serde_json::from_slice(body)?),
            other => Event::UnknownTag(other, body.to_vec()),
        };
        Ok(event)
    }
}
