//! The pure fold from event stream to derived [`State`].
//!
//! `apply` never fails and never suspends: every branch not named in the table
//! below leaves the state unchanged, so replaying an unexpected event sequence
//! degrades gracefully instead of panicking.

use crate::event::Event;
use crate::state::State;
use crate::types::Outcome;

/// Fold one event into the current state.
pub fn apply(state: State, event: &Event) -> State {
    match (state, event) {
        (State::HasNotStarted, Event::NewLoopOutAdded(h, x)) => State::Out {
            block_height: *h,
            loop_out: x.clone(),
        },
        (State::HasNotStarted, Event::NewLoopInAdded(h, x)) => State::In {
            block_height: *h,
            loop_in: x.clone(),
        },

        (
            State::Out {
                block_height,
                mut loop_out,
            },
            Event::ClaimTxPublished(txid),
        ) => {
            loop_out.claim_transaction_id = Some(txid.clone());
            State::Out { block_height, loop_out }
        }

        (
            State::Out {
                block_height,
                mut loop_out,
            },
            Event::SwapTxPublished(hex),
        ) => {
            loop_out.lockup_tx_hex = Some(hex.clone());
            State::Out { block_height, loop_out }
        }

        (
            State::Out {
                block_height,
                mut loop_out,
            },
            Event::OffChainOfferResolved(preimage),
        ) => {
            loop_out.preimage = *preimage;
            State::Out { block_height, loop_out }
        }

        (
            State::Out {
                block_height,
                mut loop_out,
            },
            Event::CounterpartyStatusObserved(status),
        ) => {
            loop_out.last_counterparty_status = Some(*status);
            State::Out { block_height, loop_out }
        }

        (
            State::In {
                block_height,
                mut loop_in,
            },
            Event::SwapTxPublished(hex),
        ) => {
            loop_in.lockup_tx_hex = Some(hex.clone());
            State::In { block_height, loop_in }
        }

        (
            State::In {
                block_height,
                mut loop_in,
            },
            Event::RefundTxPublished(txid),
        ) => {
            loop_in.refund_transaction_id = Some(txid.clone());
            State::In { block_height, loop_in }
        }

        (
            State::Out {
                loop_out,
                ..
            },
            Event::NewTipReceived(h),
        ) => State::Out {
            block_height: *h,
            loop_out,
        },

        (
            State::In {
                loop_in,
                ..
            },
            Event::NewTipReceived(h),
        ) => State::In {
            block_height: *h,
            loop_in,
        },

        (s @ (State::Out { .. } | State::In { .. }), Event::FinishedSuccessfully(_)) => {
            let _ = s;
            State::Finished {
                outcome: Outcome::Success,
            }
        }

        (s @ (State::Out { .. } | State::In { .. }), Event::FinishedByError(_, msg)) => {
            let _ = s;
            State::Finished {
                outcome: Outcome::Errored(msg.clone()),
            }
        }

        (
            State::In {
                loop_in,
                ..
            },
            Event::FinishedByRefund(_),
        ) => match loop_in.refund_transaction_id {
            Some(txid) => State::Finished {
                outcome: Outcome::Refunded(txid),
            },
            None => State::In {
                block_height: loop_in.timeout_block_height,
                loop_in,
            },
        },

        (s @ (State::Out { .. } | State::In { .. }), Event::FinishedByTimeout(reason)) => {
            let _ = s;
            State::Finished {
                outcome: Outcome::Timeout(reason.clone()),
            }
        }

        (unchanged, _) => unchanged,
    }
}

/// Left-fold an entire stream from [`State::HasNotStarted`].
pub fn fold(events: &[Event]) -> State {
    events
        .iter()
        .fold(State::HasNotStarted, |state, event| apply(state, event))
}
