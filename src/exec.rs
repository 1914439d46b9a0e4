//! The command executor: the only place a swap's event stream grows from.
//!
//! `exec` is pure-ish — every side effect goes through `deps`, every input is
//! `state` plus `command`, and the only output is a vector of events to append
//! (or an error, which appends nothing). Illegal `(state, command)` pairings in a
//! non-terminal state are programmer errors, not user errors, and surface as
//! [`Error::Unexpected`].

use bitcoin::secp256k1::SecretKey;
use bitcoin::{Amount, Transaction};

use crate::command::{ChainContext, Command, Meta, SwapStatus};
use crate::deps::Deps;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::fee::{self, CapDecision};
use crate::state::{LoopIn, LoopOut, State};
use crate::tx;

/// Blocks before timeout beyond which revealing the preimage is unsafe: the
/// counterparty could still win a refund race after we've given up our only
/// leverage.
pub const MIN_PREIMAGE_REVEAL_DELTA: u32 = 20;

/// Run one command against the current state, producing the events it raises.
pub async fn exec(
    state: &State,
    command: Command,
    deps: &Deps<'_>,
    meta: Meta,
) -> Result<Vec<Event>> {
    match (state, command) {
        (State::Finished { .. }, _) => Ok(vec![]),

        (State::HasNotStarted, Command::NewLoopOut(height, params, loop_out)) => {
            exec_new_loop_out(height, params, loop_out, deps).await
        }
        (State::HasNotStarted, Command::NewLoopIn(height, loop_in)) => {
            validate_loop_in(&loop_in)?;
            Ok(vec![Event::NewLoopInAdded(height, loop_in)])
        }

        (State::Out { loop_out, .. }, Command::OffChainOfferResolve(preimage)) => {
            Ok(vec![
                Event::OffChainOfferResolved(preimage),
                Event::FinishedSuccessfully(loop_out.id.clone()),
            ])
        }

        (State::Out { block_height, loop_out }, Command::SwapUpdate(update)) => {
            exec_swap_update_out(*block_height, loop_out, update, deps).await
        }

        (State::In { loop_in, .. }, Command::SwapUpdate(update)) => {
            exec_swap_update_in(loop_in, update, deps).await
        }

        (State::Out { block_height, loop_out }, Command::NewBlock(h, ChainContext::Base)) => {
            exec_new_block_out(*block_height, loop_out, h, deps).await
        }

        (State::In { block_height, loop_in }, Command::NewBlock(h, ChainContext::Quote)) => {
            exec_new_block_in(*block_height, loop_in, h, deps).await
        }

        // NewBlock against the wrong chain context for this swap's asset is simply
        // not our concern this tick.
        (State::Out { .. }, Command::NewBlock(_, ChainContext::Quote))
        | (State::In { .. }, Command::NewBlock(_, ChainContext::Base)) => Ok(vec![]),

        (State::Out { loop_out, .. }, Command::SetValidationError(msg)) => {
            Ok(vec![Event::FinishedByError(loop_out.id.clone(), msg)])
        }
        (State::In { loop_in, .. }, Command::SetValidationError(msg)) => {
            Ok(vec![Event::FinishedByError(loop_in.id.clone(), msg)])
        }

        (state, command) => Err(Error::UnexpectedCommand {
            command: format!("{command:?}"),
            state: format!("{state:?}"),
        }),
    }
}

fn validate_loop_out(loop_out: &LoopOut) -> Result<()> {
    if loop_out.on_chain_amount == 0 {
        return Err(Error::Input("loop-out on-chain amount must be non-zero".to_string()));
    }
    let expected_hash = loop_out.preimage.payment_hash();
    if loop_out.redeem_script.payment_hash() != expected_hash {
        return Err(Error::Input(
            "redeem script payment hash does not match our preimage".to_string(),
        ));
    }
    Ok(())
}

fn validate_loop_in(loop_in: &LoopIn) -> Result<()> {
    if loop_in.expected_amount == 0 {
        return Err(Error::Input("loop-in expected amount must be non-zero".to_string()));
    }
    Ok(())
}

async fn exec_new_loop_out(
    height: crate::types::BlockHeight,
    params: crate::command::NewLoopOutParams,
    loop_out: LoopOut,
    deps: &Deps<'_>,
) -> Result<Vec<Event>> {
    validate_loop_out(&loop_out)?;

    if let Some(prepay_invoice) = loop_out.prepay_invoice.clone() {
        deps.invoice_payer
            .pay_invoice(
                &prepay_invoice,
                crate::deps::PayParams {
                    max_fee_sat: params.max_prepay_fee_sat,
                    outgoing_chan_id: params.outgoing_chan_id.clone(),
                },
            )
            .await?;
    }

    let pay_params = crate::deps::PayParams {
        max_fee_sat: params.max_payment_fee_sat,
        outgoing_chan_id: params.outgoing_chan_id,
    };

    Ok(vec![
        Event::NewLoopOutAdded(height, loop_out.clone()),
        Event::OffChainOfferStarted(
            loop_out.id.clone(),
            loop_out.pair_id,
            loop_out.invoice.clone(),
            pay_params,
        ),
    ])
}

async fn exec_swap_update_out(
    block_height: crate::types::BlockHeight,
    loop_out: &LoopOut,
    update: crate::command::SwapStatusUpdate,
    deps: &Deps<'_>,
) -> Result<Vec<Event>> {
    match update.status {
        SwapStatus::TxMempool if !loop_out.accept_zero_conf => Ok(vec![]),
        SwapStatus::TxMempool | SwapStatus::TxConfirmed => {
            if loop_out.last_counterparty_status == Some(update.status) {
                log::debug!("swap {} status {:?} unchanged, ignoring redelivery", loop_out.id, update.status);
                return Ok(vec![]);
            }
            let tx_update = update
                .transaction
                .ok_or_else(|| Error::Input("swap update missing transaction".to_string()))?;
            let mut events = vec![Event::CounterpartyStatusObserved(update.status)];
            events.extend(sweep_or_bump(block_height, loop_out, &tx_update.tx_hex, deps).await?);
            Ok(events)
        }
        SwapStatus::SwapExpired => {
            log::info!("swap {} -> SwapExpired", loop_out.id);
            Ok(vec![Event::FinishedByTimeout(
                update.reason.unwrap_or_else(|| "swap expired".to_string()),
            )])
        }
        _ => Ok(vec![]),
    }
}

/// Build (or rebuild) the claim tx under the fee cap and broadcast it if the
/// cap allows, per spec.md §4.2's Sweep-or-Bump policy.
async fn sweep_or_bump(
    block_height: crate::types::BlockHeight,
    loop_out: &LoopOut,
    lockup_tx_hex: &str,
    deps: &Deps<'_>,
) -> Result<Vec<Event>> {
    let mut events = vec![Event::SwapTxPublished(lockup_tx_hex.to_string())];

    let lockup_tx = decode_tx_hex(lockup_tx_hex)?;
    let claim_address = loop_out
        .claim_address
        .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
        .map_err(|e| Error::Transaction(format!("invalid claim address: {e}")))?
        .assume_checked();
    let claim_key = SecretKey::from_slice(&loop_out.claim_key)
        .map_err(|e| Error::Transaction(format!("invalid claim key: {e}")))?;

    let conf_target = fee::sweep_conf_target(
        block_height,
        loop_out.timeout_block_height,
        loop_out.sweep_conf_target,
    );
    let rate = deps
        .fee_estimator
        .estimate_fee(conf_target, loop_out.pair_id.base_asset())
        .await?;

    let candidate = tx::build_claim_tx(
        &lockup_tx,
        &loop_out.redeem_script,
        &claim_key,
        &loop_out.preimage,
        &claim_address,
        rate,
    )?;

    let preimage_revealed = loop_out.claim_transaction_id.is_some();
    match fee::evaluate_claim_fee_cap(loop_out.max_miner_fee, rate, &candidate, preimage_revealed) {
        CapDecision::Wait => {}
        CapDecision::Publish(rate) | CapDecision::Bump(rate) => {
            let final_tx = tx::build_claim_tx(
                &lockup_tx,
                &loop_out.redeem_script,
                &claim_key,
                &loop_out.preimage,
                &claim_address,
                rate,
            )?;
            let txid = deps
                .broadcaster
                .broadcast_tx(&final_tx, loop_out.pair_id.base_asset())
                .await?;
            log::info!("swap {} claim tx broadcast: {}", loop_out.id, txid);
            events.push(Event::ClaimTxPublished(txid.to_string()));
        }
    }

    Ok(events)
}

async fn exec_swap_update_in(
    loop_in: &LoopIn,
    update: crate::command::SwapStatusUpdate,
    deps: &Deps<'_>,
) -> Result<Vec<Event>> {
    match update.status {
        SwapStatus::InvoiceSet => {
            let change_address = deps
                .address_source
                .get_change_address(loop_in.pair_id.base_asset())
                .await?;
            let rate = deps
                .fee_estimator
                .estimate_fee(loop_in.htlc_conf_target, loop_in.pair_id.base_asset())
                .await?;
            let amount = Amount::from_sat(loop_in.expected_amount);
            let utxos = deps
                .utxo_provider
                .select_utxos(amount, loop_in.pair_id.base_asset())
                .await
                .map_err(|e| Error::UtxoProvider(e.to_string()))?;

            let inputs: Vec<_> = utxos.iter().map(|u| (u.outpoint, u.txout.clone())).collect();
            let psbt = tx::build_swap_psbt(&inputs, &loop_in.redeem_script, amount, rate, &change_address);
            let psbt = match psbt {
                Ok(p) => p,
                Err(e) => {
                    deps.utxo_provider.release(&utxos).await?;
                    return Err(e);
                }
            };

            let tx = psbt.extract_tx().map_err(|e| Error::Transaction(format!("failed to extract tx: {e}")))?;
            let txid = deps.broadcaster.broadcast_tx(&tx, loop_in.pair_id.base_asset()).await?;
            log::info!("swap {} lockup tx broadcast: {}", loop_in.id, txid);
            Ok(vec![Event::SwapTxPublished(tx_to_hex(&tx))])
        }
        SwapStatus::TxClaimed => {
            log::info!("swap {} -> TxClaimed", loop_in.id);
            Ok(vec![Event::FinishedSuccessfully(loop_in.id.clone())])
        }
        SwapStatus::TxConfirmed
        | SwapStatus::InvoicePayed
        | SwapStatus::InvoiceFailedToPay
        | SwapStatus::SwapExpired => Ok(vec![]),
        _ => Ok(vec![]),
    }
}

async fn exec_new_block_out(
    block_height: crate::types::BlockHeight,
    loop_out: &LoopOut,
    new_height: crate::types::BlockHeight,
    deps: &Deps<'_>,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    if new_height > block_height {
        events.push(Event::NewTipReceived(new_height));
    }

    let remaining = new_height.remaining_until(loop_out.timeout_block_height);
    if remaining <= MIN_PREIMAGE_REVEAL_DELTA && loop_out.claim_transaction_id.is_none() {
        log::info!(
            "swap {} -> FinishedByTimeout (remaining {remaining} blocks, no claim tx)",
            loop_out.id
        );
        events.push(Event::FinishedByTimeout(
            "cannot safely reveal preimage".to_string(),
        ));
        return Ok(events);
    }

    if let Some(lockup_tx_hex) = &loop_out.lockup_tx_hex {
        let mut bump_events = sweep_or_bump(new_height, loop_out, lockup_tx_hex, deps).await?;
        bump_events.retain(|e| matches!(e, Event::ClaimTxPublished(_)));
        events.extend(bump_events);
    }

    Ok(events)
}

async fn exec_new_block_in(
    block_height: crate::types::BlockHeight,
    loop_in: &LoopIn,
    new_height: crate::types::BlockHeight,
    deps: &Deps<'_>,
) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    if new_height > block_height {
        events.push(Event::NewTipReceived(new_height));
    }

    if new_height >= loop_in.timeout_block_height {
        if let Some(lockup_tx_hex) = &loop_in.lockup_tx_hex {
            let lockup_tx = decode_tx_hex(lockup_tx_hex)?;
            let refund_address = deps
                .address_source
                .get_refund_address(loop_in.pair_id.base_asset())
                .await?;
            let refund_key = SecretKey::from_slice(&loop_in.refund_private_key)
                .map_err(|e| Error::Transaction(format!("invalid refund key: {e}")))?;
            let rate = deps
                .fee_estimator
                .estimate_fee(loop_in.htlc_conf_target, loop_in.pair_id.base_asset())
                .await?;

            let refund_tx = tx::build_refund_tx(
                &lockup_tx,
                &loop_in.redeem_script,
                &refund_key,
                &refund_address,
                rate,
                loop_in.timeout_block_height,
            )?;
            let txid = deps
                .broadcaster
                .broadcast_tx(&refund_tx, loop_in.pair_id.base_asset())
                .await?;
            log::info!("swap {} refund tx broadcast: {}", loop_in.id, txid);
            events.push(Event::RefundTxPublished(txid.to_string()));
            events.push(Event::FinishedByRefund(loop_in.id.clone()));
        }
    }

    Ok(events)
}

fn decode_tx_hex(hex_str: &str) -> Result<Transaction> {
    use bitcoin::consensus::encode::deserialize;
    let bytes = hex::decode(hex_str).map_err(|e| Error::Transaction(format!("invalid tx hex: {e}")))?;
    deserialize(&bytes).map_err(|e| Error::Transaction(format!("invalid tx bytes: {e}")))
}

fn tx_to_hex(tx: &Transaction) -> String {
    use bitcoin::consensus::encode::serialize;
    hex::encode(serialize(tx))
}
