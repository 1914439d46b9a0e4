//! Claim, refund, and swap-funding transaction construction.
//!
//! Claim and refund transactions are built in two passes: an unsigned skeleton is
//! signed once to measure its virtual size, the fee is computed from that size, the
//! output value is corrected, and the transaction is re-signed (the signature
//! commits to the output values, so the first signature is only a sizing probe).

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::error::{Error, Result};
use crate::script::RedeemScript;
use crate::types::{BlockHeight, FeeRate, PaymentPreimage};

/// Signals replaceability so a stuck claim/refund can be fee-bumped.
const RBF_SEQUENCE: Sequence = Sequence(0xFFFF_FFFD);
/// Any value below `0xFFFFFFFF` makes `nLockTime` binding.
const LOCKTIME_SEQUENCE: Sequence = Sequence(0xFFFF_FFFE);

/// Estimated vsize contribution of a single P2WPKH input signed with SIGHASH_ALL,
/// used to size a not-yet-signed swap-funding PSBT.
const ESTIMATED_P2WPKH_INPUT_VSIZE: u64 = 68;
const ESTIMATED_OUTPUT_VSIZE: u64 = 31;
const ESTIMATED_BASE_TX_VSIZE: u64 = 11;

/// Find the output in `lockup_tx` that funds this HTLC, accepting either a native
/// P2WSH or a nested (P2SH-wrapped) P2WSH commitment to `redeem_script`.
fn find_lockup_output(lockup_tx: &Transaction, redeem_script: &RedeemScript) -> Result<(u32, TxOut)> {
    let p2wsh = redeem_script.to_p2wsh();
    let p2sh_p2wsh = redeem_script.to_p2sh_p2wsh();

    lockup_tx
        .output
        .iter()
        .enumerate()
        .find(|(_, out)| out.script_pubkey == p2wsh || out.script_pubkey == p2sh_p2wsh)
        .map(|(vout, out)| (vout as u32, out.clone()))
        .ok_or_else(|| {
            let actual_spks = lockup_tx
                .output
                .iter()
                .map(|o| o.script_pubkey.to_hex_string())
                .collect();
            Error::RedeemScriptMismatch {
                actual_spks,
                expected_redeem: redeem_script.to_p2wsh().to_hex_string(),
            }
        })
}

fn sign_htlc_input(
    tx: &mut Transaction,
    input_value: Amount,
    redeem_script: &RedeemScript,
    secret_key: &SecretKey,
    witness_second_element: &[u8],
) -> Result<()> {
    let sighash_type = EcdsaSighashType::All;
    let secp = Secp256k1::new();

    let sighash = SighashCache::new(&*tx)
        .p2wsh_signature_hash(0, redeem_script.script(), input_value, sighash_type)
        .map_err(|e| Error::Transaction(format!("failed to compute sighash: {e}")))?;

    let msg = Message::from_digest(sighash.to_byte_array());
    let sig = secp.sign_ecdsa(&msg, secret_key);

    let mut sig_bytes = sig.serialize_der().to_vec();
    sig_bytes.push(sighash_type.to_u32() as u8);

    tx.input[0].witness = Witness::from_slice(&[
        sig_bytes,
        witness_second_element.to_vec(),
        redeem_script.script().to_bytes(),
    ]);

    Ok(())
}

/// Build a one-input transaction sweeping the HTLC's claim branch: `[sig, preimage,
/// redeem_script]`. Sends the lockup amount, minus the fee, to `claim_address`.
pub fn build_claim_tx(
    lockup_tx: &Transaction,
    redeem_script: &RedeemScript,
    claim_privkey: &SecretKey,
    preimage: &PaymentPreimage,
    claim_address: &Address,
    fee_rate: FeeRate,
) -> Result<Transaction> {
    let (vout, lockup_output) = find_lockup_output(lockup_tx, redeem_script)?;
    let input_value = lockup_output.value;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(lockup_tx.compute_txid(), vout),
            script_sig: ScriptBuf::new(),
            sequence: RBF_SEQUENCE,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: input_value,
            script_pubkey: claim_address.script_pubkey(),
        }],
    };

    sign_htlc_input(
        &mut tx,
        input_value,
        redeem_script,
        claim_privkey,
        preimage.as_bytes(),
    )?;

    let fee = fee_rate.fee_for_vsize(tx.vsize() as u64);
    if fee >= input_value.to_sat() {
        return Err(Error::Transaction(
            "claim fee would consume the entire lockup output".to_string(),
        ));
    }
    tx.output[0].value = Amount::from_sat(input_value.to_sat() - fee);

    sign_htlc_input(
        &mut tx,
        input_value,
        redeem_script,
        claim_privkey,
        preimage.as_bytes(),
    )?;

    Ok(tx)
}

/// Build a one-input transaction sweeping the HTLC's refund branch: `[sig,
/// empty_push, redeem_script]`, locked until `timeout`.
pub fn build_refund_tx(
    lockup_tx: &Transaction,
    redeem_script: &RedeemScript,
    refund_privkey: &SecretKey,
    refund_address: &Address,
    fee_rate: FeeRate,
    timeout: BlockHeight,
) -> Result<Transaction> {
    let (vout, lockup_output) = find_lockup_output(lockup_tx, redeem_script)?;
    let input_value = lockup_output.value;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_height(timeout.0)
            .map_err(|e| Error::Transaction(format!("invalid timeout height: {e}")))?,
        input: vec![TxIn {
            previous_output: OutPoint::new(lockup_tx.compute_txid(), vout),
            script_sig: ScriptBuf::new(),
            sequence: LOCKTIME_SEQUENCE,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: input_value,
            script_pubkey: refund_address.script_pubkey(),
        }],
    };

    sign_htlc_input(&mut tx, input_value, redeem_script, refund_privkey, &[])?;

    let fee = fee_rate.fee_for_vsize(tx.vsize() as u64);
    if fee >= input_value.to_sat() {
        return Err(Error::Transaction(
            "refund fee would consume the entire lockup output".to_string(),
        ));
    }
    tx.output[0].value = Amount::from_sat(input_value.to_sat() - fee);

    sign_htlc_input(&mut tx, input_value, redeem_script, refund_privkey, &[])?;

    Ok(tx)
}

/// Build an unsigned PSBT paying `output_amount` to the HTLC's P2WSH, with change
/// back to `change_address`. `inputs` must already have been locked by the UTXO
/// provider; signing and finalization happen outside the core.
pub fn build_swap_psbt(
    inputs: &[(OutPoint, TxOut)],
    redeem_script: &RedeemScript,
    output_amount: Amount,
    fee_rate: FeeRate,
    change_address: &Address,
) -> Result<Psbt> {
    if inputs.is_empty() {
        return Err(Error::Transaction(
            "cannot build a swap transaction with no inputs".to_string(),
        ));
    }

    let total_input: Amount = inputs.iter().map(|(_, out)| out.value).sum();
    if total_input < output_amount {
        return Err(Error::Transaction(format!(
            "selected inputs ({total_input}) do not cover the swap amount ({output_amount})"
        )));
    }

    let estimated_vsize = ESTIMATED_BASE_TX_VSIZE
        + ESTIMATED_P2WPKH_INPUT_VSIZE * inputs.len() as u64
        + ESTIMATED_OUTPUT_VSIZE * 2;
    let fee = fee_rate.fee_for_vsize(estimated_vsize);

    let remainder = total_input.to_sat().saturating_sub(output_amount.to_sat());
    if remainder < fee {
        return Err(Error::Transaction(format!(
            "selected inputs ({total_input}) do not cover the swap amount plus fee ({} + {fee})",
            output_amount
        )));
    }
    let change_value = remainder - fee;

    let mut tx_outputs = vec![TxOut {
        value: output_amount,
        script_pubkey: redeem_script.to_p2wsh(),
    }];
    const DUST_LIMIT_SAT: u64 = 546;
    if change_value >= DUST_LIMIT_SAT {
        tx_outputs.push(TxOut {
            value: Amount::from_sat(change_value),
            script_pubkey: change_address.script_pubkey(),
        });
    }

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|(outpoint, _)| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: RBF_SEQUENCE,
                witness: Witness::new(),
            })
            .collect(),
        output: tx_outputs,
    };

    let mut psbt =
        Psbt::from_unsigned_tx(tx).map_err(|e| Error::Transaction(format!("invalid PSBT: {e}")))?;

    for (psbt_input, (_, utxo)) in psbt.inputs.iter_mut().zip(inputs.iter()) {
        psbt_input.witness_utxo = Some(utxo.clone());
    }

    Ok(psbt)
}
