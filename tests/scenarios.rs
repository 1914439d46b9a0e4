//! End-to-end scenarios driving `exec` and `apply` together across a whole
//! swap lifecycle, against in-memory fakes for every external collaborator.

use std::collections::VecDeque;
use std::sync::Mutex;

use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{PublicKey as SecpPublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, CompressedPublicKey, Network, OutPoint, PublicKey, Transaction, TxOut, Txid};

use nloop_core::apply::apply;
use nloop_core::command::{
    ChainContext, Command, CommandSource, Meta, NewLoopOutParams, SwapStatus, SwapStatusUpdate,
    TransactionUpdate,
};
use nloop_core::deps::{AddressSource, Broadcaster, Deps, DepsFuture, FeeEstimator, InvoicePayer, PayParams, Utxo, UtxoProvider};
use nloop_core::event::Event;
use nloop_core::script::RedeemScript;
use nloop_core::state::{LoopIn, LoopOut, State};
use nloop_core::types::{Asset, BlockHeight, FeeRate, Outcome, PairId, PaymentHash, PaymentPreimage, SwapId};

/// Returns each broadcast transaction's own txid, so distinct transactions (e.g. a
/// claim tx rebuilt at a bumped fee) naturally get distinct results.
struct RecordingBroadcaster {
    broadcasts: Mutex<Vec<Transaction>>,
}

impl RecordingBroadcaster {
    fn new() -> Self {
        Self {
            broadcasts: Mutex::new(Vec::new()),
        }
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast_tx(&self, tx: &Transaction, _asset: Asset) -> DepsFuture<'_, Txid> {
        let tx = tx.clone();
        Box::pin(async move {
            let txid = tx.compute_txid();
            self.broadcasts.lock().unwrap().push(tx);
            Ok(txid)
        })
    }
}

/// Returns a different quoted rate on each call, repeating the last one once
/// exhausted — used to drive S3's cap-then-bump sequence.
struct SequencedFeeEstimator {
    rates: Mutex<VecDeque<FeeRate>>,
}

impl SequencedFeeEstimator {
    fn new(rates: Vec<FeeRate>) -> Self {
        Self {
            rates: Mutex::new(rates.into()),
        }
    }
}

impl FeeEstimator for SequencedFeeEstimator {
    fn estimate_fee(&self, _conf_target: u32, _asset: Asset) -> DepsFuture<'_, FeeRate> {
        Box::pin(async move {
            let mut rates = self.rates.lock().unwrap();
            let rate = if rates.len() > 1 { rates.pop_front().unwrap() } else { *rates.front().unwrap() };
            Ok(rate)
        })
    }
}

struct FixedUtxoProvider {
    utxos: Vec<Utxo>,
}

impl UtxoProvider for FixedUtxoProvider {
    fn select_utxos(&self, _amount: Amount, _asset: Asset) -> DepsFuture<'_, Vec<Utxo>> {
        let utxos = self.utxos.clone();
        Box::pin(async move { Ok(utxos) })
    }

    fn release(&self, _utxos: &[Utxo]) -> DepsFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }
}

struct FixedAddressSource(Address);

impl AddressSource for FixedAddressSource {
    fn get_change_address(&self, _asset: Asset) -> DepsFuture<'_, Address> {
        let addr = self.0.clone();
        Box::pin(async move { Ok(addr) })
    }

    fn get_refund_address(&self, _asset: Asset) -> DepsFuture<'_, Address> {
        let addr = self.0.clone();
        Box::pin(async move { Ok(addr) })
    }
}

struct NoopInvoicePayer;

impl InvoicePayer for NoopInvoicePayer {
    fn pay_invoice(&self, _invoice: &str, _params: PayParams) -> DepsFuture<'_, ()> {
        Box::pin(async move { Ok(()) })
    }
}

fn keypair(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    (sk, PublicKey::new(SecpPublicKey::from_secret_key(&secp, &sk)))
}

fn p2wpkh(pk: PublicKey) -> Address {
    Address::p2wpkh(&CompressedPublicKey(pk.inner), Network::Regtest)
}

fn fund_lockup_tx(redeem_script: &RedeemScript, amount: Amount) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![],
        output: vec![TxOut {
            value: amount,
            script_pubkey: redeem_script.to_p2wsh(),
        }],
    }
}

fn tx_hex(tx: &Transaction) -> String {
    hex::encode(serialize(tx))
}

fn sample_loop_out(timeout: BlockHeight, accept_zero_conf: bool) -> LoopOut {
    let (claim_sk, claim_pk) = keypair(3);
    let (_, refund_pk) = keypair(4);
    let preimage = PaymentPreimage::from_bytes([9u8; 32]);
    let hash = preimage.payment_hash();
    let redeem_script = RedeemScript::new_loop_out(hash, claim_pk, refund_pk, timeout);
    LoopOut {
        id: SwapId::new("loop-out-1"),
        pair_id: PairId::btc_ltc(),
        status: "created".to_string(),
        claim_key: claim_sk.secret_bytes(),
        preimage,
        redeem_script,
        claim_address: p2wpkh(claim_pk).to_string(),
        invoice: "lnbc1...".to_string(),
        prepay_invoice: None,
        on_chain_amount: 100_000,
        timeout_block_height: timeout,
        sweep_conf_target: 9,
        max_miner_fee: 20_000,
        accept_zero_conf,
        lockup_tx_hex: None,
        claim_transaction_id: None,
        last_counterparty_status: None,
    }
}

fn sample_loop_in(timeout: BlockHeight) -> LoopIn {
    let (_, claim_pk) = keypair(6);
    let (refund_sk, refund_pk) = keypair(7);
    let hash = PaymentHash::from_bytes(bitcoin::hashes::sha256::Hash::hash(b"loop-in").to_byte_array());
    let redeem_script = RedeemScript::new_loop_in(hash, claim_pk, refund_pk, timeout);
    LoopIn {
        id: SwapId::new("loop-in-1"),
        pair_id: PairId::btc_ltc(),
        status: "created".to_string(),
        refund_private_key: refund_sk.secret_bytes(),
        redeem_script,
        expected_amount: 50_000,
        timeout_block_height: timeout,
        htlc_conf_target: 3,
        lockup_tx_hex: None,
        refund_transaction_id: None,
    }
}

/// Drive `state` through `command`, fold the resulting events into the next
/// state, and return both the emitted events and the new state.
async fn step(state: &State, command: Command, deps: &Deps<'_>) -> (Vec<Event>, State) {
    let meta = Meta::new(time::OffsetDateTime::UNIX_EPOCH, CommandSource::Counterparty);
    let events = nloop_core::exec::exec(state, command, deps, meta).await.unwrap();
    let next = events.iter().fold(state.clone(), |s, e| apply(s, e));
    (events, next)
}

fn decode_tx(hex_str: &str) -> Transaction {
    deserialize(&hex::decode(hex_str).unwrap()).unwrap()
}

#[tokio::test]
async fn s1_loop_out_happy_path_zero_conf_off() {
    let loop_out = sample_loop_out(BlockHeight(150), false);
    let lockup_tx = fund_lockup_tx(&loop_out.redeem_script, Amount::from_sat(100_000));
    let lockup_hex = tx_hex(&lockup_tx);

    let broadcaster = RecordingBroadcaster::new();
    let fee_estimator = SequencedFeeEstimator::new(vec![FeeRate(5)]);
    let utxo_provider = FixedUtxoProvider { utxos: vec![] };
    let address_source = FixedAddressSource(p2wpkh(keypair(20).1));
    let invoice_payer = NoopInvoicePayer;
    let deps = Deps {
        broadcaster: &broadcaster,
        fee_estimator: &fee_estimator,
        utxo_provider: &utxo_provider,
        address_source: &address_source,
        invoice_payer: &invoice_payer,
    };

    let mut state = State::HasNotStarted;

    let (events, next) = step(
        &state,
        Command::NewLoopOut(
            BlockHeight(100),
            NewLoopOutParams {
                max_prepay_fee_sat: 0,
                max_payment_fee_sat: 1_000,
                outgoing_chan_id: None,
            },
            loop_out.clone(),
        ),
        &deps,
    )
    .await;
    assert!(matches!(events[0], Event::NewLoopOutAdded(..)));
    assert!(matches!(events[1], Event::OffChainOfferStarted(..)));
    state = next;

    let (events, next) = step(
        &state,
        Command::SwapUpdate(SwapStatusUpdate {
            status: SwapStatus::TxMempool,
            transaction: Some(TransactionUpdate { tx_hex: lockup_hex.clone() }),
            reason: None,
        }),
        &deps,
    )
    .await;
    assert!(events.is_empty(), "zero-conf disabled: mempool sighting raises nothing");
    state = next;

    let (events, next) = step(
        &state,
        Command::SwapUpdate(SwapStatusUpdate {
            status: SwapStatus::TxConfirmed,
            transaction: Some(TransactionUpdate { tx_hex: lockup_hex.clone() }),
            reason: None,
        }),
        &deps,
    )
    .await;
    assert!(matches!(events[0], Event::CounterpartyStatusObserved(SwapStatus::TxConfirmed)));
    assert!(matches!(&events[1], Event::SwapTxPublished(hex) if *hex == lockup_hex));
    assert!(matches!(events[2], Event::ClaimTxPublished(_)));
    state = next;

    let (events, next) = step(
        &state,
        Command::OffChainOfferResolve(loop_out.preimage),
        &deps,
    )
    .await;
    assert!(matches!(events[0], Event::OffChainOfferResolved(_)));
    assert!(matches!(events[1], Event::FinishedSuccessfully(_)));
    state = next;

    assert_eq!(state, State::Finished { outcome: Outcome::Success });
    assert_eq!(broadcaster.broadcasts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn s2_loop_out_timeout_before_lockup() {
    let loop_out = sample_loop_out(BlockHeight(150), false);

    let broadcaster = RecordingBroadcaster::new();
    let fee_estimator = SequencedFeeEstimator::new(vec![FeeRate(5)]);
    let utxo_provider = FixedUtxoProvider { utxos: vec![] };
    let address_source = FixedAddressSource(p2wpkh(keypair(20).1));
    let invoice_payer = NoopInvoicePayer;
    let deps = Deps {
        broadcaster: &broadcaster,
        fee_estimator: &fee_estimator,
        utxo_provider: &utxo_provider,
        address_source: &address_source,
        invoice_payer: &invoice_payer,
    };

    let (_, state) = step(
        &State::HasNotStarted,
        Command::NewLoopOut(
            BlockHeight(100),
            NewLoopOutParams {
                max_prepay_fee_sat: 0,
                max_payment_fee_sat: 1_000,
                outgoing_chan_id: None,
            },
            loop_out,
        ),
        &deps,
    )
    .await;

    let (events, state) = step(&state, Command::NewBlock(BlockHeight(131), ChainContext::Base), &deps).await;
    assert!(matches!(events[0], Event::NewTipReceived(h) if h == BlockHeight(131)));
    assert!(matches!(events[1], Event::FinishedByTimeout(_)));
    assert_eq!(state, State::Finished { outcome: Outcome::Timeout("cannot safely reveal preimage".to_string()) });
    assert!(broadcaster.broadcasts.lock().unwrap().is_empty(), "no claim tx should ever be published");
}

#[tokio::test]
async fn s3_loop_out_bump_under_cap_after_preimage_reveal() {
    let loop_out = sample_loop_out(BlockHeight(700_150), false);
    let lockup_tx = fund_lockup_tx(&loop_out.redeem_script, Amount::from_sat(100_000));
    let lockup_hex = tx_hex(&lockup_tx);

    let broadcaster = RecordingBroadcaster::new();
    // First tick quotes 5 sat/vB (fee ~690 sat, under the 20_000 cap): publishes.
    // Second tick quotes 200 sat/vB (fee far over cap), but the preimage is
    // already public, so the policy must bump instead of waiting.
    let fee_estimator = SequencedFeeEstimator::new(vec![FeeRate(5), FeeRate(200)]);
    let utxo_provider = FixedUtxoProvider { utxos: vec![] };
    let address_source = FixedAddressSource(p2wpkh(keypair(20).1));
    let invoice_payer = NoopInvoicePayer;
    let deps = Deps {
        broadcaster: &broadcaster,
        fee_estimator: &fee_estimator,
        utxo_provider: &utxo_provider,
        address_source: &address_source,
        invoice_payer: &invoice_payer,
    };

    let state = State::Out {
        block_height: BlockHeight(700_000),
        loop_out: loop_out.clone(),
    };

    let (events, state) = step(
        &state,
        Command::SwapUpdate(SwapStatusUpdate {
            status: SwapStatus::TxConfirmed,
            transaction: Some(TransactionUpdate { tx_hex: lockup_hex }),
            reason: None,
        }),
        &deps,
    )
    .await;
    assert!(matches!(events[0], Event::CounterpartyStatusObserved(SwapStatus::TxConfirmed)));
    assert!(matches!(events[1], Event::SwapTxPublished(_)));
    let Event::ClaimTxPublished(first_txid) = &events[2] else {
        panic!("expected a first claim tx at the cheap rate")
    };

    let State::Out { ref loop_out, .. } = state else {
        panic!("expected Out state")
    };
    assert!(loop_out.claim_transaction_id.is_some());

    let (events, _state) = step(&state, Command::NewBlock(BlockHeight(700_001), ChainContext::Base), &deps).await;
    let bumped = events.iter().find_map(|e| match e {
        Event::ClaimTxPublished(txid) => Some(txid.clone()),
        _ => None,
    });
    let bumped_txid = bumped.expect("expected a bumped claim tx even though the quoted rate exceeds the cap");
    assert_ne!(&bumped_txid, first_txid);

    let broadcasts = broadcaster.broadcasts.lock().unwrap();
    assert_eq!(broadcasts.len(), 2);
    let bumped_tx = &broadcasts[1];
    let actual_fee = (Amount::from_sat(100_000) - bumped_tx.output[0].value).to_sat();
    assert!(
        actual_fee <= loop_out.max_miner_fee,
        "bumped fee {actual_fee} must still respect the cap {}",
        loop_out.max_miner_fee
    );
    let naive_fee_at_quoted_rate = 200 * bumped_tx.vsize() as u64;
    assert!(actual_fee < naive_fee_at_quoted_rate, "bump must charge less than the quoted rate would");
    assert!(bumped_tx.input[0].sequence.is_rbf());
    assert_eq!(bumped_tx.input[0].previous_output, broadcasts[0].input[0].previous_output);
}

#[tokio::test]
async fn s4_loop_in_refund() {
    let loop_in = sample_loop_in(BlockHeight(200));

    let broadcaster = RecordingBroadcaster::new();
    let fee_estimator = SequencedFeeEstimator::new(vec![FeeRate(3)]);
    let change_address = p2wpkh(keypair(9).1);
    let utxo_provider = FixedUtxoProvider {
        utxos: vec![Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([3u8; 32]), 0),
            txout: TxOut {
                value: Amount::from_sat(60_000),
                script_pubkey: change_address.script_pubkey(),
            },
        }],
    };
    let address_source = FixedAddressSource(change_address);
    let invoice_payer = NoopInvoicePayer;
    let deps = Deps {
        broadcaster: &broadcaster,
        fee_estimator: &fee_estimator,
        utxo_provider: &utxo_provider,
        address_source: &address_source,
        invoice_payer: &invoice_payer,
    };

    let (events, state) = step(
        &State::HasNotStarted,
        Command::NewLoopIn(BlockHeight(100), loop_in),
        &deps,
    )
    .await;
    assert!(matches!(events[0], Event::NewLoopInAdded(..)));

    let (events, state) = step(
        &state,
        Command::SwapUpdate(SwapStatusUpdate {
            status: SwapStatus::InvoiceSet,
            transaction: None,
            reason: None,
        }),
        &deps,
    )
    .await;
    let Event::SwapTxPublished(our_lockup_hex) = &events[0] else {
        panic!("expected SwapTxPublished")
    };
    let our_lockup_hex = our_lockup_hex.clone();
    assert_eq!(decode_tx(&our_lockup_hex).compute_txid(), broadcaster.broadcasts.lock().unwrap()[0].compute_txid());

    let (events, state) = step(&state, Command::NewBlock(BlockHeight(200), ChainContext::Quote), &deps).await;
    assert!(matches!(events[0], Event::NewTipReceived(h) if h == BlockHeight(200)));
    assert!(matches!(events[1], Event::RefundTxPublished(_)));
    assert!(matches!(events[2], Event::FinishedByRefund(_)));

    assert_eq!(state.swap_id(), None, "finished states carry no swap id");
    match state {
        State::Finished { outcome: Outcome::Refunded(_) } => {}
        other => panic!("expected Finished(Refunded), got {other:?}"),
    }

    let refund_tx = &broadcaster.broadcasts.lock().unwrap()[1];
    assert_eq!(refund_tx.lock_time, bitcoin::absolute::LockTime::from_height(200).unwrap());
}

#[tokio::test]
async fn s5_loop_in_success() {
    let loop_in = sample_loop_in(BlockHeight(200));

    let broadcaster = RecordingBroadcaster::new();
    let fee_estimator = SequencedFeeEstimator::new(vec![FeeRate(3)]);
    let change_address = p2wpkh(keypair(9).1);
    let utxo_provider = FixedUtxoProvider {
        utxos: vec![Utxo {
            outpoint: OutPoint::new(Txid::from_byte_array([5u8; 32]), 0),
            txout: TxOut {
                value: Amount::from_sat(60_000),
                script_pubkey: change_address.script_pubkey(),
            },
        }],
    };
    let address_source = FixedAddressSource(change_address);
    let invoice_payer = NoopInvoicePayer;
    let deps = Deps {
        broadcaster: &broadcaster,
        fee_estimator: &fee_estimator,
        utxo_provider: &utxo_provider,
        address_source: &address_source,
        invoice_payer: &invoice_payer,
    };

    let (_, state) = step(&State::HasNotStarted, Command::NewLoopIn(BlockHeight(100), loop_in), &deps).await;
    let (_, state) = step(
        &state,
        Command::SwapUpdate(SwapStatusUpdate { status: SwapStatus::InvoiceSet, transaction: None, reason: None }),
        &deps,
    )
    .await;
    let (events, state) = step(
        &state,
        Command::SwapUpdate(SwapStatusUpdate { status: SwapStatus::TxConfirmed, transaction: None, reason: None }),
        &deps,
    )
    .await;
    assert!(events.is_empty(), "waiting for claim");

    let (events, state) = step(
        &state,
        Command::SwapUpdate(SwapStatusUpdate { status: SwapStatus::TxClaimed, transaction: None, reason: None }),
        &deps,
    )
    .await;
    assert!(matches!(events[0], Event::FinishedSuccessfully(_)));
    assert_eq!(state, State::Finished { outcome: Outcome::Success });
}

#[tokio::test]
async fn s6_redeem_script_mismatch_surfaces_as_validation_error() {
    let loop_out = sample_loop_out(BlockHeight(150), false);

    // Upstream validator caught a lockup_address / redeem_script mismatch after
    // the swap had already started: the only remaining path is SetValidationError.
    let broadcaster = RecordingBroadcaster::new();
    let fee_estimator = SequencedFeeEstimator::new(vec![FeeRate(5)]);
    let utxo_provider = FixedUtxoProvider { utxos: vec![] };
    let address_source = FixedAddressSource(p2wpkh(keypair(20).1));
    let invoice_payer = NoopInvoicePayer;
    let deps = Deps {
        broadcaster: &broadcaster,
        fee_estimator: &fee_estimator,
        utxo_provider: &utxo_provider,
        address_source: &address_source,
        invoice_payer: &invoice_payer,
    };

    let state = State::Out {
        block_height: BlockHeight(100),
        loop_out: loop_out.clone(),
    };

    let (events, state) = step(
        &state,
        Command::SetValidationError("lockup mismatch".to_string()),
        &deps,
    )
    .await;
    assert!(matches!(&events[0], Event::FinishedByError(id, msg) if *id == loop_out.id && msg == "lockup mismatch"));
    assert_eq!(state, State::Finished { outcome: Outcome::Errored("lockup mismatch".to_string()) });
}

/// Invariant 5 (codec round-trip) and 6 (apply determinism), exercised across a
/// whole mixed stream rather than a single event at a time.
#[tokio::test]
async fn stream_round_trips_through_the_wire_codec_and_folds_deterministically() {
    let loop_out = sample_loop_out(BlockHeight(150), false);
    let events = vec![
        Event::NewLoopOutAdded(BlockHeight(100), loop_out.clone()),
        Event::OffChainOfferStarted(
            loop_out.id.clone(),
            loop_out.pair_id,
            loop_out.invoice.clone(),
            PayParams { max_fee_sat: 1_000, outgoing_chan_id: None },
        ),
        Event::NewTipReceived(BlockHeight(120)),
        Event::SwapTxPublished("deadbeef".to_string()),
        Event::ClaimTxPublished("beefdead".to_string()),
        Event::OffChainOfferResolved(loop_out.preimage),
        Event::FinishedSuccessfully(loop_out.id.clone()),
    ];

    for event in &events {
        let encoded = event.encode().unwrap();
        let decoded = Event::decode(&encoded).unwrap();
        assert_eq!(&decoded, event);
    }

    let state_a = nloop_core::apply::fold(&events);
    let state_b = nloop_core::apply::fold(&events);
    assert_eq!(state_a, state_b);
    assert_eq!(state_a, State::Finished { outcome: Outcome::Success });
}
