//! External collaborators injected into [`crate::exec::exec`].
//!
//! The core never talks to the network, a wallet, or a node directly — every
//! suspension point is a trait method here. This keeps `exec` pure-ish and lets
//! tests substitute in-memory fakes instead of real infrastructure.

use std::future::Future;
use std::pin::Pin;

use bitcoin::{Address, Amount, OutPoint, Transaction, TxOut, Txid};

use crate::error::Result;
use crate::types::{Asset, FeeRate};

/// Type alias for dependency futures; native-only core, always `Send`.
pub type DepsFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// A spendable output the UTXO provider has selected and locked on our behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub txout: TxOut,
}

/// Parameters for an outgoing Lightning payment, as handed to `pay_invoice`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PayParams {
    pub max_fee_sat: u64,
    pub outgoing_chan_id: Option<String>,
}

/// Broadcasts a finished transaction to the network for the given asset's chain.
pub trait Broadcaster: Send + Sync {
    fn broadcast_tx(&self, tx: &Transaction, asset: Asset) -> DepsFuture<'_, Txid>;
}

/// Quotes a fee rate for a given confirmation target.
pub trait FeeEstimator: Send + Sync {
    fn estimate_fee(&self, conf_target: u32, asset: Asset) -> DepsFuture<'_, FeeRate>;
}

/// Selects and locks on-chain coins to fund a loop-in swap transaction.
///
/// Callers must release the coins on failure so they remain available for a retry
/// or for another swap.
pub trait UtxoProvider: Send + Sync {
    fn select_utxos(&self, amount: Amount, asset: Asset) -> DepsFuture<'_, Vec<Utxo>>;

    fn release(&self, utxos: &[Utxo]) -> DepsFuture<'_, ()>;
}

/// Produces addresses the wallet controls, for change and refund outputs.
pub trait AddressSource: Send + Sync {
    fn get_change_address(&self, asset: Asset) -> DepsFuture<'_, Address>;

    fn get_refund_address(&self, asset: Asset) -> DepsFuture<'_, Address>;
}

/// Pays a Lightning invoice. Fire-and-forget: the returned future resolves once
/// the payment has been dispatched, not once it has settled.
pub trait InvoicePayer: Send + Sync {
    fn pay_invoice(&self, invoice: &str, params: PayParams) -> DepsFuture<'_, ()>;
}

/// Bundle of everything `exec` may call out to, per swap command.
pub struct Deps<'a> {
    pub broadcaster: &'a dyn Broadcaster,
    pub fee_estimator: &'a dyn FeeEstimator,
    pub utxo_provider: &'a dyn UtxoProvider,
    pub address_source: &'a dyn AddressSource,
    pub invoice_payer: &'a dyn InvoicePayer,
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Records every tx handed to it and returns a fixed (or per-call) txid.
    pub struct FakeBroadcaster {
        pub next_txid: Txid,
        pub broadcasts: Mutex<Vec<Transaction>>,
    }

    impl FakeBroadcaster {
        pub fn new(next_txid: Txid) -> Self {
            Self {
                next_txid,
                broadcasts: Mutex::new(Vec::new()),
            }
        }
    }

    impl Broadcaster for FakeBroadcaster {
        fn broadcast_tx(&self, tx: &Transaction, _asset: Asset) -> DepsFuture<'_, Txid> {
            let tx = tx.clone();
            Box::pin(async move {
                self.broadcasts.lock().unwrap().push(tx);
                Ok(self.next_txid)
            })
        }
    }

    /// Always returns the same fee rate, regardless of target.
    pub struct FixedFeeEstimator(pub FeeRate);

    impl FeeEstimator for FixedFeeEstimator {
        fn estimate_fee(&self, _conf_target: u32, _asset: Asset) -> DepsFuture<'_, FeeRate> {
            let rate = self.0;
            Box::pin(async move { Ok(rate) })
        }
    }

    /// Returns a fixed set of UTXOs regardless of the amount requested.
    pub struct FixedUtxoProvider {
        pub utxos: Vec<Utxo>,
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

    /// Always returns the same address for both change and refund.
    pub struct FixedAddressSource(pub Address);

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

    /// Records every invoice it was asked to pay, always succeeding.
    pub struct RecordingInvoicePayer {
        pub paid: Mutex<Vec<(String, PayParams)>>,
    }

    impl RecordingInvoicePayer {
        pub fn new() -> Self {
            Self {
                paid: Mutex::new(Vec::new()),
            }
        }
    }

    impl InvoicePayer for RecordingInvoicePayer {
        fn pay_invoice(&self, invoice: &str, params: PayParams) -> DepsFuture<'_, ()> {
            let invoice = invoice.to_string();
            Box::pin(async move {
                self.paid.lock().unwrap().push((invoice, params));
                Ok(())
            })
        }
    }
}
