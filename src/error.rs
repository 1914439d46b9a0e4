//! Error types for the NLoop core state machine.

use thiserror::Error;

/// Result type alias using our [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while executing commands or constructing transactions.
#[derive(Error, Debug)]
pub enum Error {
    /// Transaction construction was refused.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A redeem script supplied by the counterparty does not match what we expect,
    /// or no output of the lockup transaction commits to our redeem script.
    #[error("redeem script mismatch: expected P2WSH({expected_redeem}), lockup tx outputs were {actual_spks:?}")]
    RedeemScriptMismatch {
        actual_spks: Vec<String>,
        expected_redeem: String,
    },

    /// Command-level validation failed before any external side effect happened.
    #[error("input error: {0}")]
    Input(String),

    /// The UTXO provider could not fund a loop-in swap transaction.
    #[error("UTXO provider error: {0}")]
    UtxoProvider(String),

    /// The wallet refused to produce a change or refund address.
    #[error("failed to get address: {0}")]
    FailedToGetAddress(String),

    /// Revealing the preimage this close to the timeout risks losing the claim race.
    #[error("cannot safely reveal preimage: {0}")]
    CanNotSafelyRevealPreimage(String),

    /// A command was issued against a state that does not accept it.
    #[error("unexpected command {command} in state {state}")]
    UnexpectedCommand { command: String, state: String },

    /// Serialization/deserialization error (event codec, persisted snapshots).
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Anything else; always surfaced to the caller.
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Unexpected(format!("{:#}", err))
    }
}
