//! NLoop core - event-sourced submarine swap state machine
//!
//! This crate is the platform-agnostic core of a non-custodial Lightning/Bitcoin
//! submarine-swap daemon. It owns no network sockets, no wallet keys, and no
//! database connections; every swap is a pure event-sourced aggregate, and every
//! external effect (broadcasting a transaction, estimating a fee rate, paying an
//! invoice) is routed through the [`deps`] trait bundle so the core stays testable
//! with in-memory fakes instead of real infrastructure.
//!
//! # Shape
//!
//! - [`command`] / [`event`]: the only inputs and outputs of a swap.
//! - [`exec`]: the command executor — `(state, command, deps) -> events`.
//! - [`apply`]: the pure fold — `(state, event) -> state`.
//! - [`aggregate`]: load/fold/execute/append/notify, with optimistic-concurrency
//!   retry and per-swap mutual exclusion.
//! - [`script`] / [`tx`] / [`fee`]: HTLC redeem scripts, transaction construction,
//!   and the sweep-or-bump fee policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use nloop_core::{aggregate::Handler, command::{Command, Meta, CommandSource}};
//!
//! let events = handler.execute(&swap_id, command, &deps, meta).await?;
//! ```

pub mod aggregate;
pub mod apply;
pub mod command;
pub mod deps;
pub mod error;
pub mod event;
pub mod exec;
pub mod fee;
pub mod script;
pub mod state;
pub mod tx;
pub mod types;

pub use aggregate::{AppendError, EventStore, Handler};
pub use command::{Command, CommandSource, Meta};
pub use error::{Error, Result};
pub use event::Event;
pub use state::State;
pub use types::{Asset, BlockHeight, PairId, PaymentHash, PaymentPreimage, SwapId};
