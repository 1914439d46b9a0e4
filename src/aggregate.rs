//! The aggregate handler: load, fold, execute, append, notify.
//!
//! This is the only place a command actually reaches a swap's persisted event
//! stream. Everything upstream (`exec`, `apply`) is pure; this module owns the
//! suspension points — the store and the per-swap serialization — around them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex as AsyncMutex};

use crate::apply::apply;
use crate::command::{Command, Meta};
use crate::deps::Deps;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::exec::exec;
use crate::state::State;
use crate::types::SwapId;

/// Bounded retry count for optimistic-concurrency conflicts (spec.md §4.6 point 4).
pub const MAX_CONCURRENCY_RETRIES: u32 = 3;

/// A log-safe label for a derived state: `LoopOut`/`LoopIn` carry secret key
/// material that must never be logged, so this never formats the state's payload.
fn describe_state(state: &State) -> String {
    match state {
        State::HasNotStarted => "HasNotStarted".to_string(),
        State::Out { block_height, .. } => format!("Out(height={})", block_height.0),
        State::In { block_height, .. } => format!("In(height={})", block_height.0),
        State::Finished { outcome } => format!("Finished({outcome:?})"),
    }
}

/// Future type for [`EventStore`] methods; native-only, always `Send`.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Optimistic-concurrency append failure: the stream has moved on since we loaded it.
#[derive(Debug)]
pub enum AppendError {
    Conflict { actual_version: u64 },
    Other(Error),
}

impl From<Error> for AppendError {
    fn from(err: Error) -> Self {
        AppendError::Other(err)
    }
}

/// The persistence seam: an append-only event store keyed by swap id, with
/// optimistic concurrency checks (spec.md §6).
pub trait EventStore: Send + Sync {
    /// Load the full ordered event history for `id`. Empty if the swap doesn't exist yet.
    fn load(&self, id: &SwapId) -> StoreFuture<'_, Vec<Event>>;

    /// Append `events` iff the stream currently has exactly `expected_version` events.
    fn append(
        &self,
        id: &SwapId,
        expected_version: u64,
        events: &[Event],
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), AppendError>> + Send + '_>>;
}

/// Loads, folds, executes, and appends commands against a swap's event stream,
/// serializing all activity for a given `swap_id` through a per-key mutex.
pub struct Handler<S: EventStore> {
    store: Arc<S>,
    locks: std::sync::Mutex<HashMap<SwapId, Arc<AsyncMutex<()>>>>,
    subscribers: std::sync::Mutex<HashMap<SwapId, broadcast::Sender<Event>>>,
}

impl<S: EventStore> Handler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
            subscribers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &SwapId) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Subscribe to events appended for `id` from this point on. Lazily creates the
    /// channel if nothing has subscribed to this swap yet.
    pub fn subscribe(&self, id: &SwapId) -> broadcast::Receiver<Event> {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe()
    }

    fn notify(&self, id: &SwapId, events: &[Event]) {
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(sender) = subscribers.get(id) {
            for event in events {
                // No active receivers is not an error; the events are still durable.
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Run `command` against `id`'s current state, appending whatever events it
    /// raises. Retries on optimistic-concurrency conflicts up to
    /// [`MAX_CONCURRENCY_RETRIES`] times before giving up.
    pub async fn execute(
        &self,
        id: &SwapId,
        command: Command,
        deps: &Deps<'_>,
        meta: Meta,
    ) -> Result<Vec<Event>> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            let history = self.store.load(id).await?;
            let expected_version = history.len() as u64;
            let state = history.iter().fold(State::HasNotStarted, |s, e| apply(s, e));

            let new_events = exec(&state, command.clone(), deps, meta).await?;
            if new_events.is_empty() {
                return Ok(new_events);
            }

            match self.store.append(id, expected_version, &new_events).await {
                Ok(()) => {
                    let new_state = new_events.iter().fold(state, |s, e| apply(s, e));
                    log::info!("swap {id} -> {}", describe_state(&new_state));
                    self.notify(id, &new_events);
                    return Ok(new_events);
                }
                Err(AppendError::Conflict { actual_version }) => {
                    attempt += 1;
                    log::debug!(
                        "swap {id} append conflict: expected version {expected_version}, actual {actual_version} (attempt {attempt})"
                    );
                    if attempt >= MAX_CONCURRENCY_RETRIES {
                        return Err(Error::Unexpected(format!(
                            "gave up appending to swap {id} after {attempt} concurrency retries"
                        )));
                    }
                    continue;
                }
                Err(AppendError::Other(e)) => return Err(e),
            }
        }
    }
}
