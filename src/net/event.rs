//! Observer lists and the events connections and listeners raise.
//!
//! [`Observers`] is a copy-on-write handler list. `emit` loads one snapshot
//! of the list and invokes every handler in it, so a handler removed
//! mid-dispatch either still sees the current event or does not, and the
//! dispatcher never observes a half-updated list.

use arc_swap::ArcSwap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::net::connection::DisconnectReason;
use crate::net::wire::SendOption;

/// Relaxed ordering is sufficient; ids only need to be unique.
static SUBSCRIPTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Handle returned by [`Observers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(SUBSCRIPTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Copy-on-write list of event handlers.
pub struct Observers<E> {
    handlers: ArcSwap<Vec<(SubscriptionId, Handler<E>)>>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = SubscriptionId::next();
        let handler: Handler<E> = Arc::new(handler);
        self.handlers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push((id, Arc::clone(&handler)));
            next
        });
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.handlers.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|(existing, _)| *existing != id)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    /// Drop every handler.
    pub fn clear(&self) {
        self.handlers.store(Arc::new(Vec::new()));
    }

    pub fn len(&self) -> usize {
        self.handlers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler of the current snapshot.
    ///
    /// A panicking handler is logged and skipped; it never unwinds into the
    /// caller. Returns the number of handlers invoked.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot = self.handlers.load_full();
        for (id, handler) in snapshot.iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!(subscription = id.0, "Event handler panicked");
            }
        }
        snapshot.len()
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers").field("handlers", &self.len()).finish()
    }
}

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReceived {
    pub bytes: Vec<u8>,
    pub send_option: SendOption,
}

/// Raised at most once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    pub reason: DisconnectReason,
}

/// Raised by a listener once a peer's handshake has arrived.
pub struct NewConnection<C: ?Sized> {
    /// Handshake bytes exactly as the peer supplied them.
    pub handshake: Vec<u8>,
    pub connection: Arc<C>,
}

impl<C: ?Sized> Clone for NewConnection<C> {
    fn clone(&self) -> Self {
        Self {
            handshake: self.handshake.clone(),
            connection: Arc::clone(&self.connection),
        }
    }
}

impl<C: ?Sized> fmt::Debug for NewConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewConnection")
            .field("handshake_len", &self.handshake.len())
            .finish_non_exhaustive()
    }
}
