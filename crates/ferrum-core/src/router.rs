//! Event router for the Ferrum runtime.
//!
//! This module provides the [`EventRouter`], which receives decoded envelopes
//! from the connection manager and fans them out.
//!
//! # Dispatch
//!
//! For every envelope, in arrival order:
//!
//! 1. The [`CacheStore`] applies the envelope if the event is cache-relevant
//! 2. Every listener registered for the event name is awaited, in registration
//!    order. A listener that errors or panics is reported and skipped
//! 3. Pending waiters for the event name are tested; each one whose predicate
//!    accepts the event is resolved and removed
//!
//! ```rust,ignore
//! use ferrum_core::{EventRouter, Owner};
//!
//! let router = EventRouter::new(cache);
//!
//! router.register_listener("MESSAGE_CREATE", Owner::Client, |event| async move {
//!     println!("{:?}", event.payload());
//!     Ok(())
//! });
//!
//! let reply = router
//!     .wait_for("MESSAGE_CREATE", |e| e.payload()["content"] == "yes", Some(timeout))
//!     .await?;
//! ```

use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, span, trace};

use crate::cache::CacheStore;
use crate::envelope::{Envelope, Event};
use crate::error::{BoxError, WaitError};

// ============================================================================
// Listener registrations
// ============================================================================

/// Who registered a listener. Removing an owner removes all its listeners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Registered directly on the client.
    Client,
    /// Registered by a named extension.
    Extension(Arc<str>),
    /// Registered on behalf of a single command.
    Command(Arc<str>),
}

impl Owner {
    pub fn extension(name: impl Into<Arc<str>>) -> Self {
        Self::Extension(name.into())
    }

    pub fn command(name: impl Into<Arc<str>>) -> Self {
        Self::Command(name.into())
    }
}

/// Handle returned by [`EventRouter::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A type-erased persistent listener.
pub type Listener = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Receives listener faults. Installed by the runtime; defaults to logging.
pub type ListenerErrorHook = Arc<dyn Fn(&Event, &BoxError) + Send + Sync>;

struct Registration {
    id: ListenerId,
    event: Arc<str>,
    owner: Owner,
    listener: Listener,
}

/// Panic payload converted into an error.
#[derive(Debug, thiserror::Error)]
#[error("listener panicked: {0}")]
pub struct ListenerPanicked(pub String);

/// Extracts a printable message from a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Waiters
// ============================================================================

type Predicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct PendingWaiter {
    id: u64,
    event: Arc<str>,
    predicate: Predicate,
    deadline: Option<Instant>,
    slot: oneshot::Sender<Result<Event, WaitError>>,
}

/// Pending waiters. Every resolution path removes the entry under this lock
/// first, which is what makes resolution exactly-once.
#[derive(Default)]
struct WaiterTable {
    entries: Mutex<Vec<PendingWaiter>>,
}

impl WaiterTable {
    fn remove(&self, id: u64) -> Option<PendingWaiter> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|w| w.id == id)?;
        Some(entries.swap_remove(index))
    }
}

/// A one-shot subscription created by [`EventRouter::wait_for`].
///
/// The waiter is registered as soon as it is created, so events dispatched
/// before it is first polled are not missed. Await it (or call
/// [`Waiter::wait`]) to get the matching event. Dropping it unregisters it.
#[must_use = "a waiter does nothing unless awaited"]
pub struct Waiter {
    id: u64,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<Result<Event, WaitError>>,
    table: Arc<WaiterTable>,
}

impl Waiter {
    /// Waits until a matching event arrives or the deadline elapses.
    pub async fn wait(mut self) -> Result<Event, WaitError> {
        let received = match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                result = &mut self.rx => Some(result),
                _ = tokio::time::sleep_until(deadline) => None,
            },
            None => Some((&mut self.rx).await),
        };

        match received {
            Some(Ok(outcome)) => outcome,
            Some(Err(_)) => Err(WaitError::Closed),
            None => {
                // Claim the entry; if a resolver already removed it, its
                // outcome is on the way.
                if self.table.remove(self.id).is_some() {
                    Err(WaitError::Timeout)
                } else {
                    (&mut self.rx).await.unwrap_or(Err(WaitError::Timeout))
                }
            }
        }
    }
}

impl IntoFuture for Waiter {
    type Output = Result<Event, WaitError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait().boxed()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

// ============================================================================
// EventRouter
// ============================================================================

/// Central fan-out point between the connection manager and user code.
///
/// `EventRouter` is `Send + Sync`; share it behind an `Arc`. [`dispatch`]
/// must be called from a single task so envelopes are processed strictly in
/// arrival order.
///
/// [`dispatch`]: EventRouter::dispatch
pub struct EventRouter {
    cache: Arc<CacheStore>,
    listeners: RwLock<Vec<Registration>>,
    waiters: Arc<WaiterTable>,
    next_id: AtomicU64,
    error_hook: RwLock<Option<ListenerErrorHook>>,
}

impl EventRouter {
    /// Creates a router that keeps the given cache up to date.
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            listeners: RwLock::new(Vec::new()),
            waiters: Arc::new(WaiterTable::default()),
            next_id: AtomicU64::new(1),
            error_hook: RwLock::new(None),
        }
    }

    /// The cache this router writes to.
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs the hook that receives listener faults.
    pub fn set_error_hook(&self, hook: ListenerErrorHook) {
        *self.error_hook.write() = Some(hook);
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Registers a persistent listener for the named event.
    pub fn register_listener<F, Fut>(
        &self,
        event: impl Into<Arc<str>>,
        owner: Owner,
        listener: F,
    ) -> ListenerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |event| listener(event).boxed());
        self.register_boxed(event.into(), owner, listener)
    }

    /// Registers an already type-erased listener.
    pub fn register_boxed(&self, event: Arc<str>, owner: Owner, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id());
        debug!(event = %event, owner = ?owner, "Registered listener");
        self.listeners.write().push(Registration {
            id,
            event,
            owner,
            listener,
        });
        id
    }

    /// Removes one listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Removes every listener registered by `owner`, returning how many.
    pub fn remove_owner(&self, owner: &Owner) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| &r.owner != owner);
        before - listeners.len()
    }

    /// Number of listeners registered for the named event.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|r| &*r.event == event)
            .count()
    }

    // ------------------------------------------------------------------------
    // Waiters
    // ------------------------------------------------------------------------

    /// Registers a one-shot waiter for the next event matching `predicate`.
    ///
    /// With `timeout: None` the waiter never expires.
    pub fn wait_for<P>(
        &self,
        event: impl Into<Arc<str>>,
        predicate: P,
        timeout: Option<Duration>,
    ) -> Waiter
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let (slot, rx) = oneshot::channel();
        self.waiters.entries.lock().push(PendingWaiter {
            id,
            event: event.into(),
            predicate: Box::new(predicate),
            deadline,
            slot,
        });
        Waiter {
            id,
            deadline,
            rx,
            table: Arc::clone(&self.waiters),
        }
    }

    /// Number of unresolved waiters.
    pub fn pending_waiters(&self) -> usize {
        self.waiters.entries.lock().len()
    }

    /// Resolves every waiter whose deadline is at or before `now` with
    /// [`WaitError::Timeout`]. Returns how many were expired.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<PendingWaiter> = {
            let mut entries = self.waiters.entries.lock();
            let (expired, live) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|w| w.deadline.is_some_and(|d| d <= now));
            *entries = live;
            expired
        };
        let count = expired.len();
        for waiter in expired {
            let _ = waiter.slot.send(Err(WaitError::Timeout));
        }
        if count > 0 {
            trace!(count, "Expired waiters");
        }
        count
    }

    /// Spawns a task that sweeps expired waiters every `period` until
    /// `shutdown` is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        router.sweep_expired(Instant::now());
                    }
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Dispatches one envelope. See the module docs for the exact order.
    pub async fn dispatch(&self, envelope: Envelope) {
        let span = span!(Level::DEBUG, "dispatch", event = %envelope.name(), seq = ?envelope.seq());
        self.dispatch_inner(envelope).instrument(span).await
    }

    async fn dispatch_inner(&self, envelope: Envelope) {
        let previous = self.cache.apply(&envelope);
        let event = Event::new(envelope, previous);

        let matching: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|r| *r.event == *event.name())
            .map(|r| Arc::clone(&r.listener))
            .collect();

        for listener in matching {
            let outcome = AssertUnwindSafe(listener(event.clone()))
                .catch_unwind()
                .await;
            let fault = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(panic) => Box::new(ListenerPanicked(panic_message(panic.as_ref()))) as BoxError,
            };
            self.report_listener_error(&event, &fault);
        }

        self.resolve_waiters(&event);
    }

    fn report_listener_error(&self, event: &Event, fault: &BoxError) {
        let hook = self.error_hook.read().clone();
        match hook {
            Some(hook) => hook(event, fault),
            None => error!(event = %event.name(), error = %fault, "Listener returned an error"),
        }
    }

    fn resolve_waiters(&self, event: &Event) {
        let now = Instant::now();
        let resolved: Vec<(PendingWaiter, Result<Event, WaitError>)> = {
            let mut entries = self.waiters.entries.lock();
            let mut resolved = Vec::new();
            let mut index = 0;
            while index < entries.len() {
                let waiter = &entries[index];
                let outcome = if waiter.deadline.is_some_and(|d| d <= now) {
                    Some(Err(WaitError::Timeout))
                } else if *waiter.event != *event.name() {
                    None
                } else {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| (waiter.predicate)(event))) {
                        Ok(true) => Some(Ok(event.clone())),
                        Ok(false) => None,
                        Err(_) => Some(Err(WaitError::PredicatePanicked)),
                    }
                };
                match outcome {
                    Some(outcome) => resolved.push((entries.remove(index), outcome)),
                    None => index += 1,
                }
            }
            resolved
        };

        for (waiter, outcome) in resolved {
            let _ = waiter.slot.send(outcome);
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("listener_count", &self.listeners.read().len())
            .field("pending_waiters", &self.pending_waiters())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready};

    fn router() -> Arc<EventRouter> {
        Arc::new(EventRouter::new(Arc::new(CacheStore::default())))
    }

    fn envelope(name: &str, n: i64) -> Envelope {
        Envelope::new(name, json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            router.register_listener("PING", Owner::Client, move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(tag);
                    Ok(())
                }
            });
        }

        router.dispatch(envelope("PING", 1)).await;
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_listener_fault_does_not_stop_delivery() {
        let router = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let faults = Arc::new(Mutex::new(Vec::new()));

        {
            let faults = Arc::clone(&faults);
            router.set_error_hook(Arc::new(move |_, e| faults.lock().push(e.to_string())));
        }
        router.register_listener("PING", Owner::Client, |_| async { Err("boom".into()) });
        router.register_listener("PING", Owner::Client, |_| async {
            if true {
                panic!("kaboom");
            }
            Ok(())
        });
        {
            let seen = Arc::clone(&seen);
            router.register_listener("PING", Owner::Client, move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push("survivor");
                    Ok(())
                }
            });
        }

        router.dispatch(envelope("PING", 1)).await;
        assert_eq!(*seen.lock(), vec!["survivor"]);
        assert_eq!(
            *faults.lock(),
            vec!["boom".to_string(), "listener panicked: kaboom".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_owner() {
        let router = router();
        let ext = Owner::extension("music");
        router.register_listener("A", ext.clone(), |_| async { Ok(()) });
        router.register_listener("B", ext.clone(), |_| async { Ok(()) });
        let keep = router.register_listener("A", Owner::Client, |_| async { Ok(()) });

        assert_eq!(router.remove_owner(&ext), 2);
        assert_eq!(router.listener_count("A"), 1);
        assert!(router.remove_listener(keep));
        assert!(!router.remove_listener(keep));
    }

    #[tokio::test]
    async fn test_waiter_consumed_by_first_match_only() {
        let router = router();
        let waiter = router.wait_for("PING", |e| e.payload()["n"].as_i64() >= Some(2), None);

        router.dispatch(envelope("PONG", 5)).await;
        router.dispatch(envelope("PING", 1)).await;
        router.dispatch(envelope("PING", 2)).await;
        router.dispatch(envelope("PING", 3)).await;

        let event = waiter.await.unwrap();
        assert_eq!(event.payload()["n"], 2);
        assert_eq!(router.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_waiter_registered_before_first_poll() {
        let router = router();
        let mut fut = tokio_test::task::spawn(router.wait_for("PING", |_| true, None).wait());
        router.dispatch(envelope("PING", 7)).await;
        let event = assert_ready!(fut.poll()).unwrap();
        assert_eq!(event.payload()["n"], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_timeout_excludes_match() {
        let router = router();
        let waiter = router.wait_for("PING", |_| true, Some(Duration::from_secs(5)));
        let mut fut = tokio_test::task::spawn(waiter.wait());
        assert_pending!(fut.poll());

        tokio::time::advance(Duration::from_secs(6)).await;
        let outcome = assert_ready!(fut.poll());
        assert_eq!(outcome.unwrap_err(), WaitError::Timeout);

        // A late event finds nothing to resolve.
        router.dispatch(envelope("PING", 1)).await;
        assert_eq!(router.pending_waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claimed_waiter_keeps_match_past_deadline() {
        let router = router();
        let waiter = router.wait_for("PING", |_| true, Some(Duration::from_secs(5)));
        let claimed = router.waiters.remove(waiter.id).unwrap();
        let mut fut = tokio_test::task::spawn(waiter.wait());
        assert_pending!(fut.poll());

        // The deadline passes between the claim and the send.
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_pending!(fut.poll());

        let event = Event::new(envelope("PING", 3), None);
        let _ = claimed.slot.send(Ok(event));
        let event = assert_ready!(fut.poll()).unwrap();
        assert_eq!(event.payload()["n"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_resolves_expired_waiters() {
        let router = router();
        let short = router.wait_for("PING", |_| true, Some(Duration::from_secs(1)));
        let _long = router.wait_for("PING", |_| true, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(router.sweep_expired(Instant::now()), 1);
        assert_eq!(router.pending_waiters(), 1);
        assert_eq!(short.await.unwrap_err(), WaitError::Timeout);
    }

    #[tokio::test]
    async fn test_panicking_predicate_resolves_with_error() {
        let router = router();
        let waiter = router.wait_for("PING", |_| panic!("bad predicate"), None);
        router.dispatch(envelope("PING", 1)).await;
        assert_eq!(waiter.await.unwrap_err(), WaitError::PredicatePanicked);
    }

    #[tokio::test]
    async fn test_dropped_waiter_unregisters() {
        let router = router();
        let waiter = router.wait_for("PING", |_| true, None);
        assert_eq!(router.pending_waiters(), 1);
        drop(waiter);
        assert_eq!(router.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn test_cache_updated_before_listeners() {
        let router = router();
        let cache = Arc::clone(router.cache());
        let observed = Arc::new(Mutex::new(None));
        {
            let observed = Arc::clone(&observed);
            router.register_listener("CHANNEL_CREATE", Owner::Client, move |_| {
                let observed = Arc::clone(&observed);
                let cache = Arc::clone(&cache);
                async move {
                    *observed.lock() = cache.channel(crate::Id(3)).map(|c| c.id);
                    Ok(())
                }
            });
        }
        router
            .dispatch(Envelope::new("CHANNEL_CREATE", json!({"id": "3", "type": 0})))
            .await;
        assert_eq!(*observed.lock(), Some(crate::Id(3)));
    }
}
