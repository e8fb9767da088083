//! # Ferrum Core
//!
//! The event side of the Ferrum client runtime.
//!
//! This crate owns everything between a decoded frame and user code:
//!
//! - **Envelopes**: immutable decoded events ([`Envelope`], [`Event`])
//! - **Cache**: entity snapshots kept current by the event stream ([`CacheStore`])
//! - **Routing**: ordered listener fan-out and one-shot waiters ([`EventRouter`])
//! - **Requests**: the opaque outbound contract ([`RequestExecutor`], [`Operation`])
//! - **Handle**: the cloneable façade user code holds ([`ClientHandle`])
//!
//! ```text
//! ┌────────────┐     ┌─────────────┐     ┌────────────┐
//! │  Gateway   │────▶│ EventRouter │────▶│ CacheStore │
//! │ (frames)   │     │             │────▶│ Listeners  │
//! └────────────┘     └─────────────┘────▶│  Waiters   │
//!                                        └────────────┘
//! ```

pub mod cache;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod handle;
pub mod model;
pub mod outbound;
pub mod router;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{CachePolicy, CacheStore, DEFAULT_MAX_MESSAGES, Retention, Snapshot};
pub use envelope::{Envelope, Event};
pub use error::{
    BoxError, GatewayError, GatewayResult, RequestError, RequestResult, WaitError,
};
pub use executor::{BoxedExecutor, Method, Operation, RequestExecutor};
pub use handle::ClientHandle;
pub use model::{Channel, Guild, Id, Member, Message, Role, User, channel_kind};
pub use outbound::{Activity, GatewayCommand, GatewaySender, Presence, Status};
pub use router::{
    EventRouter, Listener, ListenerErrorHook, ListenerId, ListenerPanicked, Owner, Waiter,
    panic_message,
};

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        BoxError, ClientHandle, Envelope, Event, EventRouter, Id, Message, Owner, User,
    };
}
