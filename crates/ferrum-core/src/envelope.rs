//! Decoded event envelopes.
//!
//! An [`Envelope`] is produced once per inbound dispatch frame and is never
//! mutated afterwards; cloning it only bumps reference counts. Listeners and
//! waiters receive an [`Event`], which pairs the envelope with the cache
//! entry it replaced.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::cache::Snapshot;

/// One decoded unit from the event stream.
#[derive(Debug, Clone)]
pub struct Envelope {
    name: Arc<str>,
    op: u8,
    seq: Option<u64>,
    payload: Arc<Value>,
}

impl Envelope {
    /// Creates a dispatch envelope (opcode 0) without a sequence number.
    pub fn new(name: impl Into<Arc<str>>, payload: Value) -> Self {
        Self {
            name: name.into(),
            op: 0,
            seq: None,
            payload: Arc::new(payload),
        }
    }

    /// Attaches the sequence number the remote assigned to this frame.
    pub fn with_seq(mut self, seq: Option<u64>) -> Self {
        self.seq = seq;
        self
    }

    /// Overrides the opcode the frame arrived with.
    pub fn with_op(mut self, op: u8) -> Self {
        self.op = op;
        self
    }

    /// The event name tag, e.g. `MESSAGE_CREATE`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The opcode the frame arrived with.
    pub fn op(&self) -> u8 {
        self.op
    }

    /// The sequence number, if the remote assigned one.
    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    /// The raw payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Decodes the payload into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.payload.as_ref())
    }
}

/// What listeners and waiters observe for one dispatched envelope.
#[derive(Debug, Clone)]
pub struct Event {
    envelope: Envelope,
    previous: Option<Snapshot>,
}

impl Event {
    pub(crate) fn new(envelope: Envelope, previous: Option<Snapshot>) -> Self {
        Self { envelope, previous }
    }

    /// The envelope being dispatched.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Shorthand for `self.envelope().name()`.
    pub fn name(&self) -> &str {
        self.envelope.name()
    }

    /// Shorthand for `self.envelope().payload()`.
    pub fn payload(&self) -> &Value {
        self.envelope.payload()
    }

    /// Decodes the payload into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        self.envelope.decode()
    }

    /// The cache entry this event replaced or removed, if any.
    ///
    /// Populated for update and delete events whose entity was cached.
    pub fn previous(&self) -> Option<&Snapshot> {
        self.previous.as_ref()
    }
}
