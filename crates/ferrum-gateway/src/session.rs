//! Session state owned by the connection manager.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Resuming,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Resuming => "resuming",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable session record. Only the connection driver task touches it.
#[derive(Debug, Clone, Default)]
pub struct Session {
    state: SessionState,
    session_id: Option<String>,
    seq: Option<u64>,
    resume_url: Option<String>,
    heartbeat_interval: Option<Duration>,
    ack_deadline: Option<Instant>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Session state change");
            self.state = next;
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// Records a sequence number. Out-of-order values never move it back.
    pub fn record_seq(&mut self, seq: Option<u64>) {
        if let Some(seq) = seq
            && self.seq.is_none_or(|current| seq > current)
        {
            self.seq = Some(seq);
        }
    }

    /// Stores the identifiers READY hands out.
    pub fn established(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
        self.transition(SessionState::Ready);
    }

    /// A resume needs both a session id and a sequence number.
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.seq.is_some()
    }

    /// Forgets the session so the next handshake is a fresh identify.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.seq = None;
        self.resume_url = None;
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = Some(interval);
    }

    /// Marks a heartbeat as sent; an ACK must arrive before `now + grace`.
    pub fn heartbeat_sent(&mut self, now: Instant, grace: Duration) {
        if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + grace);
        }
    }

    pub fn heartbeat_acked(&mut self) {
        self.ack_deadline = None;
    }

    /// Deadline for the outstanding heartbeat, if any.
    pub fn ack_deadline(&self) -> Option<Instant> {
        self.ack_deadline
    }
}

/// Read-only view published to the session's owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub seq: Option<u64>,
}

impl From<&Session> for SessionStatus {
    fn from(session: &Session) -> Self {
        Self {
            state: session.state,
            session_id: session.session_id.clone(),
            seq: session.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_is_monotonic() {
        let mut session = Session::new();
        session.record_seq(Some(5));
        session.record_seq(Some(3));
        session.record_seq(None);
        assert_eq!(session.seq(), Some(5));
    }

    #[test]
    fn test_resume_requires_id_and_seq() {
        let mut session = Session::new();
        assert!(!session.can_resume());
        session.established("abc".into(), None);
        assert!(!session.can_resume());
        session.record_seq(Some(1));
        assert!(session.can_resume());
        assert_eq!(session.state(), SessionState::Ready);

        session.invalidate();
        assert!(!session.can_resume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_deadline_kept_until_ack() {
        let mut session = Session::new();
        let now = Instant::now();
        session.heartbeat_sent(now, Duration::from_secs(10));
        session.heartbeat_sent(now + Duration::from_secs(5), Duration::from_secs(10));
        assert_eq!(session.ack_deadline(), Some(now + Duration::from_secs(10)));
        session.heartbeat_acked();
        assert_eq!(session.ack_deadline(), None);
    }
}
