//! Connection manager: session lifecycle over a frame transport.
//!
//! [`ConnectionManager::connect`] performs the first handshake on the caller's
//! task (so credential problems surface immediately as [`GatewayError::Auth`])
//! and then hands the session to a driver task that:
//!
//! - forwards every dispatch frame as an [`Envelope`], in arrival order
//! - sends heartbeats on the interval from HELLO and fails the connection if
//!   an ACK is not seen within the grace window
//! - drains the [`GatewaySender`] side channel
//! - on connection loss, tries a bounded number of resumes, then one fresh
//!   identify, then gives up with [`GatewayError::SessionLost`]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, info, span, trace, warn};

use ferrum_core::{Envelope, GatewayCommand, GatewayError, GatewayResult, GatewaySender};

use crate::frame::{
    CLOSE_AUTHENTICATION_FAILED, ConnectionProperties, GatewayFrame, Opcode,
};
use crate::session::{Session, SessionState, SessionStatus};
use crate::transport::{BoxedConnector, FrameTransport, Inbound};

// =============================================================================
// Configuration
// =============================================================================

/// Exponential backoff between recovery attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// Delay before the attempt with the given zero-based index.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        std::cmp::min(
            Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor),
            self.max_delay,
        )
    }
}

/// Settings fixed for the lifetime of a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Intent bitfield sent with IDENTIFY.
    pub intents: u64,
    pub properties: ConnectionProperties,
    /// Upper bound for HELLO through READY/RESUMED.
    pub handshake_timeout: Duration,
    /// How long to wait for a heartbeat ACK. `None` means one interval.
    pub heartbeat_grace: Option<Duration>,
    /// Resume attempts before falling back to a fresh identify.
    pub resume_attempts: u32,
    pub backoff: Backoff,
    /// Pause after a non-resumable INVALID_SESSION.
    pub invalid_session_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            intents: 0,
            properties: ConnectionProperties::default(),
            handshake_timeout: Duration::from_secs(30),
            heartbeat_grace: None,
            resume_attempts: 3,
            backoff: Backoff::default(),
            invalid_session_delay: Duration::from_secs(5),
        }
    }
}

/// Login token. `Bot ` and `Bearer ` prefixes are stripped.
#[derive(Clone)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl AsRef<str>) -> Self {
        let token = token.as_ref().trim();
        let token = token
            .strip_prefix("Bot ")
            .or_else(|| token.strip_prefix("Bearer "))
            .unwrap_or(token);
        Self {
            token: token.trim().to_string(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("token", &"<redacted>").finish()
    }
}

// =============================================================================
// ConnectionManager
// =============================================================================

/// Establishes gateway sessions and feeds their events into a channel.
pub struct ConnectionManager {
    connector: BoxedConnector,
    config: GatewayConfig,
    events: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionManager {
    /// Creates a manager that delivers decoded envelopes to `events`.
    pub fn new(
        connector: BoxedConnector,
        config: GatewayConfig,
        events: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            connector,
            config,
            events,
        }
    }

    /// Connects, identifies and waits for READY.
    ///
    /// Fails with [`GatewayError::Auth`] on rejected credentials and
    /// [`GatewayError::Connection`] on transport failure. On success the
    /// session keeps running in the background until shutdown or loss.
    pub async fn connect(&self, url: &str, credentials: Credentials) -> GatewayResult<SessionHandle> {
        let (sender, commands) = GatewaySender::channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let cancel = CancellationToken::new();

        let mut driver = Driver {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            credentials,
            url: url.to_string(),
            events: self.events.clone(),
            commands,
            status: status_tx,
            session: Session::new(),
            cancel: cancel.clone(),
            transport: None,
        };

        info!(url = %url, "Connecting to gateway");
        if let Err(e) = driver.establish(Handshake::Identify).await {
            driver.close_transport(1000).await;
            driver.set_state(SessionState::Disconnected);
            return Err(e);
        }

        let span = span!(Level::INFO, "gateway", url = %url);
        let task = tokio::spawn(driver.run().instrument(span));

        Ok(SessionHandle {
            sender,
            status: status_rx,
            cancel,
            task,
        })
    }
}

/// Owner's handle to a running session.
pub struct SessionHandle {
    sender: GatewaySender,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: JoinHandle<GatewayResult<()>>,
}

impl SessionHandle {
    /// Side channel for outbound frames.
    pub fn sender(&self) -> GatewaySender {
        self.sender.clone()
    }

    /// Current session snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Watches session snapshots as they change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Token that stops the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a clean shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Waits for the session to end.
    ///
    /// Returns `Ok(())` after a requested shutdown and the terminal error
    /// (usually [`GatewayError::SessionLost`]) otherwise.
    pub async fn join(self) -> GatewayResult<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(GatewayError::connection(format!("gateway task failed: {e}"))),
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Identify,
    Resume,
}

/// Why the established connection stopped pumping.
enum Interrupt {
    Fatal(GatewayError),
    Lost { reason: String, resumable: bool },
}

impl Interrupt {
    fn lost(reason: impl ToString) -> Self {
        Self::Lost {
            reason: reason.to_string(),
            resumable: true,
        }
    }
}

struct Driver {
    connector: BoxedConnector,
    config: GatewayConfig,
    credentials: Credentials,
    url: String,
    events: mpsc::UnboundedSender<Envelope>,
    commands: mpsc::UnboundedReceiver<GatewayCommand>,
    status: watch::Sender<SessionStatus>,
    session: Session,
    cancel: CancellationToken,
    transport: Option<Box<dyn FrameTransport>>,
}

async fn recv_inbound(
    transport: &mut Option<Box<dyn FrameTransport>>,
) -> Option<GatewayResult<Inbound>> {
    match transport.as_mut() {
        Some(transport) => transport.recv().await,
        None => None,
    }
}

/// Sleeps unless shutdown is requested first. Returns `false` on shutdown.
async fn pause(cancel: CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn close_error(code: Option<u16>, reason: &str) -> GatewayError {
    match code {
        Some(CLOSE_AUTHENTICATION_FAILED) => {
            GatewayError::auth(format!("closed with code {CLOSE_AUTHENTICATION_FAILED}: {reason}"))
        }
        _ => GatewayError::connection(format!("closed by remote ({code:?}): {reason}")),
    }
}

impl Driver {
    fn publish(&self) {
        self.status.send_replace(SessionStatus::from(&self.session));
    }

    fn set_state(&mut self, state: SessionState) {
        self.session.transition(state);
        self.publish();
    }

    fn emit(&self, envelope: Envelope) {
        if self.events.send(envelope).is_err() {
            debug!("Event receiver dropped, discarding envelope");
        }
    }

    async fn close_transport(&mut self, code: u16) {
        if let Some(mut transport) = self.transport.take() {
            transport.close(code).await;
        }
    }

    async fn send_frame(&mut self, frame: &GatewayFrame) -> GatewayResult<()> {
        let text = frame.encode()?;
        trace!(op = frame.op, "Sending frame");
        self.transport
            .as_mut()
            .ok_or(GatewayError::Closed)?
            .send(text)
            .await
    }

    async fn next_frame(&mut self) -> GatewayResult<GatewayFrame> {
        match recv_inbound(&mut self.transport).await {
            Some(Ok(Inbound::Text(text))) => {
                trace!(len = text.len(), "Received frame");
                GatewayFrame::decode(&text)
            }
            Some(Ok(Inbound::Closed { code, reason })) => Err(close_error(code, &reason)),
            Some(Err(e)) => Err(e),
            None => Err(GatewayError::connection("stream ended")),
        }
    }

    // -------------------------------------------------------------------------
    // Handshake
    // -------------------------------------------------------------------------

    /// Opens a transport and runs HELLO through READY (or RESUMED).
    async fn establish(&mut self, mode: Handshake) -> GatewayResult<()> {
        let url = match mode {
            Handshake::Resume => self.session.resume_url().unwrap_or(&self.url).to_string(),
            Handshake::Identify => self.url.clone(),
        };

        self.set_state(SessionState::Connecting);
        self.transport = Some(self.connector.connect(&url).await?);

        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, self.handshake(mode)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::connection(format!(
                "handshake did not complete within {timeout:?}"
            ))),
        }
    }

    async fn handshake(&mut self, mode: Handshake) -> GatewayResult<()> {
        let hello = loop {
            let frame = self.next_frame().await?;
            if frame.opcode() == Some(Opcode::Hello) {
                break frame;
            }
            debug!(op = frame.op, "Ignoring frame before HELLO");
        };
        let interval = Duration::from_millis(hello.heartbeat_interval_ms());
        debug!(interval = ?interval, "Received HELLO");
        self.session.set_heartbeat_interval(interval);
        self.session.heartbeat_acked();

        match mode {
            Handshake::Identify => {
                self.set_state(SessionState::Identifying);
                let frame = GatewayFrame::identify(
                    self.credentials.token(),
                    self.config.intents,
                    &self.config.properties,
                );
                self.send_frame(&frame).await?;
            }
            Handshake::Resume => {
                self.set_state(SessionState::Resuming);
                let session_id = self
                    .session
                    .session_id()
                    .ok_or(GatewayError::InvalidSession { resumable: false })?
                    .to_string();
                let frame =
                    GatewayFrame::resume(self.credentials.token(), &session_id, self.session.seq());
                self.send_frame(&frame).await?;
            }
        }

        loop {
            let frame = self.next_frame().await?;
            match frame.opcode() {
                Some(Opcode::Dispatch) => {
                    self.session.record_seq(frame.s);
                    let envelope = frame.into_envelope()?;
                    match envelope.name() {
                        "READY" => {
                            let session_id = envelope.payload()["session_id"]
                                .as_str()
                                .ok_or_else(|| {
                                    GatewayError::Decode("READY without session_id".into())
                                })?
                                .to_string();
                            let resume_url = envelope.payload()["resume_gateway_url"]
                                .as_str()
                                .map(str::to_string);
                            info!(session_id = %session_id, "Session ready");
                            self.session.established(session_id, resume_url);
                            self.publish();
                            self.emit(envelope);
                            return Ok(());
                        }
                        "RESUMED" => {
                            info!(seq = ?self.session.seq(), "Session resumed");
                            self.set_state(SessionState::Ready);
                            self.emit(envelope);
                            return Ok(());
                        }
                        // Replayed events while resuming.
                        _ => {
                            self.publish();
                            self.emit(envelope);
                        }
                    }
                }
                Some(Opcode::InvalidSession) => {
                    let resumable = frame.d.as_bool().unwrap_or(false);
                    return Err(match mode {
                        Handshake::Identify => {
                            GatewayError::auth("session rejected during identify")
                        }
                        Handshake::Resume => GatewayError::InvalidSession { resumable },
                    });
                }
                Some(Opcode::Heartbeat) => {
                    let frame = GatewayFrame::heartbeat(self.session.seq());
                    self.send_frame(&frame).await?;
                }
                Some(Opcode::Reconnect) => {
                    return Err(GatewayError::connection(
                        "remote requested reconnect during handshake",
                    ));
                }
                _ => debug!(op = frame.op, "Ignoring frame during handshake"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Established session
    // -------------------------------------------------------------------------

    async fn run(mut self) -> GatewayResult<()> {
        let result = self.run_sessions().await;
        self.close_transport(1000).await;
        self.set_state(SessionState::Disconnected);
        match &result {
            Ok(()) => info!("Gateway session closed"),
            Err(e) => error!(error = %e, "Gateway session terminated"),
        }
        result
    }

    async fn run_sessions(&mut self) -> GatewayResult<()> {
        loop {
            match self.pump().await {
                Ok(()) => return Ok(()),
                Err(Interrupt::Fatal(e)) => return Err(e),
                Err(Interrupt::Lost { reason, resumable }) => {
                    if !resumable {
                        self.session.invalidate();
                    }
                    if !self.recover(reason).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Runs one established connection until it fails or shutdown is requested.
    async fn pump(&mut self) -> Result<(), Interrupt> {
        let interval = self
            .session
            .heartbeat_interval()
            .unwrap_or(Duration::from_millis(crate::frame::DEFAULT_HEARTBEAT_INTERVAL_MS));
        let grace = self.config.heartbeat_grace.unwrap_or(interval);
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            let ack_deadline = self.session.ack_deadline();
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Gateway shutting down");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    self.session.heartbeat_sent(Instant::now(), grace);
                    let frame = GatewayFrame::heartbeat(self.session.seq());
                    trace!(seq = ?self.session.seq(), "Sending heartbeat");
                    self.send_frame(&frame).await.map_err(Interrupt::lost)?;
                }

                _ = tokio::time::sleep_until(ack_deadline.unwrap_or_else(Instant::now)), if ack_deadline.is_some() => {
                    warn!(grace = ?grace, "Heartbeat ACK not received within grace window");
                    return Err(Interrupt::lost("heartbeat not acknowledged"));
                }

                Some(command) = self.commands.recv() => {
                    self.send_command(command).await.map_err(Interrupt::lost)?;
                }

                inbound = recv_inbound(&mut self.transport) => {
                    match inbound {
                        Some(Ok(Inbound::Text(text))) => match GatewayFrame::decode(&text) {
                            Ok(frame) => self.handle_frame(frame).await?,
                            Err(e) => warn!(error = %e, "Discarding undecodable frame"),
                        },
                        Some(Ok(Inbound::Closed { code, reason })) => {
                            return Err(match close_error(code, &reason) {
                                e @ GatewayError::Auth { .. } => Interrupt::Fatal(e),
                                e => Interrupt::lost(e),
                            });
                        }
                        Some(Err(e)) => return Err(Interrupt::lost(e)),
                        None => return Err(Interrupt::lost("stream ended")),
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: GatewayFrame) -> Result<(), Interrupt> {
        match frame.opcode() {
            Some(Opcode::Dispatch) => {
                self.session.record_seq(frame.s);
                self.publish();
                match frame.into_envelope() {
                    Ok(envelope) => self.emit(envelope),
                    Err(e) => warn!(error = %e, "Discarding malformed dispatch"),
                }
            }
            Some(Opcode::Heartbeat) => {
                let frame = GatewayFrame::heartbeat(self.session.seq());
                self.send_frame(&frame).await.map_err(Interrupt::lost)?;
            }
            Some(Opcode::HeartbeatAck) => {
                trace!("Heartbeat acknowledged");
                self.session.heartbeat_acked();
            }
            Some(Opcode::Reconnect) => {
                info!("Remote requested reconnect");
                return Err(Interrupt::lost("remote requested reconnect"));
            }
            Some(Opcode::InvalidSession) => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                warn!(resumable, "Session invalidated by remote");
                if !resumable {
                    tokio::time::sleep(self.config.invalid_session_delay).await;
                }
                return Err(Interrupt::Lost {
                    reason: "session invalidated".into(),
                    resumable,
                });
            }
            _ => debug!(op = frame.op, "Ignoring frame"),
        }
        Ok(())
    }

    async fn send_command(&mut self, command: GatewayCommand) -> GatewayResult<()> {
        let frame = match command {
            GatewayCommand::UpdatePresence(presence) => {
                GatewayFrame::new(Opcode::PresenceUpdate, serde_json::to_value(presence)?)
            }
            GatewayCommand::Raw { op, d } => GatewayFrame {
                op,
                d,
                s: None,
                t: None,
            },
        };
        self.send_frame(&frame).await
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Resumes or re-identifies. `Ok(false)` means shutdown was requested.
    async fn recover(&mut self, reason: String) -> GatewayResult<bool> {
        self.close_transport(4000).await;
        warn!(reason = %reason, "Gateway connection lost, recovering");

        let mut attempts = 0u32;
        let mut last_error = reason;

        while self.session.can_resume() && attempts < self.config.resume_attempts {
            let delay = self.config.backoff.delay(attempts);
            attempts += 1;
            info!(attempt = attempts, delay = ?delay, "Attempting to resume session");
            if !pause(self.cancel.clone(), delay).await {
                return Ok(false);
            }

            match self.establish(Handshake::Resume).await {
                Ok(()) => return Ok(true),
                Err(e @ GatewayError::Auth { .. }) => return Err(e),
                Err(GatewayError::InvalidSession { .. }) => {
                    warn!(attempt = attempts, "Remote refused resume, re-identifying");
                    self.session.invalidate();
                    last_error = "resume refused".into();
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Resume attempt failed");
                    last_error = e.to_string();
                }
            }
            self.close_transport(4000).await;
        }

        let delay = self.config.backoff.delay(attempts);
        attempts += 1;
        self.session.invalidate();
        info!(attempt = attempts, delay = ?delay, "Re-identifying");
        if !pause(self.cancel.clone(), delay).await {
            return Ok(false);
        }

        match self.establish(Handshake::Identify).await {
            Ok(()) => Ok(true),
            Err(e @ GatewayError::Auth { .. }) => Err(e),
            Err(e) => {
                self.close_transport(4000).await;
                warn!(previous = %last_error, error = %e, "Re-identify failed");
                Err(GatewayError::SessionLost {
                    attempts,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryConnector, MemoryPeer};
    use ferrum_core::{Presence, Status};
    use serde_json::{Value, json};

    fn hello(interval_ms: u64) -> String {
        json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}).to_string()
    }

    fn ready(session_id: &str, seq: u64) -> String {
        GatewayFrame::dispatch(
            "READY",
            seq,
            json!({"session_id": session_id, "user": {"id": "1", "username": "bot", "bot": true}}),
        )
        .encode()
        .unwrap()
    }

    async fn next_json(peer: &mut MemoryPeer) -> Value {
        serde_json::from_str(&peer.recv().await.expect("client hung up")).unwrap()
    }

    struct Harness {
        manager: ConnectionManager,
        connector: MemoryConnector,
        peers: mpsc::UnboundedReceiver<MemoryPeer>,
        events: mpsc::UnboundedReceiver<Envelope>,
    }

    fn harness(config: GatewayConfig) -> Harness {
        let (connector, peers) = MemoryConnector::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let manager = ConnectionManager::new(Arc::new(connector.clone()), config, events_tx);
        Harness {
            manager,
            connector,
            peers,
            events,
        }
    }

    /// Accepts one connection, answers HELLO/IDENTIFY/READY and returns the peer.
    async fn connect_ready(h: &mut Harness) -> (SessionHandle, MemoryPeer) {
        let manager = &h.manager;
        let peers = &mut h.peers;
        let server = async {
            let mut peer = peers.recv().await.unwrap();
            peer.send(hello(1000));
            let identify = next_json(&mut peer).await;
            assert_eq!(identify["op"], 2);
            assert_eq!(identify["d"]["token"], "secret");
            peer.send(ready("abc", 1));
            peer
        };
        let (handle, peer) = tokio::join!(
            manager.connect("memory://gw", Credentials::new("Bot secret")),
            server
        );
        (handle.unwrap(), peer)
    }

    #[test]
    fn test_credentials_strip_prefix() {
        assert_eq!(Credentials::new("Bot abc").token(), "abc");
        assert_eq!(Credentials::new(" Bearer xyz ").token(), "xyz");
        assert_eq!(Credentials::new("raw").token(), "raw");
        assert!(!format!("{:?}", Credentials::new("raw")).contains("raw"));
    }

    #[test]
    fn test_backoff_is_capped() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(30), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let h = harness(GatewayConfig::default());
        let connecting = h.manager.connect("memory://gw", Credentials::new("secret"));
        assert_send(&connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_stops_on_cancel() {
        let cancel = CancellationToken::new();
        assert!(pause(cancel.clone(), Duration::from_secs(1)).await);

        let sleeping = tokio::spawn(pause(cancel.clone(), Duration::from_secs(60)));
        cancel.cancel();
        assert!(!sleeping.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_identifies_and_emits_ready() {
        let mut h = harness(GatewayConfig::default());
        let (handle, _peer) = connect_ready(&mut h).await;

        let status = handle.status();
        assert_eq!(status.state, SessionState::Ready);
        assert_eq!(status.session_id.as_deref(), Some("abc"));
        assert_eq!(h.events.recv().await.unwrap().name(), "READY");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_on_close_code() {
        let mut h = harness(GatewayConfig::default());
        let manager = &h.manager;
        let peers = &mut h.peers;
        let server = async {
            let mut peer = peers.recv().await.unwrap();
            peer.send(hello(1000));
            let _identify = next_json(&mut peer).await;
            peer.close(4004, "Authentication failed");
            peer
        };
        let (result, _peer) = tokio::join!(
            manager.connect("memory://gw", Credentials::new("wrong")),
            server
        );
        assert!(matches!(result, Err(GatewayError::Auth { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_session_during_identify_is_auth_error() {
        let mut h = harness(GatewayConfig::default());
        let manager = &h.manager;
        let peers = &mut h.peers;
        let server = async {
            let mut peer = peers.recv().await.unwrap();
            peer.send(hello(1000));
            let _identify = next_json(&mut peer).await;
            peer.send(json!({"op": 9, "d": false}).to_string());
            peer
        };
        let (result, _peer) = tokio::join!(
            manager.connect("memory://gw", Credentials::new("wrong")),
            server
        );
        assert!(matches!(result, Err(GatewayError::Auth { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_is_connection_error() {
        let h = harness(GatewayConfig::default());
        h.connector.refuse_next(1);
        let result = h
            .manager
            .connect("memory://gw", Credentials::new("secret"))
            .await;
        assert!(matches!(result, Err(GatewayError::Connection { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_carries_latest_seq() {
        let mut h = harness(GatewayConfig::default());
        let (_handle, mut peer) = connect_ready(&mut h).await;

        let beat = next_json(&mut peer).await;
        assert_eq!(beat, json!({"op": 1, "d": 1}));
        peer.send(json!({"op": 11}).to_string());

        peer.send(
            GatewayFrame::dispatch("MESSAGE_CREATE", 2, json!({"content": "hi"}))
                .encode()
                .unwrap(),
        );
        assert_eq!(h.events.recv().await.unwrap().name(), "READY");
        let event = h.events.recv().await.unwrap();
        assert_eq!(event.name(), "MESSAGE_CREATE");
        assert_eq!(event.seq(), Some(2));

        let beat = next_json(&mut peer).await;
        assert_eq!(beat, json!({"op": 1, "d": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_ack_resumes_with_last_seq() {
        let mut h = harness(GatewayConfig::default());
        let (handle, mut peer) = connect_ready(&mut h).await;

        // Swallow the heartbeat without acknowledging it.
        assert_eq!(next_json(&mut peer).await["op"], 1);

        let mut resumed = h.peers.recv().await.unwrap();
        resumed.send(hello(1000));
        let resume = next_json(&mut resumed).await;
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["session_id"], "abc");
        assert_eq!(resume["d"]["seq"], 1);
        assert_eq!(resume["d"]["token"], "secret");

        resumed.send(
            GatewayFrame::dispatch("MESSAGE_CREATE", 2, json!({}))
                .encode()
                .unwrap(),
        );
        resumed.send(GatewayFrame::dispatch("RESUMED", 3, json!({})).encode().unwrap());

        let names: Vec<String> = [
            h.events.recv().await.unwrap(),
            h.events.recv().await.unwrap(),
            h.events.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.name().to_string())
        .collect();
        assert_eq!(names, vec!["READY", "MESSAGE_CREATE", "RESUMED"]);

        let mut status = handle.subscribe();
        status
            .wait_for(|s| s.state == SessionState::Ready && s.seq == Some(3))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_resumable_invalid_session_reidentifies() {
        let mut h = harness(GatewayConfig::default());
        let (_handle, peer) = connect_ready(&mut h).await;

        peer.send(json!({"op": 9, "d": false}).to_string());

        let mut fresh = h.peers.recv().await.unwrap();
        fresh.send(hello(1000));
        let identify = next_json(&mut fresh).await;
        assert_eq!(identify["op"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lost_after_exhausting_recovery() {
        let mut h = harness(GatewayConfig {
            resume_attempts: 2,
            ..Default::default()
        });
        let (handle, peer) = connect_ready(&mut h).await;

        h.connector.refuse_next(3);
        peer.close(1006, "abnormal closure");

        match handle.join().await {
            Err(GatewayError::SessionLost { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_close_mid_session_is_fatal() {
        let mut h = harness(GatewayConfig::default());
        let (handle, peer) = connect_ready(&mut h).await;
        peer.close(4004, "token revoked");
        assert!(matches!(handle.join().await, Err(GatewayError::Auth { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_goes_out_on_side_channel() {
        let mut h = harness(GatewayConfig::default());
        let (handle, mut peer) = connect_ready(&mut h).await;

        handle
            .sender()
            .send(GatewayCommand::UpdatePresence(Presence {
                status: Status::Idle,
                ..Default::default()
            }))
            .unwrap();

        let frame = next_json(&mut peer).await;
        assert_eq!(frame["op"], 3);
        assert_eq!(frame["d"]["status"], "idle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_cleanly() {
        let mut h = harness(GatewayConfig::default());
        let (handle, mut peer) = connect_ready(&mut h).await;

        handle.shutdown();
        let status = handle.subscribe();
        assert!(handle.join().await.is_ok());
        assert_eq!(status.borrow().state, SessionState::Disconnected);
        assert_eq!(peer.recv().await, None);
    }
}
