//! Outbound gateway commands and the side channel that carries them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{GatewayError, GatewayResult};

// =============================================================================
// Commands
// =============================================================================

/// Online status advertised in a presence update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Idle,
    Dnd,
    Invisible,
}

/// An activity shown next to the client's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: u8,
}

impl Activity {
    /// A "Playing ..." activity.
    pub fn playing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: 0,
        }
    }
}

/// Payload of a presence update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Presence {
    pub status: Status,
    #[serde(default)]
    pub activities: Vec<Activity>,
    #[serde(default)]
    pub afk: bool,
    #[serde(default)]
    pub since: Option<u64>,
}

/// A frame the caller wants the connection manager to send.
///
/// Sending never waits for a response; correlate with a waiter instead.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    /// Update the client's presence.
    UpdatePresence(Presence),
    /// Send an arbitrary opcode and payload.
    Raw { op: u8, d: Value },
}

// =============================================================================
// Sender
// =============================================================================

/// Cloneable handle for submitting [`GatewayCommand`]s.
#[derive(Debug, Clone)]
pub struct GatewaySender {
    tx: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewaySender {
    /// Creates a sender and the receiver the connection manager drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GatewayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a command. Fails only if the session has shut down.
    pub fn send(&self, command: GatewayCommand) -> GatewayResult<()> {
        self.tx.send(command).map_err(|_| GatewayError::Closed)
    }

    /// Returns `true` once the receiving session has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_after_close_fails() {
        let (sender, rx) = GatewaySender::channel();
        sender
            .send(GatewayCommand::UpdatePresence(Presence::default()))
            .unwrap();
        drop(rx);
        assert!(sender.is_closed());
        assert!(matches!(
            sender.send(GatewayCommand::Raw { op: 1, d: Value::Null }),
            Err(GatewayError::Closed)
        ));
    }

    #[test]
    fn test_presence_serialization() {
        let presence = Presence {
            status: Status::Dnd,
            activities: vec![Activity::playing("with borrowck")],
            ..Default::default()
        };
        let value = serde_json::to_value(&presence).unwrap();
        assert_eq!(value["status"], "dnd");
        assert_eq!(value["activities"][0]["type"], 0);
    }
}
