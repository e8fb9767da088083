//! Gateway frame codec.
//!
//! Every frame is a JSON object `{op, d, s, t}`. Only dispatch frames
//! (opcode 0) carry a sequence number and an event name.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use ferrum_core::{Envelope, GatewayError, GatewayResult};

/// Default heartbeat interval when HELLO omits one, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 45_000;

/// Close code the remote uses for rejected credentials.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;

/// Gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

/// One raw gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayFrame {
    pub fn new(op: Opcode, d: Value) -> Self {
        Self {
            op: op as u8,
            d,
            s: None,
            t: None,
        }
    }

    /// Builds a dispatch frame. Used by in-memory peers in tests.
    pub fn dispatch(event: impl Into<String>, seq: u64, d: Value) -> Self {
        Self {
            op: Opcode::Dispatch as u8,
            d,
            s: Some(seq),
            t: Some(event.into()),
        }
    }

    pub fn decode(text: &str) -> GatewayResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> GatewayResult<String> {
        serde_json::to_string(self).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }

    /// Converts a dispatch frame into an envelope.
    pub fn into_envelope(self) -> GatewayResult<Envelope> {
        let name = self
            .t
            .ok_or_else(|| GatewayError::Decode("dispatch frame without event name".into()))?;
        Ok(Envelope::new(name, self.d).with_seq(self.s).with_op(self.op))
    }

    // ------------------------------------------------------------------------
    // Outbound builders
    // ------------------------------------------------------------------------

    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self::new(Opcode::Heartbeat, json!(seq))
    }

    pub fn identify(token: &str, intents: u64, properties: &ConnectionProperties) -> Self {
        Self::new(
            Opcode::Identify,
            json!({
                "token": token,
                "intents": intents,
                "properties": properties,
            }),
        )
    }

    pub fn resume(token: &str, session_id: &str, seq: Option<u64>) -> Self {
        Self::new(
            Opcode::Resume,
            json!({
                "token": token,
                "session_id": session_id,
                "seq": seq,
            }),
        )
    }

    /// Reads `heartbeat_interval` from a HELLO payload.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.d
            .get("heartbeat_interval")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS)
    }
}

/// Client description sent with IDENTIFY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "ferrum".to_string(),
            device: "ferrum".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_dispatch_into_envelope() {
        let frame = GatewayFrame::decode(
            r#"{"op":0,"s":42,"t":"MESSAGE_CREATE","d":{"content":"hi"}}"#,
        )
        .unwrap();
        assert_eq!(frame.opcode(), Some(Opcode::Dispatch));

        let envelope = frame.into_envelope().unwrap();
        assert_eq!(envelope.name(), "MESSAGE_CREATE");
        assert_eq!(envelope.seq(), Some(42));
        assert_eq!(envelope.payload()["content"], "hi");
    }

    #[test]
    fn test_hello_interval_defaults() {
        let frame = GatewayFrame::decode(r#"{"op":10,"d":{}}"#).unwrap();
        assert_eq!(frame.heartbeat_interval_ms(), DEFAULT_HEARTBEAT_INTERVAL_MS);
        let frame = GatewayFrame::decode(r#"{"op":10,"d":{"heartbeat_interval":1000}}"#).unwrap();
        assert_eq!(frame.heartbeat_interval_ms(), 1000);
    }

    #[test]
    fn test_heartbeat_encoding() {
        let text = GatewayFrame::heartbeat(Some(7)).encode().unwrap();
        assert_eq!(text, r#"{"op":1,"d":7}"#);
        let text = GatewayFrame::heartbeat(None).encode().unwrap();
        assert_eq!(text, r#"{"op":1,"d":null}"#);
    }

    #[test]
    fn test_unknown_opcode() {
        let frame = GatewayFrame::decode(r#"{"op":99}"#).unwrap();
        assert_eq!(frame.opcode(), None);
        assert!(GatewayFrame::decode("not json").is_err());
    }
}
