//! Plain entity records decoded from event payloads and request responses.
//!
//! These are deliberately thin: identity fields plus whatever the runtime
//! itself needs (names for lookup, author flags, role lists). Unknown fields
//! in payloads are ignored.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Id
// =============================================================================

/// Stable numeric identifier of a remote entity.
///
/// Serialized as a decimal string; deserialized from either a string or a
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(pub u64);

impl Id {
    /// Returns the raw integer value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Id {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Id)
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id(value)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(Id(n)),
            Raw::Str(s) => s.parse().map(Id).map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    /// Returns the display name, falling back to the username.
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }

    /// Returns the mention markup for this user.
    pub fn mention(&self) -> String {
        format!("<@{}>", self.id)
    }
}

/// A user's membership in a guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub guild_id: Option<Id>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Id>,
}

impl Member {
    /// Returns the member's user id, if the payload carried one.
    pub fn user_id(&self) -> Option<Id> {
        self.user.as_ref().map(|u| u.id)
    }

    /// Returns `true` if the member holds the given role.
    pub fn has_role(&self, role: Id) -> bool {
        self.roles.contains(&role)
    }
}

/// A guild role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: Id,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub guild_id: Option<Id>,
    #[serde(default)]
    pub position: i64,
}

/// Channel kinds the runtime distinguishes.
pub mod channel_kind {
    pub const GUILD_TEXT: u8 = 0;
    pub const DM: u8 = 1;
    pub const GUILD_VOICE: u8 = 2;
    pub const GROUP_DM: u8 = 3;
    pub const GUILD_CATEGORY: u8 = 4;
}

/// A text, voice or private channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Id,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guild_id: Option<Id>,
}

impl Channel {
    /// Returns `true` for direct and group-direct channels.
    pub fn is_private(&self) -> bool {
        matches!(self.kind, channel_kind::DM | channel_kind::GROUP_DM)
    }

    /// Returns `true` for channels that carry text messages.
    pub fn is_text(&self) -> bool {
        matches!(
            self.kind,
            channel_kind::GUILD_TEXT | channel_kind::DM | channel_kind::GROUP_DM
        )
    }

    /// Returns the mention markup for this channel.
    pub fn mention(&self) -> String {
        format!("<#{}>", self.id)
    }
}

/// A guild. `channels` and `roles` are only populated on creation payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guild {
    pub id: Id,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<Id>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

/// A message posted in a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Id,
    pub channel_id: Id,
    #[serde(default)]
    pub guild_id: Option<Id>,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub member: Option<Member>,
    #[serde(default)]
    pub mentions: Vec<User>,
}

impl Message {
    /// Returns `true` if the message was posted outside any guild.
    pub fn is_private(&self) -> bool {
        self.guild_id.is_none()
    }
}
