//! Cooldown buckets.
//!
//! A [`Cooldown`] allows `rate` uses per `per` window. [`CooldownMapping`]
//! keeps one bucket per [`BucketKey`], derived from the triggering message
//! according to a [`BucketScope`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use ferrum_core::{Id, Message};

/// Buckets above this count get pruned of expired windows.
const PRUNE_THRESHOLD: usize = 1024;

/// What a rate-limit bucket is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketScope {
    /// One bucket shared by everyone.
    #[default]
    Global,
    User,
    Guild,
    Channel,
    /// Per user within a guild.
    Member,
}

impl BucketScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Guild => "guild",
            Self::Channel => "channel",
            Self::Member => "member",
        }
    }

    /// Derives the bucket key for a message. Direct messages use guild `0`.
    pub fn key(&self, message: &Message) -> BucketKey {
        let guild = message.guild_id.unwrap_or(Id(0));
        match self {
            Self::Global => BucketKey::Global,
            Self::User => BucketKey::User(message.author.id),
            Self::Guild => BucketKey::Guild(guild),
            Self::Channel => BucketKey::Channel(message.channel_id),
            Self::Member => BucketKey::Member(guild, message.author.id),
        }
    }
}

impl fmt::Display for BucketScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKey {
    Global,
    User(Id),
    Guild(Id),
    Channel(Id),
    Member(Id, Id),
}

/// `rate` uses per `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    pub rate: u32,
    pub per: Duration,
}

impl Cooldown {
    pub fn new(rate: u32, per: Duration) -> Self {
        Self { rate, per }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: u32,
    window: Option<Instant>,
}

impl Bucket {
    fn fresh(cooldown: &Cooldown) -> Self {
        Self {
            tokens: cooldown.rate,
            window: None,
        }
    }

    /// Windows are half-open: `[start, start + per)`.
    fn expired(&self, cooldown: &Cooldown, now: Instant) -> bool {
        self.window.is_none_or(|start| now >= start + cooldown.per)
    }

    /// Takes a token. Returns the wait until the window resets when none are left.
    fn update(&mut self, cooldown: &Cooldown, now: Instant) -> Option<Duration> {
        if self.expired(cooldown, now) {
            self.tokens = cooldown.rate;
            self.window = Some(now);
        }
        if self.tokens == 0 {
            let start = self.window.unwrap_or(now);
            return Some((start + cooldown.per).saturating_duration_since(now));
        }
        self.tokens -= 1;
        None
    }

    fn retry_after(&self, cooldown: &Cooldown, now: Instant) -> Option<Duration> {
        match self.window {
            Some(start) if self.tokens == 0 && !self.expired(cooldown, now) => {
                Some(start + cooldown.per - now)
            }
            _ => None,
        }
    }
}

/// Cooldown state for one command, one bucket per key.
#[derive(Debug)]
pub struct CooldownMapping {
    cooldown: Cooldown,
    scope: BucketScope,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl CooldownMapping {
    pub fn new(cooldown: Cooldown, scope: BucketScope) -> Self {
        Self {
            cooldown,
            scope,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Cooldown {
        self.cooldown
    }

    pub fn scope(&self) -> BucketScope {
        self.scope
    }

    /// Charges one use against the message's bucket.
    ///
    /// Returns `Some(retry_after)` when the bucket is exhausted; nothing is
    /// charged in that case.
    pub fn update_rate_limit(&self, message: &Message, now: Instant) -> Option<Duration> {
        let key = self.scope.key(message);
        let mut buckets = self.buckets.lock();
        if buckets.len() > PRUNE_THRESHOLD {
            let cooldown = self.cooldown;
            buckets.retain(|_, bucket| !bucket.expired(&cooldown, now));
        }
        buckets
            .entry(key)
            .or_insert_with(|| Bucket::fresh(&self.cooldown))
            .update(&self.cooldown, now)
    }

    /// Restores the message's bucket to full.
    pub fn reset(&self, message: &Message) {
        self.buckets.lock().remove(&self.scope.key(message));
    }

    /// Remaining wait for the message's bucket, if it is exhausted.
    pub fn retry_after(&self, message: &Message, now: Instant) -> Option<Duration> {
        self.buckets
            .lock()
            .get(&self.scope.key(message))
            .and_then(|bucket| bucket.retry_after(&self.cooldown, now))
    }

    pub fn is_on_cooldown(&self, message: &Message, now: Instant) -> bool {
        self.retry_after(message, now).is_some()
    }
}
