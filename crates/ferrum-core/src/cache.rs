//! Entity cache maintained from the event stream.
//!
//! Every entity kind lives on its own shelf with an independent retention
//! policy. Entries are `Arc` snapshots: an update builds a complete new
//! record and swaps it in, so readers never observe a half-applied change.
//! The only writer is [`CacheStore::apply`], which the event router calls
//! once per envelope in arrival order.

use std::hash::Hash;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{trace, warn};

use crate::envelope::Envelope;
use crate::model::{Channel, Guild, Id, Member, Message, Role, User};

/// Default number of messages kept before the oldest is evicted.
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

// =============================================================================
// Policy
// =============================================================================

/// How many entries of one kind the cache may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Keep everything.
    #[default]
    Unbounded,
    /// Keep at most this many entries, evicting the least recently written.
    Bounded(usize),
}

/// Retention per entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub messages: Retention,
    pub users: Retention,
    pub channels: Retention,
    pub guilds: Retention,
    pub roles: Retention,
    pub members: Retention,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            messages: Retention::Bounded(DEFAULT_MAX_MESSAGES),
            users: Retention::Unbounded,
            channels: Retention::Unbounded,
            guilds: Retention::Unbounded,
            roles: Retention::Unbounded,
            members: Retention::Unbounded,
        }
    }
}

/// A cached entry handed to listeners as the pre-event state.
#[derive(Debug, Clone)]
pub enum Snapshot {
    Message(Arc<Message>),
    User(Arc<User>),
    Channel(Arc<Channel>),
    Guild(Arc<Guild>),
    Role(Arc<Role>),
    Member(Arc<Member>),
}

// =============================================================================
// Shelf
// =============================================================================

struct Shelf<K, V> {
    entries: IndexMap<K, Arc<V>>,
    retention: Retention,
}

impl<K: Hash + Eq, V> Shelf<K, V> {
    fn new(retention: Retention) -> Self {
        Self {
            entries: IndexMap::new(),
            retention,
        }
    }

    fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).cloned()
    }

    /// Replaces the entry and marks it as the most recent one.
    fn put(&mut self, key: K, value: V) -> Option<Arc<V>> {
        let previous = self.entries.shift_remove(&key);
        self.entries.insert(key, Arc::new(value));
        if let Retention::Bounded(max) = self.retention {
            while self.entries.len() > max {
                self.entries.shift_remove_index(0);
            }
        }
        previous
    }

    fn remove(&mut self, key: &K) -> Option<Arc<V>> {
        self.entries.shift_remove(key)
    }

    fn retain(&mut self, keep: impl FnMut(&K, &mut Arc<V>) -> bool) {
        self.entries.retain(keep);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn find(&self, mut pred: impl FnMut(&V) -> bool) -> Option<Arc<V>> {
        self.entries.values().find(|v| pred(v)).cloned()
    }
}

// =============================================================================
// CacheStore
// =============================================================================

type UpdateFn = fn(&CacheStore, &Value) -> serde_json::Result<Option<Snapshot>>;

/// Keyed store of recently observed entities.
pub struct CacheStore {
    messages: RwLock<Shelf<Id, Message>>,
    users: RwLock<Shelf<Id, User>>,
    channels: RwLock<Shelf<Id, Channel>>,
    guilds: RwLock<Shelf<Id, Guild>>,
    roles: RwLock<Shelf<Id, Role>>,
    members: RwLock<Shelf<(Id, Id), Member>>,
    current_user: RwLock<Option<Arc<User>>>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl CacheStore {
    /// Creates an empty cache with the given retention policy.
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            messages: RwLock::new(Shelf::new(policy.messages)),
            users: RwLock::new(Shelf::new(policy.users)),
            channels: RwLock::new(Shelf::new(policy.channels)),
            guilds: RwLock::new(Shelf::new(policy.guilds)),
            roles: RwLock::new(Shelf::new(policy.roles)),
            members: RwLock::new(Shelf::new(policy.members)),
            current_user: RwLock::new(None),
        }
    }

    /// Returns `true` if the named event updates the cache.
    pub fn is_relevant(event_name: &str) -> bool {
        update_fn(event_name).is_some()
    }

    /// Applies one envelope and returns the entry it replaced or removed.
    ///
    /// Events that are not cache-relevant are ignored. Payloads that fail to
    /// decode leave the cache untouched.
    pub fn apply(&self, envelope: &Envelope) -> Option<Snapshot> {
        let update = update_fn(envelope.name())?;
        match update(self, envelope.payload()) {
            Ok(previous) => {
                trace!(event = %envelope.name(), "Cache updated");
                previous
            }
            Err(e) => {
                warn!(event = %envelope.name(), error = %e, "Failed to apply event to cache");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lookups
    // -------------------------------------------------------------------------

    /// The user this client is logged in as.
    pub fn current_user(&self) -> Option<Arc<User>> {
        self.current_user.read().clone()
    }

    pub fn message(&self, id: Id) -> Option<Arc<Message>> {
        self.messages.read().get(&id)
    }

    pub fn user(&self, id: Id) -> Option<Arc<User>> {
        self.users.read().get(&id)
    }

    pub fn channel(&self, id: Id) -> Option<Arc<Channel>> {
        self.channels.read().get(&id)
    }

    pub fn guild(&self, id: Id) -> Option<Arc<Guild>> {
        self.guilds.read().get(&id)
    }

    pub fn role(&self, id: Id) -> Option<Arc<Role>> {
        self.roles.read().get(&id)
    }

    pub fn member(&self, guild_id: Id, user_id: Id) -> Option<Arc<Member>> {
        self.members.read().get(&(guild_id, user_id))
    }

    /// Finds a channel by exact name, optionally restricted to one guild.
    pub fn find_channel(&self, guild_id: Option<Id>, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().find(|c| {
            c.name.as_deref() == Some(name) && (guild_id.is_none() || c.guild_id == guild_id)
        })
    }

    /// Finds a role by case-insensitive name, optionally restricted to one guild.
    pub fn find_role(&self, guild_id: Option<Id>, name: &str) -> Option<Arc<Role>> {
        let name = name.to_lowercase();
        self.roles.read().find(|r| {
            r.name.to_lowercase() == name && (guild_id.is_none() || r.guild_id == guild_id)
        })
    }

    /// Finds a guild member by username, global name or nickname.
    pub fn find_member(&self, guild_id: Id, name: &str) -> Option<Arc<Member>> {
        self.members.read().find(|m| {
            m.guild_id == Some(guild_id)
                && (m.nick.as_deref() == Some(name)
                    || m.user
                        .as_ref()
                        .is_some_and(|u| u.username == name || u.global_name.as_deref() == Some(name)))
        })
    }

    /// Finds a user by username or global name.
    pub fn find_user(&self, name: &str) -> Option<Arc<User>> {
        self.users
            .read()
            .find(|u| u.username == name || u.global_name.as_deref() == Some(name))
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    pub fn guild_count(&self) -> usize {
        self.guilds.read().len()
    }

    // -------------------------------------------------------------------------
    // Writers (policy table targets)
    // -------------------------------------------------------------------------

    fn put_user(&self, user: User) -> Option<Arc<User>> {
        self.users.write().put(user.id, user)
    }

    fn put_member(&self, guild_id: Id, mut member: Member) -> Option<Arc<Member>> {
        let user_id = member.user_id()?;
        member.guild_id = Some(guild_id);
        if let Some(user) = member.user.clone() {
            self.put_user(user);
        }
        self.members.write().put((guild_id, user_id), member)
    }

    fn put_channel(&self, channel: Channel) -> Option<Arc<Channel>> {
        self.channels.write().put(channel.id, channel)
    }

    fn put_role(&self, guild_id: Id, mut role: Role) -> Option<Arc<Role>> {
        role.guild_id = Some(guild_id);
        self.roles.write().put(role.id, role)
    }
}

// =============================================================================
// Policy table
// =============================================================================

fn update_fn(event_name: &str) -> Option<UpdateFn> {
    let f: UpdateFn = match event_name {
        "READY" => on_ready,
        "MESSAGE_CREATE" => on_message_create,
        "MESSAGE_UPDATE" => on_message_update,
        "MESSAGE_DELETE" => on_message_delete,
        "MESSAGE_DELETE_BULK" => on_message_delete_bulk,
        "CHANNEL_CREATE" | "CHANNEL_UPDATE" => on_channel_upsert,
        "CHANNEL_DELETE" => on_channel_delete,
        "GUILD_CREATE" => on_guild_create,
        "GUILD_UPDATE" => on_guild_update,
        "GUILD_DELETE" => on_guild_delete,
        "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => on_role_upsert,
        "GUILD_ROLE_DELETE" => on_role_delete,
        "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => on_member_upsert,
        "GUILD_MEMBER_REMOVE" => on_member_remove,
        _ => return None,
    };
    Some(f)
}

/// Overlays a partial payload onto the previous snapshot, producing a full record.
fn overlay<T>(previous: Option<&Arc<T>>, patch: &Value) -> serde_json::Result<T>
where
    T: Serialize + DeserializeOwned,
{
    match (previous, patch) {
        (Some(previous), Value::Object(fields)) => {
            let mut base = serde_json::to_value(previous.as_ref())?;
            if let Value::Object(target) = &mut base {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            serde_json::from_value(base)
        }
        _ => T::deserialize(patch),
    }
}

fn id_field(payload: &Value, key: &str) -> serde_json::Result<Id> {
    serde_json::from_value(payload.get(key).cloned().unwrap_or(Value::Null))
}

fn on_ready(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let user: User = serde_json::from_value(payload.get("user").cloned().unwrap_or(Value::Null))?;
    *cache.current_user.write() = Some(Arc::new(user.clone()));
    cache.put_user(user);
    Ok(None)
}

fn store_message(cache: &CacheStore, message: Message) -> Option<Snapshot> {
    cache.put_user(message.author.clone());
    if let (Some(guild_id), Some(member)) = (message.guild_id, message.member.clone()) {
        let member = Member {
            user: Some(message.author.clone()),
            ..member
        };
        cache.put_member(guild_id, member);
    }
    cache
        .messages
        .write()
        .put(message.id, message)
        .map(Snapshot::Message)
}

fn on_message_create(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let message: Message = Message::deserialize(payload)?;
    Ok(store_message(cache, message))
}

fn on_message_update(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let id = id_field(payload, "id")?;
    let previous = cache.message(id);
    let message: Message = overlay(previous.as_ref(), payload)?;
    Ok(store_message(cache, message))
}

fn on_message_delete(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let id = id_field(payload, "id")?;
    Ok(cache.messages.write().remove(&id).map(Snapshot::Message))
}

fn on_message_delete_bulk(
    cache: &CacheStore,
    payload: &Value,
) -> serde_json::Result<Option<Snapshot>> {
    let ids: Vec<Id> = serde_json::from_value(payload.get("ids").cloned().unwrap_or_default())?;
    let mut shelf = cache.messages.write();
    for id in &ids {
        shelf.remove(id);
    }
    Ok(None)
}

fn on_channel_upsert(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let id = id_field(payload, "id")?;
    let previous = cache.channel(id);
    let channel: Channel = overlay(previous.as_ref(), payload)?;
    Ok(cache.put_channel(channel).map(Snapshot::Channel))
}

fn on_channel_delete(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let id = id_field(payload, "id")?;
    Ok(cache.channels.write().remove(&id).map(Snapshot::Channel))
}

fn on_guild_create(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let guild = Guild::deserialize(payload)?;
    for channel in &guild.channels {
        cache.put_channel(Channel {
            guild_id: Some(guild.id),
            ..channel.clone()
        });
    }
    for role in &guild.roles {
        cache.put_role(guild.id, role.clone());
    }
    if let Some(members) = payload.get("members").and_then(Value::as_array) {
        for member in members {
            if let Ok(member) = Member::deserialize(member) {
                cache.put_member(guild.id, member);
            }
        }
    }
    Ok(cache.guilds.write().put(guild.id, guild).map(Snapshot::Guild))
}

fn on_guild_update(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let id = id_field(payload, "id")?;
    let previous = cache.guild(id);
    let guild: Guild = overlay(previous.as_ref(), payload)?;
    Ok(cache.guilds.write().put(guild.id, guild).map(Snapshot::Guild))
}

fn on_guild_delete(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let id = id_field(payload, "id")?;
    cache
        .channels
        .write()
        .retain(|_, c| c.guild_id != Some(id));
    cache.roles.write().retain(|_, r| r.guild_id != Some(id));
    cache.members.write().retain(|(guild_id, _), _| *guild_id != id);
    Ok(cache.guilds.write().remove(&id).map(Snapshot::Guild))
}

fn on_role_upsert(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let guild_id = id_field(payload, "guild_id")?;
    let role = Role::deserialize(payload.get("role").unwrap_or(&Value::Null))?;
    Ok(cache.put_role(guild_id, role).map(Snapshot::Role))
}

fn on_role_delete(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let role_id = id_field(payload, "role_id")?;
    Ok(cache.roles.write().remove(&role_id).map(Snapshot::Role))
}

fn on_member_upsert(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let guild_id = id_field(payload, "guild_id")?;
    let user_id = id_field(payload.get("user").unwrap_or(&Value::Null), "id")?;
    let previous = cache.member(guild_id, user_id);
    let member: Member = overlay(previous.as_ref(), payload)?;
    Ok(cache.put_member(guild_id, member).map(Snapshot::Member))
}

fn on_member_remove(cache: &CacheStore, payload: &Value) -> serde_json::Result<Option<Snapshot>> {
    let guild_id = id_field(payload, "guild_id")?;
    let user_id = id_field(payload.get("user").unwrap_or(&Value::Null), "id")?;
    Ok(cache
        .members
        .write()
        .remove(&(guild_id, user_id))
        .map(Snapshot::Member))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: u64, content: &str) -> Envelope {
        Envelope::new(
            "MESSAGE_CREATE",
            json!({
                "id": id.to_string(),
                "channel_id": "10",
                "author": {"id": "7", "username": "ferris"},
                "content": content,
            }),
        )
    }

    #[test]
    fn test_bounded_messages_evict_oldest() {
        let cache = CacheStore::new(CachePolicy {
            messages: Retention::Bounded(2),
            ..Default::default()
        });
        cache.apply(&message(1, "a"));
        cache.apply(&message(2, "b"));
        cache.apply(&message(3, "c"));

        assert_eq!(cache.message_count(), 2);
        assert!(cache.message(Id(1)).is_none());
        assert!(cache.message(Id(3)).is_some());
    }

    #[test]
    fn test_rewrite_refreshes_recency() {
        let cache = CacheStore::new(CachePolicy {
            messages: Retention::Bounded(2),
            ..Default::default()
        });
        cache.apply(&message(1, "a"));
        cache.apply(&message(2, "b"));
        cache.apply(&Envelope::new(
            "MESSAGE_UPDATE",
            json!({"id": "1", "content": "edited"}),
        ));
        cache.apply(&message(3, "c"));

        assert!(cache.message(Id(2)).is_none());
        assert_eq!(cache.message(Id(1)).unwrap().content, "edited");
    }

    #[test]
    fn test_update_returns_previous_snapshot() {
        let cache = CacheStore::default();
        cache.apply(&message(1, "before"));
        let previous = cache.apply(&Envelope::new(
            "MESSAGE_UPDATE",
            json!({"id": "1", "content": "after"}),
        ));

        match previous {
            Some(Snapshot::Message(m)) => assert_eq!(m.content, "before"),
            other => panic!("unexpected snapshot: {other:?}"),
        }
        let current = cache.message(Id(1)).unwrap();
        assert_eq!(current.content, "after");
        assert_eq!(current.author.username, "ferris");
    }

    #[test]
    fn test_guild_create_populates_children() {
        let cache = CacheStore::default();
        cache.apply(&Envelope::new(
            "GUILD_CREATE",
            json!({
                "id": "100",
                "name": "rustaceans",
                "channels": [{"id": "101", "type": 0, "name": "general"}],
                "roles": [{"id": "102", "name": "Moderator"}],
            }),
        ));

        assert_eq!(cache.guild(Id(100)).unwrap().name, "rustaceans");
        assert_eq!(cache.channel(Id(101)).unwrap().guild_id, Some(Id(100)));
        assert_eq!(cache.find_role(Some(Id(100)), "moderator").unwrap().id, Id(102));
        assert_eq!(cache.find_channel(None, "general").unwrap().id, Id(101));

        cache.apply(&Envelope::new("GUILD_DELETE", json!({"id": "100"})));
        assert!(cache.channel(Id(101)).is_none());
        assert!(cache.role(Id(102)).is_none());
    }

    #[test]
    fn test_ready_sets_current_user() {
        let cache = CacheStore::default();
        cache.apply(&Envelope::new(
            "READY",
            json!({"session_id": "abc", "user": {"id": "5", "username": "bot", "bot": true}}),
        ));
        assert_eq!(cache.current_user().unwrap().id, Id(5));
    }

    #[test]
    fn test_bad_payload_leaves_cache_untouched() {
        let cache = CacheStore::default();
        assert!(cache.apply(&Envelope::new("MESSAGE_CREATE", json!({"id": "x"}))).is_none());
        assert_eq!(cache.message_count(), 0);
        assert!(!CacheStore::is_relevant("TYPING_START"));
    }
}
