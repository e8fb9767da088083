//! Shared fixtures for the unit tests of this crate.

use std::sync::Arc;

use ferrum_core::testing::RecordingExecutor;
use ferrum_core::{CacheStore, ClientHandle, EventRouter, Id, Member, Message, User};

use crate::context::Context;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::registry::{CommandRegistry, RegistryOptions};

pub(crate) const AUTHOR: u64 = 42;
pub(crate) const CHANNEL: u64 = 7;

pub(crate) struct Fixture {
    pub handle: ClientHandle,
    pub executor: Arc<RecordingExecutor>,
    pub registry: Arc<CommandRegistry>,
}

pub(crate) fn fixture() -> Fixture {
    fixture_with(RegistryOptions::default())
}

pub(crate) fn fixture_with(options: RegistryOptions) -> Fixture {
    let executor = Arc::new(RecordingExecutor::new());
    let router = Arc::new(EventRouter::new(Arc::new(CacheStore::default())));
    let handle = ClientHandle::new(router, executor.clone());
    Fixture {
        handle,
        executor,
        registry: Arc::new(CommandRegistry::new(options)),
    }
}

impl Fixture {
    pub fn context(&self, message: Message) -> Context {
        Context::new(self.handle.clone(), Arc::new(message), self.registry.clone())
    }

    pub fn pipeline(&self, config: PipelineConfig) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(self.handle.clone(), self.registry.clone(), config))
    }
}

pub(crate) fn message_from(author: u64, channel: u64, guild: Option<u64>) -> Message {
    Message {
        id: Id(1000),
        channel_id: Id(channel),
        guild_id: guild.map(Id),
        author: User {
            id: Id(author),
            username: format!("user{author}"),
            global_name: None,
            bot: false,
        },
        content: String::new(),
        member: None,
        mentions: Vec::new(),
    }
}

/// A direct message from [`AUTHOR`].
pub(crate) fn message(content: &str) -> Message {
    Message {
        content: content.to_string(),
        ..message_from(AUTHOR, CHANNEL, None)
    }
}

/// A guild message from [`AUTHOR`] carrying the given member roles.
pub(crate) fn message_in_guild_with_roles(content: &str, guild: u64, roles: &[u64]) -> Message {
    let mut msg = message_from(AUTHOR, CHANNEL, Some(guild));
    msg.content = content.to_string();
    msg.member = Some(Member {
        user: None,
        guild_id: Some(Id(guild)),
        nick: None,
        roles: roles.iter().copied().map(Id).collect(),
    });
    msg
}

pub(crate) fn message_in_guild(content: &str, guild: u64) -> Message {
    message_in_guild_with_roles(content, guild, &[])
}
