//! Shared handle to the running client.
//!
//! [`ClientHandle`] bundles the pieces user code talks to: the cache, the
//! router (for listeners and waiters), the request executor and the gateway
//! side channel. It is cheap to clone and is what command contexts carry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::cache::CacheStore;
use crate::envelope::Event;
use crate::error::{GatewayError, GatewayResult, RequestResult};
use crate::executor::{BoxedExecutor, Operation};
use crate::model::{Channel, Guild, Id, Member, Message, Role, User};
use crate::outbound::{GatewayCommand, GatewaySender, Presence};
use crate::router::{EventRouter, Waiter};

#[derive(Clone)]
pub struct ClientHandle {
    router: Arc<EventRouter>,
    executor: BoxedExecutor,
    gateway: Arc<RwLock<Option<GatewaySender>>>,
}

impl ClientHandle {
    pub fn new(router: Arc<EventRouter>, executor: BoxedExecutor) -> Self {
        Self {
            router,
            executor,
            gateway: Arc::new(RwLock::new(None)),
        }
    }

    /// Attaches the gateway side channel once a session exists. Every clone
    /// of this handle sees it.
    pub fn attach_gateway(&self, gateway: GatewaySender) {
        *self.gateway.write() = Some(gateway);
    }

    /// Drops the side channel; gateway sends fail with
    /// [`GatewayError::Closed`] afterwards.
    pub fn detach_gateway(&self) {
        self.gateway.write().take();
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        self.router.cache()
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn executor(&self) -> &BoxedExecutor {
        &self.executor
    }

    /// Shorthand for [`EventRouter::wait_for`].
    pub fn wait_for<P>(&self, event: &str, predicate: P, timeout: Option<Duration>) -> Waiter
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.router.wait_for(event, predicate, timeout)
    }

    /// Queues a frame on the gateway side channel.
    pub fn send_gateway(&self, command: GatewayCommand) -> GatewayResult<()> {
        self.gateway
            .read()
            .as_ref()
            .ok_or(GatewayError::Closed)?
            .send(command)
    }

    pub fn update_presence(&self, presence: Presence) -> GatewayResult<()> {
        self.send_gateway(GatewayCommand::UpdatePresence(presence))
    }

    // =========================================================================
    // Requests
    // =========================================================================

    async fn request<T: DeserializeOwned>(&self, operation: Operation) -> RequestResult<T> {
        let value = self.executor.execute(operation).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Posts a plain text message.
    pub async fn send_message(&self, channel_id: Id, content: &str) -> RequestResult<Message> {
        self.create_message(channel_id, json!({ "content": content }))
            .await
    }

    /// Posts a message with a caller-built body (embeds, references, ...).
    pub async fn create_message(&self, channel_id: Id, body: Value) -> RequestResult<Message> {
        self.request(
            Operation::post("/channels/{channel_id}/messages")
                .param("channel_id", channel_id)
                .json(body),
        )
        .await
    }

    /// Shows the typing indicator in a channel for a few seconds.
    pub async fn trigger_typing(&self, channel_id: Id) -> RequestResult<()> {
        self.executor
            .execute(Operation::post("/channels/{channel_id}/typing").param("channel_id", channel_id))
            .await?;
        Ok(())
    }

    pub async fn fetch_user(&self, user_id: Id) -> RequestResult<User> {
        self.request(Operation::get("/users/{user_id}").param("user_id", user_id))
            .await
    }

    pub async fn fetch_channel(&self, channel_id: Id) -> RequestResult<Channel> {
        self.request(Operation::get("/channels/{channel_id}").param("channel_id", channel_id))
            .await
    }

    pub async fn fetch_guild(&self, guild_id: Id) -> RequestResult<Guild> {
        self.request(Operation::get("/guilds/{guild_id}").param("guild_id", guild_id))
            .await
    }

    pub async fn fetch_member(&self, guild_id: Id, user_id: Id) -> RequestResult<Member> {
        let mut member: Member = self
            .request(
                Operation::get("/guilds/{guild_id}/members/{user_id}")
                    .param("guild_id", guild_id)
                    .param("user_id", user_id),
            )
            .await?;
        member.guild_id = Some(guild_id);
        Ok(member)
    }

    pub async fn fetch_roles(&self, guild_id: Id) -> RequestResult<Vec<Role>> {
        let mut roles: Vec<Role> = self
            .request(Operation::get("/guilds/{guild_id}/roles").param("guild_id", guild_id))
            .await?;
        for role in &mut roles {
            role.guild_id = Some(guild_id);
        }
        Ok(roles)
    }

    pub async fn fetch_message(&self, channel_id: Id, message_id: Id) -> RequestResult<Message> {
        self.request(
            Operation::get("/channels/{channel_id}/messages/{message_id}")
                .param("channel_id", channel_id)
                .param("message_id", message_id),
        )
        .await
    }

    /// Resolves the gateway URL via `GET /gateway/bot`.
    pub async fn fetch_gateway_url(&self) -> RequestResult<String> {
        let value = self.executor.execute(Operation::get("/gateway/bot")).await?;
        value
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                crate::error::RequestError::decode("gateway URL missing from /gateway/bot response")
            })
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("router", &self.router)
            .field("gateway", &self.gateway.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Method;
    use crate::testing::RecordingExecutor;

    fn handle() -> (ClientHandle, Arc<RecordingExecutor>) {
        let executor = Arc::new(RecordingExecutor::new());
        let router = Arc::new(EventRouter::new(Arc::new(CacheStore::default())));
        (ClientHandle::new(router, executor.clone()), executor)
    }

    #[tokio::test]
    async fn test_send_message_posts_to_channel() {
        let (handle, executor) = handle();
        let message = handle.send_message(Id(42), "pong").await.unwrap();

        assert_eq!(message.channel_id, Id(42));
        assert_eq!(message.content, "pong");
        assert_eq!(executor.calls()[0].path(), "/channels/42/messages");
        assert_eq!(executor.sent_messages(), vec!["pong"]);
    }

    #[tokio::test]
    async fn test_gateway_url_lookup() {
        let (handle, executor) = handle();
        executor.respond(
            Method::Get,
            "/gateway/bot",
            Ok(json!({"url": "wss://gateway.example"})),
        );
        assert_eq!(handle.fetch_gateway_url().await.unwrap(), "wss://gateway.example");
        assert!(handle.fetch_gateway_url().await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_gateway_send_without_session() {
        let (handle, _) = handle();
        assert!(matches!(
            handle.update_presence(Presence::default()),
            Err(GatewayError::Closed)
        ));
    }

    #[test]
    fn test_gateway_attach_is_shared() {
        let (handle, _) = handle();
        let clone = handle.clone();
        let (sender, mut commands) = GatewaySender::channel();

        handle.attach_gateway(sender);
        clone.update_presence(Presence::default()).unwrap();
        assert!(matches!(commands.try_recv(), Ok(GatewayCommand::UpdatePresence(_))));

        clone.detach_gateway();
        assert!(handle.update_presence(Presence::default()).is_err());
    }
}
