//! Authorization checks.
//!
//! A [`Check`] is a named async predicate over the invocation context. The
//! first check that returns `false` fails the invocation with
//! [`CommandError::CheckFailure`](crate::CommandError::CheckFailure) carrying
//! its name.

use std::fmt;
use std::future::{self, Future};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use ferrum_core::{Id, panic_message};

use crate::context::Context;

type Predicate = Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Clone)]
pub struct Check {
    name: Arc<str>,
    predicate: Predicate,
}

impl Check {
    pub fn new<F, Fut>(name: impl Into<Arc<str>>, predicate: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(move |ctx| predicate(ctx).boxed()),
        }
    }

    /// A check that needs no awaiting.
    pub fn sync<F>(name: impl Into<Arc<str>>, predicate: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        Self::new(name, move |ctx| future::ready(predicate(&ctx)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the check. A panicking predicate counts as a rejection.
    pub async fn run(&self, ctx: Arc<Context>) -> bool {
        let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.predicate)(ctx))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };
        outcome.unwrap_or_else(|payload| {
            warn!(check = %self.name, panic = %panic_message(&*payload), "Check panicked");
            false
        })
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Check").field(&self.name).finish()
    }
}

// ============================================================================
// Built-in checks
// ============================================================================

/// Passes only inside a guild.
pub fn guild_only() -> Check {
    Check::sync("guild_only", |ctx| !ctx.is_private())
}

/// Passes only in direct messages.
pub fn dm_only() -> Check {
    Check::sync("dm_only", |ctx| ctx.is_private())
}

/// Passes for the configured owner ids.
pub fn is_owner() -> Check {
    Check::sync("is_owner", |ctx| ctx.is_owner(ctx.author().id))
}

/// A role given by id or by (case-insensitive) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleRef {
    Id(Id),
    Name(String),
}

impl From<Id> for RoleRef {
    fn from(id: Id) -> Self {
        Self::Id(id)
    }
}

impl From<u64> for RoleRef {
    fn from(id: u64) -> Self {
        Self::Id(Id(id))
    }
}

impl From<&str> for RoleRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for RoleRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// Passes when the author holds the role. Always fails in direct messages.
pub fn has_role(role: impl Into<RoleRef>) -> Check {
    role_check("has_role", Holder::Author, [role.into()].into())
}

/// Passes when the author holds at least one of the roles.
pub fn has_any_role<R: Into<RoleRef>>(roles: impl IntoIterator<Item = R>) -> Check {
    role_check("has_any_role", Holder::Author, collect_roles(roles))
}

/// Passes when the bot's own member holds the role. Always fails in direct
/// messages and before the bot's user is known.
pub fn bot_has_role(role: impl Into<RoleRef>) -> Check {
    role_check("bot_has_role", Holder::Bot, [role.into()].into())
}

/// Passes when the bot's own member holds at least one of the roles.
pub fn bot_has_any_role<R: Into<RoleRef>>(roles: impl IntoIterator<Item = R>) -> Check {
    role_check("bot_has_any_role", Holder::Bot, collect_roles(roles))
}

/// Passes when any of the given checks passes.
pub fn check_any(checks: Vec<Check>) -> Check {
    let checks: Arc<[Check]> = checks.into();
    Check::new("check_any", move |ctx| {
        let checks = checks.clone();
        async move {
            for check in checks.iter() {
                if check.run(ctx.clone()).await {
                    return true;
                }
            }
            false
        }
    })
}

/// Whose roles a role check inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Author,
    Bot,
}

fn collect_roles<R: Into<RoleRef>>(roles: impl IntoIterator<Item = R>) -> Arc<[RoleRef]> {
    roles.into_iter().map(Into::into).collect()
}

fn role_check(name: &'static str, holder: Holder, roles: Arc<[RoleRef]>) -> Check {
    Check::new(name, move |ctx| {
        let roles = roles.clone();
        async move { holds_any(&ctx, holder, &roles).await }
    })
}

/// Role ids of the holder's member in `guild_id`. The author's come from the
/// message when it carries them; otherwise the cache, then a fetch.
async fn member_roles(ctx: &Context, holder: Holder, guild_id: Id) -> Option<Vec<Id>> {
    let user = match holder {
        Holder::Author => {
            if let Some(member) = &ctx.message().member {
                return Some(member.roles.clone());
            }
            ctx.author().id
        }
        Holder::Bot => ctx.cache().current_user()?.id,
    };
    if let Some(member) = ctx.cache().member(guild_id, user) {
        return Some(member.roles.clone());
    }
    match ctx.handle().fetch_member(guild_id, user).await {
        Ok(member) => Some(member.roles),
        Err(e) => {
            debug!(error = %e, holder = ?holder, "Could not fetch member");
            None
        }
    }
}

async fn holds_any(ctx: &Context, holder: Holder, wanted: &[RoleRef]) -> bool {
    let Some(guild_id) = ctx.guild_id() else {
        return false;
    };
    let Some(held) = member_roles(ctx, holder, guild_id).await else {
        return false;
    };

    let mut unresolved = Vec::new();
    for role in wanted {
        match role {
            RoleRef::Id(id) if held.contains(id) => return true,
            RoleRef::Id(_) => {}
            RoleRef::Name(name) => match ctx.cache().find_role(Some(guild_id), name) {
                Some(cached) if held.contains(&cached.id) => return true,
                Some(_) => {}
                None => unresolved.push(name.to_lowercase()),
            },
        }
    }
    if unresolved.is_empty() {
        return false;
    }

    match ctx.handle().fetch_roles(guild_id).await {
        Ok(roles) => roles
            .iter()
            .any(|r| held.contains(&r.id) && unresolved.contains(&r.name.to_lowercase())),
        Err(e) => {
            debug!(error = %e, "Could not fetch guild roles");
            false
        }
    }
}
