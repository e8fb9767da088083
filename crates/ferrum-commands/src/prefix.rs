//! Command prefixes.

use std::fmt;
use std::sync::Arc;

use ferrum_core::{ClientHandle, Message};

type PrefixFn = Arc<dyn Fn(&ClientHandle, &Message) -> Vec<String> + Send + Sync>;

/// How a message must start to be treated as a command.
///
/// Candidates are tried in order and the first one the content starts with
/// wins, so list longer prefixes before their own prefixes (`"!!"` before
/// `"!"`).
#[derive(Clone)]
pub enum Prefix {
    Literal(String),
    List(Vec<String>),
    /// `<@id> ` or `<@!id> ` for the logged-in user.
    Mention,
    /// A mention, then the given literals.
    MentionOr(Vec<String>),
    /// Computed per message.
    Dynamic(PrefixFn),
}

impl Prefix {
    pub fn literal(prefix: impl Into<String>) -> Self {
        Self::Literal(prefix.into())
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&ClientHandle, &Message) -> Vec<String> + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// Candidate prefixes for `message`, in match order.
    pub fn candidates(&self, handle: &ClientHandle, message: &Message) -> Vec<String> {
        match self {
            Self::Literal(prefix) => vec![prefix.clone()],
            Self::List(prefixes) => prefixes.clone(),
            Self::Mention => mention_prefixes(handle),
            Self::MentionOr(rest) => {
                let mut all = mention_prefixes(handle);
                all.extend(rest.iter().cloned());
                all
            }
            Self::Dynamic(f) => f(handle, message),
        }
    }

    /// Splits `message.content` into the matched prefix and the remainder.
    /// Empty candidates never match.
    pub fn strip<'m>(&self, handle: &ClientHandle, message: &'m Message) -> Option<(String, &'m str)> {
        self.candidates(handle, message)
            .into_iter()
            .filter(|p| !p.is_empty())
            .find_map(|p| {
                let rest = message.content.strip_prefix(p.as_str())?;
                Some((p, rest))
            })
    }
}

impl From<&str> for Prefix {
    fn from(prefix: &str) -> Self {
        Self::literal(prefix)
    }
}

impl From<String> for Prefix {
    fn from(prefix: String) -> Self {
        Self::Literal(prefix)
    }
}

impl From<Vec<String>> for Prefix {
    fn from(prefixes: Vec<String>) -> Self {
        Self::List(prefixes)
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(p) => f.debug_tuple("Literal").field(p).finish(),
            Self::List(p) => f.debug_tuple("List").field(p).finish(),
            Self::Mention => f.write_str("Mention"),
            Self::MentionOr(p) => f.debug_tuple("MentionOr").field(p).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Matches a mention of the logged-in user.
pub fn when_mentioned() -> Prefix {
    Prefix::Mention
}

/// Matches a mention of the logged-in user or any of `prefixes`.
pub fn when_mentioned_or<I, S>(prefixes: I) -> Prefix
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Prefix::MentionOr(prefixes.into_iter().map(Into::into).collect())
}

fn mention_prefixes(handle: &ClientHandle) -> Vec<String> {
    match handle.cache().current_user() {
        Some(me) => vec![format!("<@{}> ", me.id), format!("<@!{}> ", me.id)],
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, message};
    use ferrum_core::Envelope;
    use serde_json::json;

    #[test]
    fn test_literal_and_list() {
        let fx = fixture();
        let msg = message("!ping");
        assert_eq!(
            Prefix::from("!").strip(&fx.handle, &msg),
            Some(("!".to_string(), "ping"))
        );
        assert_eq!(Prefix::from("?").strip(&fx.handle, &message("ping")), None);

        let list = Prefix::from(vec!["!!".to_string(), "!".to_string()]);
        assert_eq!(
            list.strip(&fx.handle, &message("!!ping")),
            Some(("!!".to_string(), "ping"))
        );
        assert_eq!(Prefix::from("").strip(&fx.handle, &msg), None);
    }

    #[test]
    fn test_when_mentioned() {
        let fx = fixture();
        assert!(when_mentioned().strip(&fx.handle, &message("<@5> ping")).is_none());

        fx.handle.cache().apply(&Envelope::new(
            "READY",
            json!({"user": {"id": "5", "username": "bot", "bot": true}}),
        ));
        let prefix = when_mentioned_or(["$"]);
        assert_eq!(
            prefix.strip(&fx.handle, &message("<@!5> ping")),
            Some(("<@!5> ".to_string(), "ping"))
        );
        assert_eq!(
            prefix.strip(&fx.handle, &message("$ping")),
            Some(("$".to_string(), "ping"))
        );
    }

    #[test]
    fn test_dynamic_prefix() {
        let fx = fixture();
        let prefix = Prefix::dynamic(|_, msg| {
            if msg.is_private() {
                vec![String::new(), "!".into()]
            } else {
                vec!["!".into()]
            }
        });
        assert_eq!(
            prefix.strip(&fx.handle, &message("!help")).map(|(p, _)| p),
            Some("!".to_string())
        );
    }
}
