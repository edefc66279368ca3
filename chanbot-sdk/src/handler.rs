//! The command handler contract.
//!
//! A handler is matched by the first whitespace-delimited token of a
//! message (`!frc`, `hello`, ...) or registered as the wildcard that sees
//! every otherwise unmatched message. Each invocation gets a
//! [`HandlerContext`]: handlers talk to the server through it and never see
//! the socket.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::ConnectionHandle;
use crate::error::Result;
use crate::irc::Message;

/// What a handler answers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MatchToken {
    /// First word of the text, compared ASCII case-insensitively.
    Token(String),
    /// Every message no token handler claimed.
    All,
}

impl MatchToken {
    pub fn token(token: &str) -> Self {
        MatchToken::Token(token.to_ascii_lowercase())
    }
}

impl fmt::Display for MatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchToken::Token(token) => f.write_str(token),
            MatchToken::All => f.write_str("*"),
        }
    }
}

/// A PRIVMSG/NOTICE addressed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessageEvent {
    pub channel: String,
    pub from_nickname: String,
    pub text: String,
    /// `text` split on whitespace.
    pub text_tokens: Vec<String>,
}

impl ChannelMessageEvent {
    pub fn new(channel: &str, from_nickname: &str, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            from_nickname: from_nickname.to_string(),
            text: text.to_string(),
            text_tokens: tokenize(text),
        }
    }
}

/// A PRIVMSG/NOTICE addressed to us directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessageEvent {
    pub from_nickname: String,
    pub text: String,
    pub text_tokens: Vec<String>,
}

impl PrivateMessageEvent {
    pub fn new(from_nickname: &str, text: &str) -> Self {
        Self {
            from_nickname: from_nickname.to_string(),
            text: text.to_string(),
            text_tokens: tokenize(text),
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(|s| s.to_string()).collect()
}

/// A pluggable unit of bot behaviour.
///
/// Invoked at most once per matching message, on its own task. Errors and
/// panics are caught and logged by the dispatcher.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Identity used in logs and for scratch-state scoping.
    fn name(&self) -> &str;

    fn match_token(&self) -> MatchToken;

    async fn on_channel_message(
        &self,
        ctx: &HandlerContext,
        event: &ChannelMessageEvent,
        message: &Message,
    ) -> anyhow::Result<()>;

    /// Messages sent to the bot's nick. Ignored unless overridden.
    async fn on_private_message(
        &self,
        _ctx: &HandlerContext,
        _event: &PrivateMessageEvent,
        _message: &Message,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Key/value scratch space kept per (handler, channel-or-private).
#[derive(Debug, Clone, Default)]
pub struct HandlerStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl HandlerStore {
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: impl Into<String>) -> Option<String> {
        self.values.lock().insert(key.to_string(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.lock().remove(key)
    }
}

/// Capabilities handed to one handler invocation.
#[derive(Clone)]
pub struct HandlerContext {
    connection: ConnectionHandle,
    handler: Arc<str>,
    /// `None` for private messages.
    channel: Option<String>,
    store: HandlerStore,
}

impl HandlerContext {
    pub(crate) fn new(
        connection: ConnectionHandle,
        handler: Arc<str>,
        channel: Option<String>,
        store: HandlerStore,
    ) -> Self {
        Self {
            connection,
            handler,
            channel,
            store,
        }
    }

    /// Queue a PRIVMSG. Fails with `NotConnected` or `QueueFull`.
    pub fn send(&self, target: &str, text: &str) -> Result<()> {
        self.connection.send(target, text)
    }

    /// Queue a NOTICE.
    pub fn notice(&self, target: &str, text: &str) -> Result<()> {
        self.connection.notice(target, text)
    }

    /// Queue a raw protocol line (rate limited like any other send).
    pub fn send_raw(&self, line: &str) -> Result<()> {
        self.connection.send_raw(line)
    }

    /// Our current nickname.
    pub fn nickname(&self) -> String {
        self.connection.nickname()
    }

    /// Channels we are currently in.
    pub fn channels(&self) -> Vec<String> {
        self.connection.channels()
    }

    /// Channel of the message being handled, `None` for private messages.
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    pub fn store(&self) -> &HandlerStore {
        &self.store
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("handler", &self.handler)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tokens_split_on_whitespace() {
        let event = ChannelMessageEvent::new("#test", "alice", "!frc  2024\tnow");
        assert_eq!(event.text_tokens, vec!["!frc", "2024", "now"]);
    }

    #[test]
    fn token_match_ignores_case() {
        let token = MatchToken::token("!FRC");
        assert_eq!(token, MatchToken::token("!frc"));
        assert_eq!(token, MatchToken::token("!Frc"));
        assert_ne!(token, MatchToken::token("!frcx"));
        assert_eq!(token.to_string(), "!frc");
    }

    #[test]
    fn store_is_shared_between_clones() {
        let store = HandlerStore::default();
        let other = store.clone();
        store.set("last", "42");
        assert_eq!(other.get("last").as_deref(), Some("42"));
        assert_eq!(other.remove("last").as_deref(), Some("42"));
        assert!(store.get("last").is_none());
    }
}
