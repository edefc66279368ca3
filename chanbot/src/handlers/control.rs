//! Remote control over private messages: `!control <password> <raw line>`.
//!
//! A matching password sends the rest of the text to the server verbatim.
//! Anything else is ignored without a reply.

use async_trait::async_trait;
use chanbot_sdk::{
    ChannelMessageEvent, CommandHandler, HandlerContext, HandlerRegistration, MatchToken, Message,
    PrivateMessageEvent,
};

pub const NAME: &str = "control";

const TOKEN: &str = "!control";

pub struct Control {
    password: String,
}

impl Control {
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
        }
    }

    /// The raw line to send, when the password checks out.
    pub fn command<'a>(&self, text: &'a str) -> Option<&'a str> {
        let text = text.trim_start();
        if !text.get(..TOKEN.len())?.eq_ignore_ascii_case(TOKEN) {
            return None;
        }
        let rest = text[TOKEN.len()..]
            .strip_prefix(char::is_whitespace)?
            .trim_start();
        let (password, line) = rest.split_once(char::is_whitespace)?;
        if password != self.password {
            return None;
        }
        let line = line.trim();
        (!line.is_empty()).then_some(line)
    }
}

pub fn registration(password: &str) -> HandlerRegistration {
    HandlerRegistration::new(Control::new(password))
        .channel_messages(false)
        .private_messages(true)
}

#[async_trait]
impl CommandHandler for Control {
    fn name(&self) -> &str {
        NAME
    }

    fn match_token(&self) -> MatchToken {
        MatchToken::token(TOKEN)
    }

    async fn on_channel_message(
        &self,
        _ctx: &HandlerContext,
        _event: &ChannelMessageEvent,
        _message: &Message,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_private_message(
        &self,
        ctx: &HandlerContext,
        event: &PrivateMessageEvent,
        _message: &Message,
    ) -> anyhow::Result<()> {
        let Some(line) = self.command(&event.text) else {
            tracing::warn!(from = %event.from_nickname, "Rejected control command");
            return Ok(());
        };
        tracing::info!(from = %event.from_nickname, line = %line, "Control command");
        ctx.send_raw(line)?;
        Ok(())
    }
}
