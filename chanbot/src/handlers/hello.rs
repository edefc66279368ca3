//! Answers a private "hello".

use async_trait::async_trait;
use chanbot_sdk::{
    ChannelMessageEvent, CommandHandler, HandlerContext, HandlerRegistration, MatchToken, Message,
    PrivateMessageEvent,
};

pub const NAME: &str = "hello";

pub const GREETING: &str = "Well hello to you too, sir!";

pub struct Hello;

pub fn registration() -> HandlerRegistration {
    HandlerRegistration::new(Hello)
        .channel_messages(false)
        .private_messages(true)
}

#[async_trait]
impl CommandHandler for Hello {
    fn name(&self) -> &str {
        NAME
    }

    fn match_token(&self) -> MatchToken {
        MatchToken::token("hello")
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
        ctx.send(&event.from_nickname, GREETING)?;
        Ok(())
    }
}
