//! Minimal bot: `!echo <text>` repeats text, `!ping` answers pong.
//!
//! Usage:
//!   cargo run --example echo_bot -- --host irc.libera.chat --port 6697 \
//!     --nick echobot --channel "#bots"

use std::sync::Arc;

use async_trait::async_trait;
use chanbot_sdk::{
    ChannelMessageEvent, Client, ClientConfig, CommandHandler, Dispatcher, HandlerContext,
    MatchToken, Message,
};
use clap::Parser;

#[derive(Parser)]
#[command(name = "echo-bot", about = "chanbot-sdk echo bot example")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 6667)]
    port: u16,
    #[arg(long, default_value = "echobot")]
    nick: String,
    #[arg(long, default_value = "#bots")]
    channel: String,
}

struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn match_token(&self) -> MatchToken {
        MatchToken::token("!echo")
    }

    async fn on_channel_message(
        &self,
        ctx: &HandlerContext,
        event: &ChannelMessageEvent,
        _message: &Message,
    ) -> anyhow::Result<()> {
        let text = event.text_tokens[1..].join(" ");
        if text.is_empty() {
            ctx.send(&event.channel, "Usage: !echo <message>")?;
        } else {
            ctx.send(&event.channel, &text)?;
        }
        Ok(())
    }
}

struct Ping;

#[async_trait]
impl CommandHandler for Ping {
    fn name(&self) -> &str {
        "ping"
    }

    fn match_token(&self) -> MatchToken {
        MatchToken::token("!ping")
    }

    async fn on_channel_message(
        &self,
        ctx: &HandlerContext,
        event: &ChannelMessageEvent,
        _message: &Message,
    ) -> anyhow::Result<()> {
        ctx.send(&event.channel, &format!("{}: pong", event.from_nickname))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = ClientConfig {
        host: args.host,
        port: args.port,
        nick: args.nick,
        channels: vec![args.channel],
        ..ClientConfig::default()
    };

    let client = Client::new(config.clone());
    let handle = client.handle();
    let dispatcher = Dispatcher::new(handle.clone(), config.dispatch.clone());
    dispatcher.register(Echo);
    dispatcher.register(Ping);

    let stop = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.shutdown();
        }
    });

    client.run(Arc::clone(&dispatcher)).await?;
    Ok(())
}
