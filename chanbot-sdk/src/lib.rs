//! chanbot-sdk: connection and command dispatch engine for IRC bots.
//!
//! - Line framing and message parsing (`codec`, `irc`)
//! - A self-healing connection with registration, keepalive and backoff (`connection`)
//! - Outbound rate limiting (`ratelimit`)
//! - Token-routed command handlers with bounded concurrency (`dispatch`, `handler`)

pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod flood;
pub mod handler;
pub mod irc;
pub mod ratelimit;
pub mod state;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{Client, ConnectionHandle};
pub use dispatch::{Dispatch, Dispatcher, HandlerRegistration};
pub use error::{Error, Result};
pub use handler::{
    ChannelMessageEvent, CommandHandler, HandlerContext, MatchToken, PrivateMessageEvent,
};
pub use irc::Message;
pub use state::ConnectionState;
