//! chanbot: an IRC channel bot built on chanbot-sdk.
//!
//! - Bot configuration (`config`): a TOML file plus CLI overrides
//! - Built-in command handlers (`handlers`)

pub mod config;
pub mod handlers;
