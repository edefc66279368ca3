//! Bot configuration.
//!
//! Loaded from a TOML file given with `--config`; every field has a default
//! so an empty file (or no file) is valid. Command-line flags override the
//! connection settings afterwards.
//!
//! ```toml
//! admin_password = "s3cret"
//!
//! [client]
//! host = "irc.libera.chat"
//! port = 6697
//! nick = "chanbot"
//! channels = ["#chanbot"]
//!
//! [[handlers]]
//! name = "hello"
//! enabled = true
//! ```

use std::path::Path;

use anyhow::Context;
use chanbot_sdk::ClientConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub client: ClientConfig,
    /// Password for the `!control` handler; the handler stays off without one.
    pub admin_password: Option<String>,
    pub handlers: Vec<HandlerToggle>,
}

/// Per-handler switches.
#[derive(Debug, Clone, Deserialize)]
pub struct HandlerToggle {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Channels the handler answers in; empty means all.
    #[serde(default)]
    pub channels: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl BotConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("can't read {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("bad config file {}", path.display()))?;
        Ok(config)
    }

    /// The toggle for `name`, if the file mentions it.
    pub fn handler(&self, name: &str) -> Option<&HandlerToggle> {
        self.handlers.iter().rev().find(|h| h.name == name)
    }

    /// Handlers are on unless switched off.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.handler(name).is_none_or(|h| h.enabled)
    }

    /// Channel restriction for `name`; `None` when unrestricted.
    pub fn channels_for(&self, name: &str) -> Option<&[String]> {
        self.handler(name)
            .map(|h| h.channels.as_slice())
            .filter(|c| !c.is_empty())
    }
}
