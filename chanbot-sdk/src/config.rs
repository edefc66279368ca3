//! Client configuration.
//!
//! Every section has defaults so a config file only needs to name what it
//! changes. Durations are stored as plain integers (seconds or milliseconds,
//! per the field name) and exposed as [`Duration`] through accessors.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_LINE_LEN;

/// Configuration for connecting to an IRC server and running the bot engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Use TLS. Port 6697 implies TLS regardless.
    pub tls: bool,
    /// Give up on a single connect attempt after this many seconds.
    pub connect_timeout_secs: u64,
    /// Desired nickname.
    pub nick: String,
    /// Username (ident). Defaults to the nickname when empty.
    pub user: String,
    /// Real name.
    pub realname: String,
    /// How many `<nick><n>` fallbacks to try before registration fails.
    pub alt_nick_attempts: u32,
    /// Optional SASL PLAIN credentials.
    pub sasl: Option<SaslConfig>,
    /// Channels to join once registered.
    pub channels: Vec<String>,
    /// Sent with QUIT on shutdown.
    pub quit_message: String,
    /// Maximum line length in bytes, terminator included.
    pub max_line_len: usize,
    /// Bound on queued-but-unsent outbound frames.
    pub outbound_queue_capacity: usize,
    /// When running under a fallback nick, try to get the configured one back this often.
    pub nick_reclaim_secs: u64,
    /// Re-join configured channels we are not in this often.
    pub rejoin_interval_secs: u64,
    pub rate_limit: RateLimitConfig,
    pub reconnect: ReconnectConfig,
    pub keepalive: KeepaliveConfig,
    pub dispatch: DispatchConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6667,
            tls: false,
            connect_timeout_secs: 30,
            nick: "chanbot".to_string(),
            user: String::new(),
            realname: "chanbot".to_string(),
            alt_nick_attempts: 5,
            sasl: None,
            channels: Vec::new(),
            quit_message: concat!("chanbot ", env!("CARGO_PKG_VERSION")).to_string(),
            max_line_len: DEFAULT_MAX_LINE_LEN,
            outbound_queue_capacity: 256,
            nick_reclaim_secs: 5 * 60,
            rejoin_interval_secs: 5 * 60,
            rate_limit: RateLimitConfig::default(),
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl ClientConfig {
    /// `host:port` for the socket layer.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn use_tls(&self) -> bool {
        self.tls || self.port == 6697
    }

    pub fn username(&self) -> &str {
        if self.user.is_empty() { &self.nick } else { &self.user }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn nick_reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.nick_reclaim_secs)
    }

    pub fn rejoin_interval(&self) -> Duration {
        Duration::from_secs(self.rejoin_interval_secs)
    }
}

/// SASL PLAIN credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct SaslConfig {
    pub username: String,
    pub password: String,
}

/// Outbound token bucket: `burst` sends immediately, then one per `interval_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub interval_ms: u64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            burst: 3,
        }
    }
}

impl RateLimitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Delay between connection attempts: doubles from `base_delay_ms` up to `max_delay_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Randomize each delay within its upper half.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Send our own PING after this long without traffic.
    pub ping_interval_secs: u64,
    /// Treat the connection as lost after this long without traffic.
    /// Always at least one second past `ping_interval_secs`, so our PING
    /// gets a chance to be answered.
    pub ping_timeout_secs: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 60,
            ping_timeout_secs: 120,
        }
    }
}

impl KeepaliveConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(
            self.ping_timeout_secs
                .max(self.ping_interval_secs.saturating_add(1)),
        )
    }
}

/// Handler execution limits and inbound flood policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Handler invocations allowed to run at once; the rest wait in FIFO order.
    pub max_concurrent_handlers: usize,
    /// A single invocation is abandoned after this long.
    pub handler_timeout_secs: u64,
    /// How long shutdown waits for in-flight invocations.
    pub shutdown_grace_secs: u64,
    pub flood: FloodConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 8,
            handler_timeout_secs: 30,
            shutdown_grace_secs: 5,
            flood: FloodConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// No more than `max_invocations` per target within `window_secs`,
/// otherwise that target is ignored for `pause_secs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    pub enabled: bool,
    pub max_invocations: usize,
    pub window_secs: u64,
    pub pause_secs: u64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_invocations: 5,
            window_secs: 20,
            pause_secs: 2 * 60,
        }
    }
}

impl FloodConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_timeout_stays_past_the_interval() {
        let keepalive = KeepaliveConfig {
            ping_interval_secs: 1,
            ping_timeout_secs: 1,
        };
        assert_eq!(keepalive.ping_timeout(), Duration::from_secs(2));

        let keepalive = KeepaliveConfig::default();
        assert_eq!(keepalive.ping_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn tls_follows_port() {
        let config = ClientConfig {
            port: 6697,
            ..ClientConfig::default()
        };
        assert!(config.use_tls());
        assert!(!ClientConfig::default().use_tls());
        assert_eq!(config.username(), "chanbot");
    }
}
