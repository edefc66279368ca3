//! The connection engine.
//!
//! [`Client::run`] owns one server session at a time and reconnects with
//! backoff when it is lost. Each session has a read loop (this task) and a
//! writer task. The writer serves two queues: an unbounded control queue
//! for protocol replies (PONG, NICK, JOIN, ...) written immediately, and the
//! bounded user queue behind the rate limiter. Handlers only ever see a
//! [`ConnectionHandle`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::codec::LineCodec;
use crate::config::ClientConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::irc::Message;
use crate::ratelimit::RateLimiter;
use crate::state::ConnectionState;
use crate::transport::{Connector, TcpConnector};

/// How long a finished session waits for its writer to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// SASL payloads are sent in chunks of at most this many bytes.
const SASL_CHUNK: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Privmsg,
    Notice,
    Raw,
}

/// A user send waiting in the outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub kind: FrameKind,
    /// Empty for raw frames.
    pub target: String,
    pub payload: String,
    pub enqueued_at: std::time::Instant,
}

impl OutboundFrame {
    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new(FrameKind::Privmsg, target, text)
    }

    pub fn notice(target: &str, text: &str) -> Self {
        Self::new(FrameKind::Notice, target, text)
    }

    pub fn raw(line: &str) -> Self {
        Self::new(FrameKind::Raw, "", line)
    }

    fn new(kind: FrameKind, target: &str, payload: &str) -> Self {
        Self {
            kind,
            target: target.to_string(),
            payload: payload.to_string(),
            enqueued_at: std::time::Instant::now(),
        }
    }

    /// The protocol line, without terminator.
    pub fn to_line(&self) -> String {
        match self.kind {
            FrameKind::Privmsg => Message::privmsg(&self.target, &self.payload).to_string(),
            FrameKind::Notice => Message::notice(&self.target, &self.payload).to_string(),
            FrameKind::Raw => self.payload.clone(),
        }
    }
}

struct Shared {
    state: watch::Receiver<ConnectionState>,
    nick: RwLock<String>,
    /// Lowercased names of channels we are in.
    channels: RwLock<BTreeSet<String>>,
    /// Present only while the session is `Ready`.
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    shutdown: CancellationToken,
}

/// Cheap, cloneable access to the live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    fn new(state: watch::Receiver<ConnectionState>, nick: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                state,
                nick: RwLock::new(nick.to_string()),
                channels: RwLock::new(BTreeSet::new()),
                outbound: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Wait until the connection reaches `state`. False if the client is gone first.
    pub async fn wait_for(&self, state: ConnectionState) -> bool {
        let mut rx = self.shared.state.clone();
        rx.wait_for(|s| *s == state).await.is_ok()
    }

    /// Queue `PRIVMSG <target> :<text>`.
    pub fn send(&self, target: &str, text: &str) -> Result<()> {
        self.enqueue(OutboundFrame::privmsg(target, text))
    }

    /// Queue `NOTICE <target> :<text>`.
    pub fn notice(&self, target: &str, text: &str) -> Result<()> {
        self.enqueue(OutboundFrame::notice(target, text))
    }

    /// Queue a raw protocol line.
    pub fn send_raw(&self, line: &str) -> Result<()> {
        self.enqueue(OutboundFrame::raw(line))
    }

    fn enqueue(&self, frame: OutboundFrame) -> Result<()> {
        if !self.state().accepts_sends() {
            return Err(Error::NotConnected);
        }
        let outbound = self.shared.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(Error::NotConnected);
        };
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull,
            TrySendError::Closed(_) => Error::NotConnected,
        })
    }

    pub fn nickname(&self) -> String {
        self.shared.nick.read().clone()
    }

    pub fn channels(&self) -> Vec<String> {
        self.shared.channels.read().iter().cloned().collect()
    }

    pub fn is_in_channel(&self, channel: &str) -> bool {
        self.shared
            .channels
            .read()
            .contains(&channel.to_lowercase())
    }

    /// Ask the client to stop. Does not wait.
    ///
    /// In-flight handlers get the dispatcher's grace period and their queued
    /// sends are flushed through the rate limiter before QUIT goes out.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    /// Stop accepting sends. Returns how many frames were still queued.
    fn close_outbound(&self) -> usize {
        match self.shared.outbound.lock().take() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }

    fn set_nickname(&self, nick: &str) {
        *self.shared.nick.write() = nick.to_string();
    }

    /// A `Ready` handle whose queue is the returned receiver.
    #[cfg(test)]
    pub(crate) fn ready_for_test(
        nick: &str,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Ready);
        let handle = Self::new(state_rx, nick);
        let (tx, rx) = mpsc::channel(capacity);
        *handle.shared.outbound.lock() = Some(tx);
        (handle, rx)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .field("nick", &self.nickname())
            .finish_non_exhaustive()
    }
}

/// Owns the configuration and drives sessions until shutdown.
pub struct Client {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    handle: ConnectionHandle,
    state_tx: watch::Sender<ConnectionState>,
}

impl Client {
    /// A client that connects over TCP (TLS when configured).
    pub fn new(config: ClientConfig) -> Self {
        let connector = TcpConnector::new(&config);
        Self::with_connector(config, connector)
    }

    /// A client that gets its streams from `connector`.
    pub fn with_connector(config: ClientConfig, connector: impl Connector) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handle = ConnectionHandle::new(state_rx, &config.nick);
        Self {
            config: Arc::new(config),
            connector: Arc::new(connector),
            handle,
            state_tx,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::info!(from = %*current, to = %state, "Connection state");
            *current = state;
            true
        });
    }

    /// Connect, register and serve until shutdown, reconnecting on failure.
    ///
    /// On explicit shutdown the dispatcher is drained first (bounded by its
    /// grace period) while sends still work, then the outbound queue is
    /// flushed through the rate limiter, and only then QUIT is sent.
    ///
    /// Returns `Ok` after an explicit shutdown and `RegistrationRejected`
    /// when the server refuses every nickname. Either way the final state
    /// is `Disconnected` and the dispatcher has been shut down.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> Result<()> {
        let shutdown = self.handle.shared.shutdown.clone();
        let mut backoff = Backoff::new(&self.config.reconnect);

        let outcome = loop {
            let (end, registered) = self.run_session(&dispatcher).await;
            if registered {
                backoff.reset();
            }

            match end {
                Ok(SessionEnd::Shutdown) => break Ok(()),
                Ok(SessionEnd::Lost(reason)) => {
                    tracing::warn!(reason = %reason, "Connection lost");
                }
                Err(e @ Error::RegistrationRejected { .. }) => {
                    tracing::error!(error = %e, "Giving up on server");
                    break Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "Connection failed, retrying"),
            }

            if shutdown.is_cancelled() {
                break Ok(());
            }

            self.set_state(ConnectionState::Reconnecting);
            let delay = backoff.next_delay();
            tracing::info!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                server = %self.config.server_addr(),
                "Reconnecting"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.set_state(ConnectionState::Disconnected);
        dispatcher.shutdown().await;
        outcome
    }

    /// One connection attempt. The flag reports whether it reached `Ready`.
    async fn run_session(&self, dispatcher: &Dispatcher) -> (Result<SessionEnd>, bool) {
        let shutdown = self.handle.shared.shutdown.clone();
        self.set_state(ConnectionState::Connecting);

        let stream = tokio::select! {
            _ = shutdown.cancelled() => return (Ok(SessionEnd::Shutdown), false),
            result = self.connector.connect() => match result {
                Ok(stream) => stream,
                Err(e) => return (Err(e.into()), false),
            },
        };
        tracing::info!(server = %self.config.server_addr(), "Connected");

        let (reader, writer) = tokio::io::split(stream);
        let max_len = self.config.max_line_len;
        let mut lines = FramedRead::new(reader, LineCodec::with_max_len(max_len));
        let sink = FramedWrite::new(writer, LineCodec::with_max_len(max_len));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::channel(self.config.outbound_queue_capacity.max(1));
        let limiter = Arc::new(RateLimiter::new(&self.config.rate_limit));
        let abort_writer = CancellationToken::new();
        let writer_done = CancellationToken::new();
        let flushed = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            sink,
            control_rx,
            user_rx,
            limiter.clone(),
            WriterSignals {
                abort: abort_writer.clone(),
                done: writer_done.clone(),
                flushed: flushed.clone(),
            },
        ));

        self.set_state(ConnectionState::Registering);
        self.handle.set_nickname(&self.config.nick);

        let mut session = Session::new(self, dispatcher, control_tx, user_tx);
        session.register();
        let end = session.read_loop(&mut lines, &writer_done, &limiter, &flushed).await;
        let registered = session.registered;
        drop(session);

        match &end {
            Ok(SessionEnd::Shutdown) => {}
            Err(Error::RegistrationRejected { .. }) => {
                self.set_state(ConnectionState::Disconnected)
            }
            _ => self.set_state(ConnectionState::Reconnecting),
        }
        self.handle.close_outbound();
        self.handle.shared.channels.write().clear();
        if !matches!(end, Ok(SessionEnd::Shutdown)) {
            abort_writer.cancel();
        }

        match tokio::time::timeout(WRITER_DRAIN, writer).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::debug!(error = %e, "Writer stopped with error"),
            Ok(Err(e)) => tracing::error!(error = %e, "Writer task failed"),
            Err(_) => tracing::warn!("Writer did not drain in time"),
        }

        (end, registered)
    }
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaslPhase {
    Off,
    Requested,
    Authenticating,
    Finished,
}

/// Per-session protocol state, driven by the read loop.
struct Session<'a> {
    client: &'a Client,
    dispatcher: &'a Dispatcher,
    control: mpsc::UnboundedSender<String>,
    /// Handed to the shared handle on 001.
    outbound: Option<mpsc::Sender<OutboundFrame>>,
    registered: bool,
    nick_attempts: u32,
    sasl: SaslPhase,
    reclaim_at: Option<Instant>,
    rejoin_at: Option<Instant>,
}

impl<'a> Session<'a> {
    fn new(
        client: &'a Client,
        dispatcher: &'a Dispatcher,
        control: mpsc::UnboundedSender<String>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        Self {
            client,
            dispatcher,
            control,
            outbound: Some(outbound),
            registered: false,
            nick_attempts: 0,
            sasl: SaslPhase::Off,
            reclaim_at: None,
            rejoin_at: None,
        }
    }

    fn config(&self) -> &ClientConfig {
        &self.client.config
    }

    fn handle(&self) -> &ConnectionHandle {
        &self.client.handle
    }

    fn send_control(&self, message: Message) {
        if let Err(e) = self.control.send(message.to_string()) {
            tracing::debug!(line = %e.0, "Writer gone, control line not sent");
        }
    }

    fn register(&mut self) {
        if self.config().sasl.is_some() {
            self.sasl = SaslPhase::Requested;
            self.send_control(Message::new("CAP", vec!["REQ"], Some("sasl")));
        }
        let config = self.config();
        self.send_control(Message::new("NICK", vec![config.nick.as_str()], None));
        self.send_control(Message::new(
            "USER",
            vec![config.username(), "0", "*"],
            Some(&config.realname),
        ));
    }

    async fn read_loop<R>(
        &mut self,
        lines: &mut FramedRead<R, LineCodec>,
        writer_done: &CancellationToken,
        limiter: &Arc<RateLimiter>,
        flushed: &CancellationToken,
    ) -> Result<SessionEnd>
    where
        R: AsyncRead + Unpin,
    {
        let shutdown = self.handle().shared.shutdown.clone();
        let ping_interval = self.config().keepalive.ping_interval();
        let ping_timeout = self.config().keepalive.ping_timeout();
        let mut last_activity = Instant::now();
        let mut keepalive_at = last_activity + ping_interval;
        let mut awaiting_pong = false;

        loop {
            let maintenance = self.next_maintenance();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.quit(lines, writer_done, limiter, flushed).await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = writer_done.cancelled() => {
                    return Ok(SessionEnd::Lost("write side closed".to_string()));
                }
                item = lines.next() => {
                    let Some(item) = item else {
                        return Ok(SessionEnd::Lost("connection closed by server".to_string()));
                    };
                    last_activity = Instant::now();
                    keepalive_at = last_activity + ping_interval;
                    awaiting_pong = false;
                    match item? {
                        Ok(line) => self.on_line(&line)?,
                        Err(e) if e.is_recoverable_frame_error() => {
                            tracing::warn!(error = %e, "Dropping oversized line");
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = sleep_until(keepalive_at) => {
                    if awaiting_pong {
                        return Ok(SessionEnd::Lost(format!(
                            "no traffic for {}s",
                            last_activity.elapsed().as_secs()
                        )));
                    }
                    self.send_control(Message::new("PING", vec![], Some("keepalive")));
                    awaiting_pong = true;
                    keepalive_at = last_activity + ping_timeout;
                }
                _ = sleep_until(maintenance.unwrap_or_else(Instant::now)), if maintenance.is_some() => {
                    self.maintain();
                }
            }
        }
    }

    /// Finish handlers and flush their sends, then QUIT. The server is
    /// still answered meanwhile.
    async fn quit<R>(
        &mut self,
        lines: &mut FramedRead<R, LineCodec>,
        writer_done: &CancellationToken,
        limiter: &Arc<RateLimiter>,
        flushed: &CancellationToken,
    ) where
        R: AsyncRead + Unpin,
    {
        self.outbound.take();
        let dispatcher = self.dispatcher;
        let handle = self.handle().clone();
        let limiter = limiter.clone();
        let flushed = flushed.clone();
        let drain = async move {
            dispatcher.shutdown().await;
            let queued = handle.close_outbound();
            let bound = limiter.max_latency(queued + 1) + WRITER_DRAIN;
            if tokio::time::timeout(bound, flushed.cancelled()).await.is_err() {
                tracing::warn!(queued, "Outbound queue not flushed before QUIT");
            }
        };
        tokio::pin!(drain);

        loop {
            tokio::select! {
                _ = &mut drain => break,
                _ = writer_done.cancelled() => return,
                item = lines.next() => match item {
                    Some(Ok(Ok(line))) => {
                        if let Err(e) = self.on_line(&line) {
                            tracing::debug!(error = %e, "Ignoring server reply while quitting");
                        }
                    }
                    Some(Ok(Err(e))) => tracing::debug!(error = %e, "Dropping line while quitting"),
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Read failed while quitting");
                        return;
                    }
                    None => return,
                },
            }
        }

        let quit = Message::new("QUIT", vec![], Some(&self.config().quit_message));
        self.send_control(quit);
    }

    fn on_line(&mut self, line: &str) -> Result<()> {
        tracing::trace!("<< {line}");
        match Message::parse(line) {
            Ok(message) => self.on_message(message),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed line");
                Ok(())
            }
        }
    }

    fn on_message(&mut self, message: Message) -> Result<()> {
        let command = message.command.clone();
        match command.as_str() {
            "PING" => {
                let mut pong = message;
                pong.command = "PONG".to_string();
                pong.prefix = None;
                pong.tags.clear();
                self.send_control(pong);
            }
            "PONG" => {}
            "001" => self.on_welcome(&message),
            "432" | "433" | "436" => self.on_nick_rejected(&message)?,
            "CAP" => self.on_cap(&message),
            "AUTHENTICATE" => self.on_authenticate(&message),
            "900" | "903" => {
                tracing::info!(code = %message.command, "SASL authentication succeeded");
                self.finish_cap();
            }
            "902" | "904" | "905" | "906" | "907" | "908" => {
                tracing::warn!(
                    code = %message.command,
                    reason = ?message.last_arg(),
                    "SASL authentication failed, continuing without"
                );
                self.finish_cap();
            }
            "NICK" => self.on_nick(&message),
            "JOIN" => self.on_join(&message),
            "PART" => self.on_part(&message),
            "KICK" => self.on_kick(&message),
            "353" => self.on_names(&message),
            "ERROR" => {
                tracing::warn!(reason = ?message.last_arg(), "Server error");
            }
            _ if self.registered => {
                let outcome = self.dispatcher.on_message(message);
                tracing::trace!(?outcome, "Dispatched");
            }
            _ => {}
        }
        Ok(())
    }

    fn is_me(&self, nick: &str) -> bool {
        nick.eq_ignore_ascii_case(&self.handle().nickname())
    }

    fn from_me(&self, message: &Message) -> bool {
        message.source_nick().is_some_and(|n| self.is_me(n))
    }

    fn on_welcome(&mut self, message: &Message) {
        if self.registered {
            return;
        }
        self.registered = true;
        if let Some(nick) = message.arg(0) {
            self.handle().set_nickname(nick);
        }
        *self.handle().shared.outbound.lock() = self.outbound.take();
        self.client.set_state(ConnectionState::Ready);
        tracing::info!(nick = %self.handle().nickname(), "Registered");

        for channel in &self.config().channels {
            self.send_control(Message::new("JOIN", vec![channel.as_str()], None));
        }

        let now = Instant::now();
        let reclaim = self.config().nick_reclaim_interval();
        if !self.is_me(&self.config().nick) && !reclaim.is_zero() {
            self.reclaim_at = Some(now + reclaim);
        }
        let rejoin = self.config().rejoin_interval();
        if !rejoin.is_zero() && !self.config().channels.is_empty() {
            self.rejoin_at = Some(now + rejoin);
        }
    }

    fn on_nick_rejected(&mut self, message: &Message) -> Result<()> {
        let reason = message
            .last_arg()
            .unwrap_or("nickname unavailable")
            .to_string();

        if self.registered {
            tracing::debug!(reason = %reason, "Nick reclaim refused");
            return Ok(());
        }

        self.nick_attempts += 1;
        if self.nick_attempts > self.config().alt_nick_attempts {
            return Err(Error::RegistrationRejected { reason });
        }
        let alt = format!("{}{}", self.config().nick, self.nick_attempts);
        tracing::info!(nick = %alt, reason = %reason, "Nickname refused, trying alternative");
        self.handle().set_nickname(&alt);
        self.send_control(Message::new("NICK", vec![alt.as_str()], None));
        Ok(())
    }

    fn on_cap(&mut self, message: &Message) {
        let subcommand = message.arg(1).map(|s| s.to_ascii_uppercase());
        let caps = message.last_arg().unwrap_or("");
        match subcommand.as_deref() {
            Some("ACK") if self.sasl == SaslPhase::Requested => {
                if caps.split_whitespace().any(|c| c.eq_ignore_ascii_case("sasl")) {
                    self.sasl = SaslPhase::Authenticating;
                    self.send_control(Message::new("AUTHENTICATE", vec!["PLAIN"], None));
                } else {
                    self.finish_cap();
                }
            }
            Some("NAK") => {
                tracing::warn!(caps = %caps, "Capabilities refused");
                self.finish_cap();
            }
            _ => {}
        }
    }

    fn on_authenticate(&mut self, message: &Message) {
        if self.sasl != SaslPhase::Authenticating || message.arg(0) != Some("+") {
            return;
        }
        let Some(sasl) = self.config().sasl.as_ref() else {
            return;
        };
        for chunk in sasl_plain_payload(&sasl.username, &sasl.password) {
            self.send_control(Message::new("AUTHENTICATE", vec![chunk.as_str()], None));
        }
    }

    fn finish_cap(&mut self) {
        if matches!(self.sasl, SaslPhase::Off | SaslPhase::Finished) {
            return;
        }
        self.sasl = SaslPhase::Finished;
        self.send_control(Message::new("CAP", vec!["END"], None));
    }

    fn on_nick(&mut self, message: &Message) {
        if !self.from_me(message) {
            return;
        }
        let Some(new_nick) = message.arg(0) else {
            return;
        };
        tracing::info!(nick = %new_nick, "Nickname changed");
        self.handle().set_nickname(new_nick);
        if new_nick.eq_ignore_ascii_case(&self.config().nick) {
            self.reclaim_at = None;
        }
    }

    fn on_join(&mut self, message: &Message) {
        let (true, Some(channel)) = (self.from_me(message), message.arg(0)) else {
            return;
        };
        tracing::info!(channel = %channel, "Joined");
        self.handle()
            .shared
            .channels
            .write()
            .insert(channel.to_lowercase());
    }

    fn on_part(&mut self, message: &Message) {
        let Some(channel) = message.arg(0) else {
            return;
        };
        if self.from_me(message) {
            tracing::info!(channel = %channel, "Left");
            self.handle()
                .shared
                .channels
                .write()
                .remove(&channel.to_lowercase());
        } else {
            // Someone left; see whether we are alone and can regain op.
            self.send_control(Message::new("NAMES", vec![channel], None));
        }
    }

    fn on_kick(&mut self, message: &Message) {
        let (Some(channel), Some(victim)) = (message.arg(0), message.arg(1)) else {
            return;
        };
        if self.is_me(victim) {
            tracing::warn!(channel = %channel, by = ?message.source_nick(), "Kicked");
            self.handle()
                .shared
                .channels
                .write()
                .remove(&channel.to_lowercase());
        }
    }

    /// `353 <me> <type> <channel> :<names>`
    fn on_names(&mut self, message: &Message) {
        let (Some(channel), Some(names)) = (message.arg(2), message.last_arg()) else {
            return;
        };
        let names: Vec<&str> = names.split_whitespace().collect();
        if names.len() == 1 && self.is_me(names[0]) {
            tracing::info!(channel = %channel, "Alone without op, cycling channel");
            self.send_control(Message::new("PART", vec![channel], None));
            self.send_control(Message::new("JOIN", vec![channel], None));
        }
    }

    fn next_maintenance(&self) -> Option<Instant> {
        match (self.reclaim_at, self.rejoin_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn maintain(&mut self) {
        let now = Instant::now();

        if self.reclaim_at.is_some_and(|at| at <= now) {
            let nick = self.config().nick.clone();
            tracing::debug!(nick = %nick, "Trying to reclaim nickname");
            self.send_control(Message::new("NICK", vec![nick.as_str()], None));
            self.reclaim_at = Some(now + self.config().nick_reclaim_interval());
        }

        if self.rejoin_at.is_some_and(|at| at <= now) {
            for channel in &self.config().channels {
                if !self.handle().is_in_channel(channel) {
                    tracing::info!(channel = %channel, "Rejoining");
                    self.send_control(Message::new("JOIN", vec![channel.as_str()], None));
                }
            }
            self.rejoin_at = Some(now + self.config().rejoin_interval());
        }
    }
}

/// `AUTHENTICATE` arguments carrying a PLAIN response.
fn sasl_plain_payload(username: &str, password: &str) -> Vec<String> {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("\0{username}\0{password}"));
    let mut chunks: Vec<String> = encoded
        .as_bytes()
        .chunks(SASL_CHUNK)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    if encoded.len() % SASL_CHUNK == 0 {
        chunks.push("+".to_string());
    }
    chunks
}

struct WriterSignals {
    /// Stop now, dropping whatever is queued.
    abort: CancellationToken,
    /// Cancelled by the writer when it exits.
    done: CancellationToken,
    /// Cancelled by the writer once the user queue is closed and empty.
    flushed: CancellationToken,
}

/// Serve the control queue immediately and user frames as the limiter allows.
async fn write_loop<W>(
    mut sink: FramedWrite<W, LineCodec>,
    mut control: mpsc::UnboundedReceiver<String>,
    mut user: mpsc::Receiver<OutboundFrame>,
    limiter: Arc<RateLimiter>,
    signals: WriterSignals,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let WriterSignals {
        abort,
        done,
        flushed,
    } = signals;
    let _done = done.drop_guard();
    let mut pending: Option<OutboundFrame> = None;
    let mut user_open = true;

    let result = loop {
        if !user_open && pending.is_none() {
            flushed.cancel();
        }
        tokio::select! {
            biased;
            _ = abort.cancelled() => break Ok(()),
            line = control.recv() => match line {
                Some(line) => {
                    tracing::trace!(">> {line}");
                    if let Err(e) = sink.send(line).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            _ = limiter.until_ready(), if pending.is_some() => {
                if let Some(frame) = pending.take() {
                    let line = frame.to_line();
                    tracing::trace!(
                        queued_ms = frame.enqueued_at.elapsed().as_millis() as u64,
                        ">> {line}"
                    );
                    if let Err(e) = sink.send(line).await {
                        break Err(e);
                    }
                }
            }
            frame = user.recv(), if pending.is_none() && user_open => match frame {
                Some(frame) => pending = Some(frame),
                None => user_open = false,
            },
        }
    };

    let mut discarded = usize::from(pending.is_some());
    user.close();
    while user.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        tracing::warn!(discarded, "Dropping unsent outbound frames");
    }
    if result.is_ok() {
        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "Closing the connection failed");
        }
    }
    result
}
