//! Routing of chat messages to command handlers.
//!
//! The read loop hands every non-housekeeping message to
//! [`Dispatcher::on_message`], which classifies it synchronously and queues
//! at most one handler invocation. A single worker drains that queue in
//! arrival order, waits for a slot under the concurrency cap (tokio's
//! semaphore is FIFO) and runs each invocation on its own task with a
//! timeout. Handler errors, timeouts and panics are logged and contained.

use std::collections::HashMap;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::DispatchConfig;
use crate::connection::ConnectionHandle;
use crate::flood::{FloodGuard, FloodVerdict};
use crate::handler::{
    ChannelMessageEvent, CommandHandler, HandlerContext, HandlerStore, MatchToken,
    PrivateMessageEvent,
};
use crate::irc::{Message, is_channel_name};

/// Commands the connection consumes itself; never routed to handlers.
pub fn is_housekeeping(command: &str) -> bool {
    matches!(
        command,
        "PING"
            | "PONG"
            | "CAP"
            | "AUTHENTICATE"
            | "ERROR"
            | "NICK"
            | "JOIN"
            | "PART"
            | "KICK"
            | "001"
            | "353"
            | "432"
            | "433"
            | "436"
            | "900"
            | "902"
            | "903"
            | "904"
            | "905"
            | "906"
            | "907"
            | "908"
    )
}

/// A handler plus where it applies.
pub struct HandlerRegistration {
    pub match_token: MatchToken,
    pub handler: Arc<dyn CommandHandler>,
    /// Lowercased channel allow-list; `None` means every channel.
    channels: Option<HashSet<String>>,
    channel_messages: bool,
    private_messages: bool,
}

impl HandlerRegistration {
    /// Channel messages in every channel, no private messages.
    pub fn new(handler: impl CommandHandler) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    pub fn from_arc(handler: Arc<dyn CommandHandler>) -> Self {
        Self {
            match_token: handler.match_token(),
            handler,
            channels: None,
            channel_messages: true,
            private_messages: false,
        }
    }

    /// Restrict to the given channels.
    pub fn in_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.channels = Some(
            channels
                .into_iter()
                .map(|c| c.as_ref().to_lowercase())
                .collect(),
        );
        self
    }

    pub fn channel_messages(mut self, enabled: bool) -> Self {
        self.channel_messages = enabled;
        self
    }

    pub fn private_messages(mut self, enabled: bool) -> Self {
        self.private_messages = enabled;
        self
    }

    fn applies_to_channel(&self, channel: &str) -> bool {
        self.channel_messages
            && self
                .channels
                .as_ref()
                .is_none_or(|allowed| allowed.contains(&channel.to_lowercase()))
    }
}

struct Entry {
    registration: HandlerRegistration,
    name: Arc<str>,
    /// Scratch state per channel (`None` key for private messages).
    stores: Mutex<HashMap<Option<String>, HandlerStore>>,
}

impl Entry {
    fn store_for(&self, channel: Option<&str>) -> HandlerStore {
        self.stores
            .lock()
            .entry(channel.map(|c| c.to_lowercase()))
            .or_default()
            .clone()
    }
}

enum Payload {
    Channel(ChannelMessageEvent),
    Private(PrivateMessageEvent),
}

struct Invocation {
    entry: Arc<Entry>,
    payload: Payload,
    message: Message,
    ctx: HandlerContext,
}

/// What [`Dispatcher::on_message`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Protocol traffic owned by the connection.
    Housekeeping,
    /// Not chat text (or our own / a server's).
    Ignored,
    /// Chat text no handler claimed.
    Unmatched,
    /// Dropped by the inbound flood guard.
    Throttled,
    /// An invocation of the named handler was queued.
    Queued { handler: String },
    /// The dispatcher is shutting down.
    Closed,
}

pub struct Dispatcher {
    connection: ConnectionHandle,
    config: DispatchConfig,
    registry: RwLock<HashMap<MatchToken, Arc<Entry>>>,
    flood: FloodGuard,
    jobs: Mutex<Option<mpsc::UnboundedSender<Invocation>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher and start its worker. Must be called inside a tokio runtime.
    pub fn new(connection: ConnectionHandle, config: DispatchConfig) -> Arc<Self> {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            jobs_rx,
            config.max_concurrent_handlers.max(1),
            config.handler_timeout(),
        ));
        Arc::new(Self {
            connection,
            flood: FloodGuard::new(config.flood.clone()),
            config,
            registry: RwLock::new(HashMap::new()),
            jobs: Mutex::new(Some(jobs_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Add a handler. A registration for an existing token replaces it.
    pub fn register_handler(&self, registration: HandlerRegistration) {
        let token = registration.match_token.clone();
        let name: Arc<str> = Arc::from(registration.handler.name());
        let entry = Arc::new(Entry {
            registration,
            name: name.clone(),
            stores: Mutex::new(HashMap::new()),
        });
        if let Some(previous) = self.registry.write().insert(token.clone(), entry) {
            tracing::debug!(
                token = %token,
                replaced = %previous.name,
                handler = %name,
                "Handler registration replaced"
            );
        } else {
            tracing::debug!(token = %token, handler = %name, "Handler registered");
        }
    }

    /// Convenience for `register_handler(HandlerRegistration::new(handler))`.
    pub fn register(&self, handler: impl CommandHandler) {
        self.register_handler(HandlerRegistration::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Classify one message and queue the matching handler, if any. Never blocks.
    pub fn on_message(&self, message: Message) -> Dispatch {
        if is_housekeeping(&message.command) {
            return Dispatch::Housekeeping;
        }
        if message.command != "PRIVMSG" && message.command != "NOTICE" {
            return Dispatch::Ignored;
        }
        if !message.from_user() {
            return Dispatch::Ignored;
        }
        let (Some(target), Some(text), Some(from)) =
            (message.arg(0), message.arg(1), message.source_nick())
        else {
            return Dispatch::Ignored;
        };
        if from.eq_ignore_ascii_case(&self.connection.nickname()) {
            return Dispatch::Ignored;
        }

        let first_word = text.split_whitespace().next().unwrap_or("").to_string();
        let from = from.to_string();

        if is_channel_name(target) {
            let channel = target.to_string();
            let Some(entry) = self.lookup(&first_word, |r| r.applies_to_channel(&channel)) else {
                return Dispatch::Unmatched;
            };
            let event = ChannelMessageEvent::new(&channel, &from, text);
            self.enqueue(entry, Some(channel), Payload::Channel(event), message)
        } else if target.eq_ignore_ascii_case(&self.connection.nickname()) {
            let Some(entry) = self.lookup(&first_word, |r| r.private_messages) else {
                return Dispatch::Unmatched;
            };
            let event = PrivateMessageEvent::new(&from, text);
            self.enqueue(entry, None, Payload::Private(event), message)
        } else {
            Dispatch::Ignored
        }
    }

    /// Token handler first, then the wildcard.
    fn lookup(
        &self,
        first_word: &str,
        applies: impl Fn(&HandlerRegistration) -> bool,
    ) -> Option<Arc<Entry>> {
        let registry = self.registry.read();
        let by_token = registry
            .get(&MatchToken::token(first_word))
            .filter(|e| applies(&e.registration));
        by_token
            .or_else(|| {
                registry
                    .get(&MatchToken::All)
                    .filter(|e| applies(&e.registration))
            })
            .cloned()
    }

    fn enqueue(
        &self,
        entry: Arc<Entry>,
        channel: Option<String>,
        payload: Payload,
        message: Message,
    ) -> Dispatch {
        let flood_key = match (&channel, &payload) {
            (Some(channel), _) => channel.to_lowercase(),
            (None, Payload::Private(event)) => event.from_nickname.to_lowercase(),
            (None, Payload::Channel(event)) => event.channel.to_lowercase(),
        };
        if let FloodVerdict::Throttled { warn } = self.flood.check(&flood_key, Instant::now()) {
            tracing::debug!(key = %flood_key, handler = %entry.name, "Dropping message, flood pause");
            if warn {
                let target = match &payload {
                    Payload::Channel(event) => event.channel.as_str(),
                    Payload::Private(event) => event.from_nickname.as_str(),
                };
                if let Err(e) = self.connection.send(target, "Throttled") {
                    tracing::debug!(error = %e, "Could not send flood warning");
                }
            }
            return Dispatch::Throttled;
        }

        let ctx = HandlerContext::new(
            self.connection.clone(),
            entry.name.clone(),
            channel.clone(),
            entry.store_for(channel.as_deref()),
        );
        let handler = entry.name.to_string();
        let invocation = Invocation {
            entry,
            payload,
            message,
            ctx,
        };

        let jobs = self.jobs.lock();
        let Some(jobs) = jobs.as_ref() else {
            return Dispatch::Closed;
        };
        match jobs.send(invocation) {
            Ok(()) => Dispatch::Queued { handler },
            Err(_) => Dispatch::Closed,
        }
    }

    /// Stop accepting messages and wait up to the grace period for queued
    /// and in-flight invocations. Stragglers are left to finish on their own.
    pub async fn shutdown(&self) {
        self.jobs.lock().take();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!(
                grace_secs = grace.as_secs(),
                "Handlers still running after shutdown grace period"
            );
        }
    }
}

async fn run_worker(
    mut jobs: mpsc::UnboundedReceiver<Invocation>,
    max_concurrent: usize,
    timeout: Duration,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut workers = JoinSet::new();

    while let Some(job) = jobs.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        workers.spawn(async move {
            let _permit = permit;
            invoke(job, timeout).await;
        });

        while let Some(result) = workers.try_join_next() {
            log_join_result(result);
        }
    }

    while let Some(result) = workers.join_next().await {
        log_join_result(result);
    }
}

async fn invoke(job: Invocation, timeout: Duration) {
    let Invocation {
        entry,
        payload,
        message,
        ctx,
    } = job;
    let handler = entry.registration.handler.as_ref();
    let token = entry.registration.match_token.to_string();

    let (origin, run) = match &payload {
        Payload::Channel(event) => (
            event.channel.as_str(),
            handler.on_channel_message(&ctx, event, &message),
        ),
        Payload::Private(event) => (
            event.from_nickname.as_str(),
            handler.on_private_message(&ctx, event, &message),
        ),
    };

    match tokio::time::timeout(timeout, AssertUnwindSafe(run).catch_unwind()).await {
        Ok(Ok(Ok(()))) => {
            tracing::trace!(handler = %entry.name, origin = %origin, "Handler finished");
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(
                handler = %entry.name,
                token = %token,
                origin = %origin,
                command = %message.command,
                error = %e,
                "Handler error"
            );
        }
        Ok(Err(_)) => {
            tracing::error!(
                handler = %entry.name,
                token = %token,
                origin = %origin,
                command = %message.command,
                "Handler panicked"
            );
        }
        Err(_) => {
            tracing::warn!(
                handler = %entry.name,
                token = %token,
                origin = %origin,
                timeout_secs = timeout.as_secs(),
                "Handler timed out"
            );
        }
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Handler task aborted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FloodConfig;
    use crate::connection::OutboundFrame;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        token: MatchToken,
        seen: mpsc::UnboundedSender<(String, ChannelMessageEvent)>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn match_token(&self) -> MatchToken {
            self.token.clone()
        }

        async fn on_channel_message(
            &self,
            _ctx: &HandlerContext,
            event: &ChannelMessageEvent,
            _message: &Message,
        ) -> anyhow::Result<()> {
            let _ = self.seen.send((self.name.to_string(), event.clone()));
            Ok(())
        }

        async fn on_private_message(
            &self,
            ctx: &HandlerContext,
            event: &PrivateMessageEvent,
            _message: &Message,
        ) -> anyhow::Result<()> {
            ctx.send(&event.from_nickname, "hi")?;
            Ok(())
        }
    }

    /// Fails on "!boom fail", panics on "!boom panic", records otherwise.
    struct Faulty {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CommandHandler for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        fn match_token(&self) -> MatchToken {
            MatchToken::token("!boom")
        }

        async fn on_channel_message(
            &self,
            _ctx: &HandlerContext,
            event: &ChannelMessageEvent,
            _message: &Message,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match event.text_tokens.get(1).map(|s| s.as_str()) {
                Some("fail") => anyhow::bail!("requested failure"),
                Some("panic") => panic!("requested panic"),
                _ => Ok(()),
            }
        }
    }

    /// Blocks each invocation until the test hands out a permit.
    struct Gate {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        started: mpsc::UnboundedSender<String>,
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl CommandHandler for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn match_token(&self) -> MatchToken {
            MatchToken::All
        }

        async fn on_channel_message(
            &self,
            _ctx: &HandlerContext,
            event: &ChannelMessageEvent,
            _message: &Message,
        ) -> anyhow::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _ = self.started.send(event.text.clone());
            self.release.acquire().await?.forget();
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sleeps, then replies "done" in the channel.
    struct Slow {
        token: &'static str,
        delay: Duration,
        finished: mpsc::UnboundedSender<crate::Result<()>>,
    }

    #[async_trait]
    impl CommandHandler for Slow {
        fn name(&self) -> &str {
            self.token
        }

        fn match_token(&self) -> MatchToken {
            MatchToken::token(self.token)
        }

        async fn on_channel_message(
            &self,
            ctx: &HandlerContext,
            event: &ChannelMessageEvent,
            _message: &Message,
        ) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            let _ = self.finished.send(ctx.send(&event.channel, "done"));
            Ok(())
        }
    }

    fn config(max_concurrent: usize) -> DispatchConfig {
        DispatchConfig {
            max_concurrent_handlers: max_concurrent,
            handler_timeout_secs: 5,
            shutdown_grace_secs: 5,
            flood: FloodConfig {
                enabled: false,
                ..FloodConfig::default()
            },
        }
    }

    fn recorder(
        name: &'static str,
        token: MatchToken,
    ) -> (Recorder, mpsc::UnboundedReceiver<(String, ChannelMessageEvent)>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (Recorder { name, token, seen }, rx)
    }

    fn line(raw: &str) -> Message {
        Message::parse(raw).unwrap()
    }

    fn ready_connection() -> (ConnectionHandle, mpsc::Receiver<OutboundFrame>) {
        ConnectionHandle::ready_for_test("bot", 16)
    }

    #[tokio::test]
    async fn dispatches_matching_token() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(4));
        let (handler, mut seen) = recorder("frc", MatchToken::token("!frc"));
        dispatcher.register(handler);

        let outcome = dispatcher.on_message(line(":alice!a@host PRIVMSG #test :!frc"));
        assert_eq!(outcome, Dispatch::Queued { handler: "frc".to_string() });

        let (name, event) = seen.recv().await.unwrap();
        assert_eq!(name, "frc");
        assert_eq!(event.channel, "#test");
        assert_eq!(event.from_nickname, "alice");
        assert_eq!(event.text, "!frc");
        assert_eq!(event.text_tokens, vec!["!frc"]);

        dispatcher.shutdown().await;
        assert!(seen.try_recv().is_err(), "handler must run exactly once");
    }

    #[tokio::test]
    async fn unmatched_falls_back_to_wildcard() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(4));
        let (frc, mut frc_seen) = recorder("frc", MatchToken::token("!frc"));
        let (all, mut all_seen) = recorder("all", MatchToken::All);
        dispatcher.register(frc);
        dispatcher.register(all);

        dispatcher.on_message(line(":bob!b@h PRIVMSG #test :just chatting"));
        let (name, event) = all_seen.recv().await.unwrap();
        assert_eq!(name, "all");
        assert_eq!(event.text, "just chatting");

        dispatcher.shutdown().await;
        assert!(frc_seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn nothing_registered_is_unmatched() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(1));
        assert_eq!(
            dispatcher.on_message(line(":bob!b@h PRIVMSG #test :!frc")),
            Dispatch::Unmatched
        );
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(4));
        let (first, mut first_seen) = recorder("first", MatchToken::token("!frc"));
        let (second, mut second_seen) = recorder("second", MatchToken::token("!FRC"));
        dispatcher.register(first);
        dispatcher.register(second);
        assert_eq!(dispatcher.handler_count(), 1);

        dispatcher.on_message(line(":alice!a@h PRIVMSG #test :!frc"));
        let (name, _) = second_seen.recv().await.unwrap();
        assert_eq!(name, "second");

        dispatcher.shutdown().await;
        assert!(first_seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn housekeeping_and_noise_never_reach_handlers() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(1));
        let (all, mut seen) = recorder("all", MatchToken::All);
        dispatcher.register(all);

        assert_eq!(dispatcher.on_message(line("PING :abc")), Dispatch::Housekeeping);
        assert_eq!(dispatcher.on_message(line(":srv 001 bot :Welcome")), Dispatch::Housekeeping);
        assert_eq!(dispatcher.on_message(line(":srv 372 bot :- motd")), Dispatch::Ignored);
        assert_eq!(
            dispatcher.on_message(line(":irc.example.net NOTICE #test :server notice")),
            Dispatch::Ignored
        );
        assert_eq!(
            dispatcher.on_message(line(":bot!b@h PRIVMSG #test :echo of myself")),
            Dispatch::Ignored
        );

        dispatcher.shutdown().await;
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test]
    async fn channel_scoping_is_respected() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(1));
        let (handler, mut seen) = recorder("frc", MatchToken::token("!frc"));
        dispatcher.register_handler(HandlerRegistration::new(handler).in_channels(["#Allowed"]));

        assert_eq!(
            dispatcher.on_message(line(":a!a@h PRIVMSG #other :!frc")),
            Dispatch::Unmatched
        );
        dispatcher.on_message(line(":a!a@h PRIVMSG #allowed :!frc"));
        let (_, event) = seen.recv().await.unwrap();
        assert_eq!(event.channel, "#allowed");
    }

    #[tokio::test]
    async fn private_messages_need_opt_in() {
        let (connection, mut out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(1));
        let (handler, _seen) = recorder("hello", MatchToken::token("hello"));
        dispatcher.register_handler(
            HandlerRegistration::new(handler)
                .channel_messages(false)
                .private_messages(true),
        );

        assert_eq!(
            dispatcher.on_message(line(":alice!a@h PRIVMSG #test :hello")),
            Dispatch::Unmatched
        );
        assert_eq!(
            dispatcher.on_message(line(":alice!a@h PRIVMSG bot :hello")),
            Dispatch::Queued { handler: "hello".to_string() }
        );

        let reply = out.recv().await.unwrap();
        assert_eq!(reply.to_line(), "PRIVMSG alice :hi");
    }

    #[tokio::test]
    async fn dispatch_preserves_arrival_order() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(1));
        let (all, mut seen) = recorder("all", MatchToken::All);
        dispatcher.register(all);

        for i in 0..20 {
            dispatcher.on_message(line(&format!(":a!a@h PRIVMSG #test :message {i}")));
        }
        for i in 0..20 {
            let (_, event) = seen.recv().await.unwrap();
            assert_eq!(event.text, format!("message {i}"));
        }
    }

    #[tokio::test]
    async fn failures_and_panics_are_isolated() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(2));
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher.register(Faulty { calls: calls.clone() });
        let (other, mut other_seen) = recorder("other", MatchToken::token("!other"));
        dispatcher.register(other);

        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!boom fail"));
        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!boom panic"));
        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!other"));
        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!boom again"));

        let (name, _) = other_seen.recv().await.unwrap();
        assert_eq!(name, "other");
        dispatcher.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn flood_guard_throttles_and_warns_once() {
        let (connection, mut out) = ready_connection();
        let mut cfg = config(4);
        cfg.flood = FloodConfig::default();
        let dispatcher = Dispatcher::new(connection, cfg);
        let (all, _seen) = recorder("all", MatchToken::All);
        dispatcher.register(all);

        for _ in 0..5 {
            assert!(matches!(
                dispatcher.on_message(line(":a!a@h PRIVMSG #test :spam")),
                Dispatch::Queued { .. }
            ));
        }
        assert_eq!(
            dispatcher.on_message(line(":a!a@h PRIVMSG #test :spam")),
            Dispatch::Throttled
        );
        assert_eq!(
            dispatcher.on_message(line(":a!a@h PRIVMSG #test :spam")),
            Dispatch::Throttled
        );

        let warning = out.recv().await.unwrap();
        assert_eq!(warning.to_line(), "PRIVMSG #test :Throttled");
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_after_shutdown() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(1));
        let (all, _seen) = recorder("all", MatchToken::All);
        dispatcher.register(all);
        dispatcher.shutdown().await;
        assert_eq!(
            dispatcher.on_message(line(":a!a@h PRIVMSG #test :late")),
            Dispatch::Closed
        );
    }

    #[tokio::test]
    async fn concurrency_cap_queues_the_rest_in_order() {
        let (connection, _out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Semaphore::new(0));
        let (started_tx, mut started) = mpsc::unbounded_channel();
        dispatcher.register(Gate {
            running: running.clone(),
            peak: peak.clone(),
            started: started_tx,
            release: release.clone(),
        });

        for i in 0..5 {
            dispatcher.on_message(line(&format!(":a!a@h PRIVMSG #test :job {i}")));
        }

        assert_eq!(started.recv().await.unwrap(), "job 0");
        assert_eq!(started.recv().await.unwrap(), "job 1");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.try_recv().is_err(), "third job must wait for a slot");

        for i in 2..5 {
            release.add_permits(1);
            assert_eq!(started.recv().await.unwrap(), format!("job {i}"));
        }
        release.add_permits(2);
        dispatcher.shutdown().await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timed_out_handler_frees_its_slot() {
        let (connection, _out) = ready_connection();
        let mut cfg = config(1);
        cfg.handler_timeout_secs = 1;
        let dispatcher = Dispatcher::new(connection, cfg);
        let (stuck_tx, mut stuck_done) = mpsc::unbounded_channel();
        dispatcher.register(Slow {
            token: "!stuck",
            delay: Duration::from_secs(3600),
            finished: stuck_tx,
        });
        let (frc, mut frc_seen) = recorder("frc", MatchToken::token("!frc"));
        dispatcher.register(frc);

        let start = Instant::now();
        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!stuck"));
        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!frc"));

        let seen = tokio::time::timeout(Duration::from_secs(5), frc_seen.recv()).await;
        assert!(matches!(seen, Ok(Some(_))), "queued handler never ran");
        assert!(start.elapsed() >= Duration::from_millis(950));
        assert!(stuck_done.try_recv().is_err(), "timed out handler must not finish");
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_handlers() {
        let (connection, mut out) = ready_connection();
        let dispatcher = Dispatcher::new(connection, config(2));
        let (finished_tx, mut finished) = mpsc::unbounded_channel();
        dispatcher.register(Slow {
            token: "!slow",
            delay: Duration::from_millis(200),
            finished: finished_tx,
        });

        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!slow"));
        dispatcher.shutdown().await;

        assert!(matches!(finished.try_recv(), Ok(Ok(()))));
        assert_eq!(out.try_recv().unwrap().to_line(), "PRIVMSG #test :done");
    }

    #[tokio::test]
    async fn shutdown_gives_up_after_grace_and_leaves_stragglers() {
        let (connection, _out) = ready_connection();
        let mut cfg = config(1);
        cfg.shutdown_grace_secs = 1;
        let dispatcher = Dispatcher::new(connection, cfg);
        let (finished_tx, mut finished) = mpsc::unbounded_channel();
        dispatcher.register(Slow {
            token: "!slow",
            delay: Duration::from_millis(2000),
            finished: finished_tx,
        });

        dispatcher.on_message(line(":a!a@h PRIVMSG #test :!slow"));
        let start = Instant::now();
        dispatcher.shutdown().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(950), "{waited:?}");
        assert!(waited < Duration::from_millis(1900), "{waited:?}");
        assert!(finished.try_recv().is_err());

        let late = tokio::time::timeout(Duration::from_secs(3), finished.recv()).await;
        assert!(matches!(late, Ok(Some(Ok(())))), "straggler should run to completion");
    }
}
