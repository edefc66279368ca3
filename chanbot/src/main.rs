//! chanbot: connects to one IRC server, joins channels and answers commands.
//!
//!   chanbot --config chanbot.toml
//!   chanbot --server irc.libera.chat:6697 --nick frcbot --channel "#frc"
//!
//! Log verbosity follows RUST_LOG (default `chanbot=info,chanbot_sdk=info`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use chanbot_sdk::{Client, Dispatcher};
use clap::Parser;

use chanbot::config::BotConfig;
use chanbot::handlers;

#[derive(Parser)]
#[command(name = "chanbot", about = "IRC channel bot", version)]
struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// IRC server address (host:port)
    #[arg(long)]
    server: Option<String>,

    /// Bot nick
    #[arg(long)]
    nick: Option<String>,

    /// Channel to join (repeatable)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Use TLS (implied by port 6697)
    #[arg(long)]
    tls: bool,

    /// Password for the !control handler
    #[arg(long, env = "CHANBOT_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let mut config = match &args.config {
        Some(path) => BotConfig::load(path)?,
        None => BotConfig::default(),
    };
    apply_overrides(&mut config, &args)?;

    tracing::info!(
        server = %config.client.server_addr(),
        tls = config.client.use_tls(),
        nick = %config.client.nick,
        channels = ?config.client.channels,
        "Starting chanbot"
    );

    let client = Client::new(config.client.clone());
    let handle = client.handle();
    let dispatcher = Dispatcher::new(handle.clone(), config.client.dispatch.clone());
    for registration in handlers::builtin(&config) {
        tracing::info!(
            handler = %registration.handler.name(),
            token = %registration.match_token,
            "Handler enabled"
        );
        dispatcher.register_handler(registration);
    }

    let stop = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupted, quitting");
                stop.shutdown();
            }
            Err(e) => tracing::error!(error = %e, "Can't listen for ctrl-c"),
        }
    });

    tracing::info!(
        handlers = dispatcher.handler_count(),
        "Bot running. Ctrl+C to stop."
    );
    client.run(dispatcher).await?;
    tracing::info!("Bye");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chanbot=info,chanbot_sdk=info".into());
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn apply_overrides(config: &mut BotConfig, args: &Args) -> Result<()> {
    if let Some(server) = &args.server {
        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .with_context(|| format!("bad port in --server {server}"))?,
            ),
            None => (server.as_str(), config.client.port),
        };
        config.client.host = host.to_string();
        config.client.port = port;
    }
    if let Some(nick) = &args.nick {
        config.client.nick = nick.clone();
    }
    if !args.channels.is_empty() {
        config.client.channels = args.channels.clone();
    }
    if args.tls {
        config.client.tls = true;
    }
    if args.admin_password.is_some() {
        config.admin_password = args.admin_password.clone();
    }
    Ok(())
}
