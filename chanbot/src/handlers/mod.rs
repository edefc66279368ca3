//! Built-in command handlers.

pub mod control;
pub mod hello;

use chanbot_sdk::HandlerRegistration;

use crate::config::BotConfig;

/// Registrations for every built-in handler the configuration leaves on.
pub fn builtin(config: &BotConfig) -> Vec<HandlerRegistration> {
    let mut registrations = Vec::new();

    if config.is_enabled(hello::NAME) {
        registrations.push(scoped(config, hello::NAME, hello::registration()));
    }

    if config.is_enabled(control::NAME) {
        match config.admin_password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => registrations.push(scoped(
                config,
                control::NAME,
                control::registration(password),
            )),
            None => tracing::info!("No admin password set, control handler disabled"),
        }
    }

    registrations
}

fn scoped(config: &BotConfig, name: &str, registration: HandlerRegistration) -> HandlerRegistration {
    match config.channels_for(name) {
        Some(channels) => registration.in_channels(channels),
        None => registration,
    }
}
