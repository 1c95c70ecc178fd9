//! # mqchat
//!
//! Terminal front end for an encrypted MQTT group chat.
//!
//! Connection settings come from `MQCHAT_*` environment variables. Lines typed
//! on stdin are sent to the channel; `/users`, `/resync` and `/quit` are
//! commands. `mqchat genkey` prints a fresh random passphrase and exits.

use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Local, TimeZone};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mqchat_client::{ChatEvent, ChatSession, ClientConfig, SessionState};
use mqchat_net::MqttConnector;
use mqchat_shared::constants::APP_NAME;
use mqchat_shared::generate_passphrase;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var), on stderr so it
    //    does not interleave with the chat on stdout
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("mqchat=info,mqchat_client=debug,mqchat_net=info,warn")
        }))
        .with_writer(std::io::stderr)
        .init();

    if std::env::args().nth(1).as_deref() == Some("genkey") {
        println!("{}", generate_passphrase());
        return Ok(());
    }

    info!("Starting {} v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.username.trim().is_empty() {
        bail!("MQCHAT_USERNAME is not set");
    }
    if config.passphrase.trim().is_empty() {
        bail!("MQCHAT_PASSPHRASE is not set (try `mqchat genkey`)");
    }

    // -----------------------------------------------------------------------
    // 3. Connect
    // -----------------------------------------------------------------------
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let session = ChatSession::new(
        config.session.clone(),
        Arc::new(MqttConnector::default()),
        Arc::new(event_tx),
    );
    session
        .connect(config.connect_params())
        .context("Failed to start connection")?;

    // -----------------------------------------------------------------------
    // 4. Event loop
    // -----------------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if render(&event) {
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => match line.trim() {
                        "/quit" => {
                            if session.disconnect().is_none() {
                                break;
                            }
                        }
                        "/users" => println!("* online: {}", session.online_users().join(", ")),
                        "/resync" => {
                            session.resync_presence();
                        }
                        text => {
                            if !text.is_empty() && !session.send_message(text) {
                                println!("* not connected");
                            }
                        }
                    },
                    None => {
                        stdin_open = false;
                        if session.disconnect().is_none() {
                            break;
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving chat");
                match session.disconnect() {
                    Some(teardown) => {
                        let _ = teardown.await;
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// Print one event. Returns true once the session has ended.
fn render(event: &ChatEvent) -> bool {
    match event {
        ChatEvent::ChatMessage {
            user,
            text,
            timestamp,
        } => println!("[{}] {user}: {text}", format_time(*timestamp)),
        ChatEvent::SystemNotice { text } => println!("* {text}"),
        ChatEvent::UserListChanged { users } => info!(count = users.len(), "User list updated"),
        ChatEvent::Error { message } => eprintln!("! {message}"),
        ChatEvent::StateChanged { state } => return *state == SessionState::Disconnected,
    }
    false
}

fn format_time(timestamp: f64) -> String {
    let micros = (timestamp * 1_000_000.0) as i64;
    match Local.timestamp_micros(micros).single() {
        Some(at) => at.format("%H:%M:%S").to_string(),
        None => "--:--:--".to_string(),
    }
}
