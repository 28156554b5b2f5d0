//! Terminal chat client.
//!
//! Run with: `AGENT_LINK_API_BASE=https://bot.example.com/api cargo run -p chat-cli-example`
//!
//! Optional: `AGENT_LINK_SESSION_ID` resumes a stored session. Type a line to
//! send it; `/quit` ends the chat.

use std::sync::Arc;

use agent_link_core::{ChatEvent, ClientConfig, Role};
use agent_link_session::ChatController;
use agent_link_transport::{HttpBackend, WsConnector};
use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = ClientConfig::from_env().context("reading configuration")?;
    let backend = HttpBackend::from_config(&config).context("building HTTP client")?;
    let controller = ChatController::new(config, Arc::new(backend), Arc::new(WsConnector::new()))?;

    let printer = tokio::spawn(print_events(controller.subscribe()));

    let session_id = std::env::var("AGENT_LINK_SESSION_ID").ok();
    controller
        .start_chat(session_id)
        .await
        .context("starting chat")?;
    for message in controller.messages() {
        println!("[{:?}] {}", message.role, message.content);
    }
    tracing::info!(session_id = ?controller.session_id(), "chat ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = controller.send_message(line, None).await {
            tracing::error!("send failed: {e}");
        }
    }

    controller.end_chat();
    printer.abort();
    Ok(())
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::MessageAdded { message, .. }) if message.role != Role::User => {
                if !message.content.is_empty() {
                    println!("[{:?}] {}", message.role, message.content);
                }
            }
            Ok(ChatEvent::MessageUpdated { message, .. }) if message.done => {
                match &message.error_text {
                    Some(error) => println!("[{:?}] ! {error}", message.role),
                    None => println!("[{:?}] {}", message.role, message.content),
                }
            }
            Ok(ChatEvent::TransportChanged { transport }) => {
                tracing::info!(?transport, "transport changed");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event printer lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}
