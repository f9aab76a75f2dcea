//! Joins an IRC-over-WebSocket chat anonymously and logs what is said.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,chatsocket=debug cargo run --example chat --features tracing
//! ```
//!
//! Pick the server, channel and runtime with `CHAT_URL`, `CHAT_CHANNEL` and `CHAT_SECONDS`.

use std::time::Duration;

use chatsocket::error::Error;
use chatsocket::ws::config::Config;
use chatsocket::ws::{Client, Listener};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{info, warn};

const DEFAULT_URL: &str = "wss://irc-ws.chat.twitch.tv:443";
const DEFAULT_CHANNEL: &str = "rust";

enum Event {
    Open,
    Line(String),
}

/// Forwards callbacks to the main task, which owns the client and can write.
struct Forwarder(mpsc::UnboundedSender<Event>);

impl Listener for Forwarder {
    fn on_open(&self) {
        _ = self.0.send(Event::Open);
    }

    fn on_message(&self, text: String) {
        for line in text.lines() {
            _ = self.0.send(Event::Line(line.to_owned()));
        }
    }

    fn on_failure(&self, error: Error) {
        warn!(kind = ?error.kind(), error = %error, "connection failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("CHAT_URL").unwrap_or_else(|_| DEFAULT_URL.to_owned());
    let channel = std::env::var("CHAT_CHANNEL").unwrap_or_else(|_| DEFAULT_CHANNEL.to_owned());
    let seconds = std::env::var("CHAT_SECONDS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(30);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = Config::builder().keepalive(true).build();
    let client = Client::new(&url, Forwarder(tx), config)?;

    let driver = client.clone();
    let connection = tokio::spawn(async move { driver.start().await });

    let deadline = Instant::now() + Duration::from_secs(seconds);
    loop {
        let event = tokio::select! {
            () = sleep_until(deadline) => break,
            event = rx.recv() => event,
        };

        match event {
            Some(Event::Open) => {
                info!(%url, %channel, "connected, joining");
                client.write("CAP REQ :twitch.tv/tags twitch.tv/commands").await?;
                client.write("NICK justinfan31337").await?;
                client.write(&format!("JOIN #{channel}")).await?;
            }
            Some(Event::Line(line)) => {
                if let Some(server) = line.strip_prefix("PING ") {
                    client.write(&format!("PONG {server}")).await?;
                } else {
                    info!(%line);
                }
            }
            None => break,
        }
    }

    client.disconnect().await;
    client.stop();
    connection.await??;
    info!(state = ?client.state(), "done");

    Ok(())
}
