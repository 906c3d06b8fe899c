//! talkwire - talk to a realtime agent backend from the terminal.
//!
//! Connects to the backend's `/ws/realtime` endpoint, streams the
//! microphone up and plays the agent's speech back, printing the
//! reconciled transcript as it forms. Stdin lines are sent as text;
//! `/mute`, `/unmute`, `/interrupt` and `/quit` control the session.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use talkwire::{Session, SessionConfig, SessionEvent};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = SessionConfig::from_env();
    let (mut session, mut events) = Session::connect(config).await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Message(message) => {
                    println!("[{}] {}", message.role, message.text);
                }
                SessionEvent::Partial(text) => {
                    println!("  ... {text}");
                }
                SessionEvent::Status(status) => {
                    info!("status: {:?}", status);
                }
                SessionEvent::MicUnavailable(detail) => {
                    error!("microphone unavailable, session is text-only: {}", detail);
                }
                SessionEvent::SpeakerUnavailable(detail) => {
                    error!("audio output unavailable: {}", detail);
                }
                SessionEvent::Disconnected => {
                    info!("connection closed");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/mute" => session.set_mic_muted(true),
            "/unmute" => session.set_mic_muted(false),
            "/interrupt" => session.interrupt(),
            text => session.send_text(text),
        }
        if !session.is_connected() {
            break;
        }
    }

    session.disconnect().await;
    printer.abort();
    info!("session closed");
    Ok(())
}
