use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voicelink::audio::CpalBackend;
use voicelink::{ClientConfig, Role, SessionUpdate, VoiceClient, VoiceState};

const HELP: &str = "commands: on | off | talk | stop | status | quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicelink=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => ClientConfig::load_default()?,
    }
    .with_env_overrides()?;

    info!("Starting voicelink against {}", config.endpoint());
    let client = VoiceClient::new(config, Arc::new(CpalBackend))?;

    let updates = client.updates();
    thread::Builder::new()
        .name("voicelink-status".into())
        .spawn(move || {
            for update in updates {
                match update {
                    SessionUpdate::Status(status) => println!("[{}] {}", status.state, status.text),
                    SessionUpdate::Transcript(t) if !t.partial => {
                        let who = match t.role {
                            Role::Assistant => "assistant",
                            Role::User => "you",
                        };
                        println!("{}: {}", who, t.text);
                    }
                    SessionUpdate::Transcript(_) => {}
                }
            }
        })?;

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "on" => {
                // The handshake can take a while; keep reading commands so
                // "off" can cancel it
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.activate().await {
                        if client.state() == VoiceState::Error {
                            warn!("Activation failed: {}", e);
                            println!("{}", e.user_message());
                        } else {
                            debug!("Activation abandoned: {}", e);
                        }
                    }
                });
            }
            "off" => client.deactivate(),
            "talk" => client.voice_gesture(),
            "stop" => client.interrupt(),
            "status" => println!(
                "{} (connection {})",
                client.state(),
                client.connection_state()
            ),
            "quit" | "exit" => break,
            "" => {}
            other => println!("unknown command '{}'; {}", other, HELP),
        }
    }

    client.deactivate();
    info!("Voicelink stopped");
    Ok(())
}
