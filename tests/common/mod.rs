//! Shared fixtures: scripted audio devices and an in-process voice service

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use voicelink::audio::{
    AudioBackend, CaptureError, ChunkSender, InputDevice, OutputDevice, PlaybackError, PlaybackQueue,
};
use voicelink::codec::encode_outbound;
use voicelink::{ClientConfig, SessionUpdate, StatusUpdate, VoiceState};

const WAIT: Duration = Duration::from_secs(3);

/// Devices whose ends are held by the test
#[derive(Default)]
pub struct MockBackend {
    mic: Arc<Mutex<Option<ChunkSender>>>,
    speaker: Arc<Mutex<Option<PlaybackQueue>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver one chunk as the device callback would
    pub fn speak(&self, samples: Vec<f32>) -> bool {
        match self.mic.lock().as_ref() {
            Some(tx) => tx.send(samples),
            None => false,
        }
    }

    pub fn mic_open(&self) -> bool {
        self.mic.lock().is_some()
    }

    /// Pull `frames` samples as the output callback would
    pub fn render(&self, frames: usize) -> usize {
        let mut buf = vec![0.0; frames];
        match self.speaker.lock().as_ref() {
            Some(queue) => queue.render(&mut buf),
            None => 0,
        }
    }
}

struct MockMic {
    slot: Arc<Mutex<Option<ChunkSender>>>,
}

impl InputDevice for MockMic {
    fn open(&mut self, preferred_rate: u32, chunks: ChunkSender) -> Result<u32, CaptureError> {
        *self.slot.lock() = Some(chunks);
        Ok(preferred_rate)
    }

    fn close(&mut self) {
        self.slot.lock().take();
    }
}

struct MockSpeaker {
    slot: Arc<Mutex<Option<PlaybackQueue>>>,
}

impl OutputDevice for MockSpeaker {
    fn open(&mut self, preferred_rate: u32, source: PlaybackQueue) -> Result<u32, PlaybackError> {
        *self.slot.lock() = Some(source);
        Ok(preferred_rate)
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn close(&mut self) {
        self.slot.lock().take();
    }
}

impl AudioBackend for MockBackend {
    fn input_device(&self) -> Box<dyn InputDevice> {
        Box::new(MockMic {
            slot: Arc::clone(&self.mic),
        })
    }

    fn output_device(&self) -> Box<dyn OutputDevice> {
        Box::new(MockSpeaker {
            slot: Arc::clone(&self.speaker),
        })
    }
}

pub fn test_config(url: &str) -> ClientConfig {
    ClientConfig::default()
        .with_endpoint(url)
        .with_reconnect_delay(Duration::from_millis(100))
        .with_handshake_timeout(Duration::from_secs(2))
        .with_block_size(480)
        .without_keepalive()
}

/// Voice service stand-in on a random local port
pub struct MockService {
    listener: TcpListener,
    pub url: String,
}

impl MockService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/voice", listener.local_addr().unwrap());
        Self { listener, url }
    }

    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = timeout(WAIT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        ServerConn {
            ws: accept_async(stream).await.unwrap(),
        }
    }

    /// Accept and complete the handshake
    pub async fn accept_ready(&self, session_id: &str) -> ServerConn {
        let mut conn = self.accept().await;
        conn.ready(session_id).await;
        conn
    }

    /// Whether a connection attempt arrives within `within`
    pub async fn connection_attempted(&self, within: Duration) -> bool {
        timeout(within, self.listener.accept()).await.is_ok()
    }
}

pub struct ServerConn {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConn {
    pub async fn send(&mut self, json: &str) {
        self.ws.send(Message::Text(json.to_string())).await.unwrap();
    }

    pub async fn ready(&mut self, session_id: &str) {
        self.send(&format!(
            r#"{{"type":"ready","session_id":"{}","conversation_id":"conv-1"}}"#,
            session_id
        ))
        .await;
    }

    pub async fn send_audio(&mut self, samples: &[f32]) {
        self.send(&format!(r#"{{"type":"audio","data":"{}"}}"#, encode_outbound(samples)))
            .await;
    }

    /// Next event of type `kind`, skipping others
    pub async fn expect(&mut self, kind: &str) -> Value {
        let found = timeout(WAIT, async {
            while let Some(Ok(message)) = self.ws.next().await {
                if let Message::Text(text) = message {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == kind {
                        return Some(value);
                    }
                }
            }
            None
        })
        .await;
        match found {
            Ok(Some(value)) => value,
            _ => panic!("no '{}' event from the client", kind),
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Drain the status states emitted so far
pub fn states(updates: &crossbeam_channel::Receiver<SessionUpdate>) -> Vec<VoiceState> {
    updates
        .try_iter()
        .filter_map(|u| match u {
            SessionUpdate::Status(StatusUpdate { state, .. }) => Some(state),
            SessionUpdate::Transcript(_) => None,
        })
        .collect()
}
