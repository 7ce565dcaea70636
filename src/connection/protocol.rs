//! JSON events exchanged with the voice service
//!
//! Every frame is one object with a `type` discriminator. Inbound parsing is
//! two-stage: the `type` is read first so unknown kinds can be skipped without
//! treating them as malformed.

use super::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Events the service sends
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Session initialized
    Ready {
        session_id: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// One base64 PCM16 segment of synthesized speech
    Audio { data: String },
    Transcript { text: String },
    TranscriptPartial { text: String },
    UserTranscript { text: String },
    WakeDetected,
    UserSpeaking,
    UserStopped,
    ResponseComplete,
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
    Pong,
}

const KNOWN_TYPES: &[&str] = &[
    "ready",
    "audio",
    "transcript",
    "transcript_partial",
    "user_transcript",
    "wake_detected",
    "user_speaking",
    "user_stopped",
    "response_complete",
    "error",
    "pong",
];

impl InboundEvent {
    /// The wire name of this event
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Ready { .. } => "ready",
            InboundEvent::Audio { .. } => "audio",
            InboundEvent::Transcript { .. } => "transcript",
            InboundEvent::TranscriptPartial { .. } => "transcript_partial",
            InboundEvent::UserTranscript { .. } => "user_transcript",
            InboundEvent::WakeDetected => "wake_detected",
            InboundEvent::UserSpeaking => "user_speaking",
            InboundEvent::UserStopped => "user_stopped",
            InboundEvent::ResponseComplete => "response_complete",
            InboundEvent::Error { .. } => "error",
            InboundEvent::Pong => "pong",
        }
    }
}

/// Events the client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Audio { data: String },
    Interrupt,
    Ping,
}

impl OutboundEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }
}

/// Parse one text frame.
///
/// Returns `Ok(None)` for a well-formed message of a type this client does
/// not handle.
pub fn parse_inbound(text: &str) -> Result<Option<InboundEvent>, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        debug!("Ignoring unknown event type: {}", kind);
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidEvent {
            kind,
            error: e.to_string(),
        })
}
