//! Real-time duplex voice client
//!
//! Streams microphone audio to a conversational voice service over a
//! WebSocket and plays the synthesized replies with barge-in support.

pub mod audio;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod session;

pub use client::VoiceClient;
pub use config::ClientConfig;
pub use connection::{ConnectionState, Session};
pub use session::{Role, SessionUpdate, StatusUpdate, Transcript, VoiceState};

use audio::{CaptureError, PlaybackError};
use codec::DecodeError;
use config::ConfigError;
use connection::{ConnectError, ProtocolError, SocketError};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum VoiceLinkError {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio processing error: {0}")]
    AudioProcessing(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

impl VoiceLinkError {
    /// Check if this error is recoverable without user action
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Setup errors need the user to retry the activation
            VoiceLinkError::Capture(_) => false,
            VoiceLinkError::Connect(_) => false,
            VoiceLinkError::Config(_) => false,
            // Suspended output resumes on the next gesture
            VoiceLinkError::Playback(_) => true,
            // Mid-session drops are handled by the reconnect loop
            VoiceLinkError::Socket(_) => true,
            VoiceLinkError::Protocol(_) => true,
            VoiceLinkError::Decode(_) => true,
            VoiceLinkError::AudioProcessing(_) => true,
            VoiceLinkError::Channel(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            VoiceLinkError::Capture(_) => {
                "Microphone unavailable. Check the device and permissions, then try again.".to_string()
            }
            VoiceLinkError::Playback(_) => {
                "Audio output is paused. Interact again to resume playback.".to_string()
            }
            VoiceLinkError::Connect(_) => {
                "Could not reach the voice service. Please try again.".to_string()
            }
            VoiceLinkError::Socket(_) => "Connection lost. Reconnecting...".to_string(),
            VoiceLinkError::Protocol(_) => "Received an unexpected message.".to_string(),
            VoiceLinkError::Decode(_) => "Skipped a damaged audio segment.".to_string(),
            VoiceLinkError::Config(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            VoiceLinkError::AudioProcessing(_) => "Audio processing failed.".to_string(),
            VoiceLinkError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceLinkError>;
