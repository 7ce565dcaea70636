//! Voice session state machine
//!
//! [`VoiceSession::handle`] is a pure transition function: it takes one
//! [`SessionEvent`] and returns the [`Effect`]s the client must carry out.
//! Nothing here touches devices or the network, so every transition can be
//! tested directly.

use crate::connection::InboundEvent;
use tracing::debug;

/// What the voice indicator shows
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VoiceState {
    /// Voice mode off
    #[default]
    Inactive,
    /// Waiting for the service's `ready`, including while reconnecting
    Connecting,
    /// Connected, waiting for the wake phrase or a voice gesture
    Listening,
    /// The user is talking
    Recording,
    /// The service is working on a reply
    Processing,
    /// Reply audio is playing
    Speaking,
    /// Needs the user to reactivate
    Error,
}

impl VoiceState {
    pub const ALL: [VoiceState; 7] = [
        VoiceState::Inactive,
        VoiceState::Connecting,
        VoiceState::Listening,
        VoiceState::Recording,
        VoiceState::Processing,
        VoiceState::Speaking,
        VoiceState::Error,
    ];

    /// Devices and connection are held in these states. Error may still
    /// hold an open connection after a fatal server error.
    pub fn is_active(&self) -> bool {
        !matches!(self, VoiceState::Inactive | VoiceState::Error)
    }

    /// Connected and past the handshake
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            VoiceState::Listening | VoiceState::Recording | VoiceState::Processing | VoiceState::Speaking
        )
    }

    fn default_text(&self) -> &'static str {
        match self {
            VoiceState::Inactive => "Voice off",
            VoiceState::Connecting => "Connecting...",
            VoiceState::Listening => "Listening",
            VoiceState::Recording => "Recording",
            VoiceState::Processing => "Thinking...",
            VoiceState::Speaking => "Speaking",
            VoiceState::Error => "Error",
        }
    }
}

impl std::fmt::Display for VoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceState::Inactive => write!(f, "Inactive"),
            VoiceState::Connecting => write!(f, "Connecting"),
            VoiceState::Listening => write!(f, "Listening"),
            VoiceState::Recording => write!(f, "Recording"),
            VoiceState::Processing => write!(f, "Processing"),
            VoiceState::Speaking => write!(f, "Speaking"),
            VoiceState::Error => write!(f, "Error"),
        }
    }
}

/// Indicator update emitted on every transition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub state: VoiceState,
    pub text: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Assistant,
    User,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transcript {
    pub role: Role,
    pub text: String,
    /// Superseded by a later transcript of the same utterance
    pub partial: bool,
}

/// Everything the client reports to its embedder
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    Status(StatusUpdate),
    Transcript(Transcript),
}

/// Inputs to the state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    // User gestures
    Activate,
    Deactivate,
    VoiceGesture,
    Interrupt,

    // Local failures
    CaptureFailed(String),
    PlaybackFailed(String),
    ConnectFailed(String),

    // From the service
    Ready,
    WakeDetected,
    UserSpeaking,
    UserStopped,
    Audio(String),
    Transcript(Transcript),
    /// `playback_idle` is whether the queue had drained when it arrived
    ResponseComplete { playback_idle: bool },
    ServerError { message: String, fatal: bool },

    // Transport and output
    ConnectionLost,
    PlaybackComplete,
}

impl SessionEvent {
    /// Translate a service event; `pong` has no session meaning
    pub fn from_inbound(event: InboundEvent, playback_idle: bool) -> Option<Self> {
        let event = match event {
            InboundEvent::Ready { .. } => SessionEvent::Ready,
            InboundEvent::Audio { data } => SessionEvent::Audio(data),
            InboundEvent::Transcript { text } => SessionEvent::Transcript(Transcript {
                role: Role::Assistant,
                text,
                partial: false,
            }),
            InboundEvent::TranscriptPartial { text } => SessionEvent::Transcript(Transcript {
                role: Role::Assistant,
                text,
                partial: true,
            }),
            InboundEvent::UserTranscript { text } => SessionEvent::Transcript(Transcript {
                role: Role::User,
                text,
                partial: false,
            }),
            InboundEvent::WakeDetected => SessionEvent::WakeDetected,
            InboundEvent::UserSpeaking => SessionEvent::UserSpeaking,
            InboundEvent::UserStopped => SessionEvent::UserStopped,
            InboundEvent::ResponseComplete => SessionEvent::ResponseComplete { playback_idle },
            InboundEvent::Error { message, fatal } => SessionEvent::ServerError { message, fatal },
            InboundEvent::Pong => return None,
        };
        Some(event)
    }
}

/// Commands for the client to execute, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    StartPlayback,
    StartCapture,
    Connect,
    /// Deliberate close; no reconnection follows
    CloseConnection,
    StopCapture,
    StopPlayback,
    EnqueueAudio(String),
    InterruptPlayback,
    /// Ask the service to stop the current response
    SendInterrupt,
    PlayCue,
    Status(StatusUpdate),
    Transcript(Transcript),
}

#[derive(Debug, Default)]
pub struct VoiceSession {
    state: VoiceState,
    /// `response_complete` arrived while audio was still rendering
    awaiting_drain: bool,
}

impl VoiceSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    /// Apply one event. Events with no meaning in the current state are
    /// ignored and produce no effects.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        use SessionEvent as E;
        use VoiceState as S;

        let from = self.state;
        let effects = match (from, event) {
            // Deactivation wins from anywhere
            (S::Inactive, E::Deactivate) => Vec::new(),
            (_, E::Deactivate) => self.enter(
                S::Inactive,
                None,
                vec![Effect::CloseConnection, Effect::StopCapture, Effect::StopPlayback],
            ),

            (S::Inactive | S::Error, E::Activate) => self.enter(
                S::Connecting,
                None,
                vec![Effect::StartPlayback, Effect::StartCapture, Effect::Connect],
            ),
            (_, E::Activate) => Vec::new(),

            // The service closed after a fatal error; do not reconnect
            (S::Error, E::ConnectionLost) => vec![Effect::CloseConnection, Effect::StopPlayback],

            // Error only leaves through the two arms above
            (S::Inactive | S::Error, _) => Vec::new(),

            (_, E::CaptureFailed(reason)) => self.fail(format!("Microphone unavailable: {}", reason)),
            (_, E::PlaybackFailed(reason)) => self.fail(format!("Speaker unavailable: {}", reason)),
            (S::Connecting, E::ConnectFailed(reason)) => {
                self.fail(format!("Could not connect: {}", reason))
            }
            (_, E::ConnectFailed(_)) => Vec::new(),
            // The connection stays up until the service closes it
            (_, E::ServerError { message, fatal: true }) => self.enter(
                S::Error,
                Some(message),
                vec![Effect::StopCapture, Effect::InterruptPlayback],
            ),
            (state, E::ServerError { message, fatal: false }) => {
                vec![Effect::Status(StatusUpdate { state, text: message })]
            }

            (S::Connecting, E::Ready) => self.enter(S::Listening, None, Vec::new()),
            (_, E::Ready) => Vec::new(),

            (S::Connecting, E::ConnectionLost) => Vec::new(),
            (_, E::ConnectionLost) => self.enter(
                S::Connecting,
                Some("Reconnecting...".into()),
                vec![Effect::InterruptPlayback],
            ),

            (S::Listening, E::WakeDetected | E::VoiceGesture) => {
                self.enter(S::Recording, None, vec![Effect::PlayCue])
            }
            (_, E::WakeDetected | E::VoiceGesture) => Vec::new(),

            // Barge-in
            (S::Speaking, E::UserSpeaking) => self.enter(
                S::Recording,
                None,
                vec![Effect::InterruptPlayback, Effect::SendInterrupt, Effect::PlayCue],
            ),
            (S::Processing, E::UserSpeaking) => self.enter(S::Recording, None, vec![Effect::PlayCue]),
            (_, E::UserSpeaking) => Vec::new(),

            (S::Recording, E::UserStopped) => self.enter(S::Processing, None, Vec::new()),
            (_, E::UserStopped) => Vec::new(),

            (S::Listening | S::Processing, E::Audio(data)) => {
                self.enter(S::Speaking, None, vec![Effect::EnqueueAudio(data)])
            }
            (S::Speaking, E::Audio(data)) => vec![Effect::EnqueueAudio(data)],
            (_, E::Audio(_)) => {
                debug!("Dropping audio received while {}", from);
                Vec::new()
            }

            (S::Speaking, E::ResponseComplete { playback_idle: true }) => {
                self.enter(S::Listening, None, Vec::new())
            }
            (S::Speaking, E::ResponseComplete { playback_idle: false }) => {
                self.awaiting_drain = true;
                Vec::new()
            }
            (S::Processing, E::ResponseComplete { .. }) => self.enter(S::Listening, None, Vec::new()),
            (_, E::ResponseComplete { .. }) => Vec::new(),

            (S::Speaking, E::PlaybackComplete) if self.awaiting_drain => {
                self.enter(S::Listening, None, Vec::new())
            }
            (_, E::PlaybackComplete) => Vec::new(),

            (S::Speaking, E::Interrupt) => self.enter(
                S::Listening,
                None,
                vec![Effect::InterruptPlayback, Effect::SendInterrupt],
            ),
            (S::Processing, E::Interrupt) => {
                self.enter(S::Listening, None, vec![Effect::SendInterrupt])
            }
            (_, E::Interrupt) => vec![Effect::InterruptPlayback],

            (_, E::Transcript(transcript)) => vec![Effect::Transcript(transcript)],
        };

        if self.state != from {
            debug!("Voice state: {} -> {}", from, self.state);
        }
        effects
    }

    fn enter(&mut self, to: VoiceState, text: Option<String>, mut effects: Vec<Effect>) -> Vec<Effect> {
        self.state = to;
        self.awaiting_drain = false;
        effects.push(Effect::Status(StatusUpdate {
            state: to,
            text: text.unwrap_or_else(|| to.default_text().to_string()),
        }));
        effects
    }

    fn fail(&mut self, text: String) -> Vec<Effect> {
        self.enter(
            VoiceState::Error,
            Some(text),
            vec![Effect::StopCapture, Effect::CloseConnection, Effect::StopPlayback],
        )
    }
}
