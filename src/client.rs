//! Voice client
//!
//! Owns everything one activation needs: playback, capture and the
//! connection. User gestures, inbound events and playback notifications are
//! all fed through the [`VoiceSession`] state machine under one lock, and the
//! resulting effects are carried out in order.

use crate::audio::{
    rising_tones, AudioBackend, CaptureHandle, CapturePipeline, CaptureStats, FrameSink,
    PlaybackEvent, PlaybackPipeline,
};
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionManager, ConnectionNotice, ConnectionOptions, ConnectionState, InboundEvent,
    InboundHandler, OutboundEvent, Session,
};
use crate::session::{Effect, SessionEvent, SessionUpdate, VoiceSession, VoiceState};
use crate::{Result, VoiceLinkError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, warn};

/// Resources of one activation cycle
struct Activation {
    generation: u64,
    connection: ConnectionManager,
    playback: Option<PlaybackPipeline>,
    capture: Option<CaptureHandle>,
}

impl Activation {
    fn release(&mut self) {
        self.connection.close();
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(playback) = self.playback.take() {
            playback.stop();
        }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.release();
    }
}

struct ClientState {
    session: VoiceSession,
    activation: Option<Activation>,
    next_generation: u64,
}

/// A connect requested by the state machine, run after the lock is released
struct PendingConnect {
    connection: ConnectionManager,
    generation: u64,
}

#[derive(Default)]
struct Outcome {
    connect: Option<PendingConnect>,
    error: Option<VoiceLinkError>,
}

struct ClientInner {
    config: ClientConfig,
    backend: Arc<dyn AudioBackend>,
    cue: Vec<f32>,
    state: Mutex<ClientState>,
    updates_tx: Sender<SessionUpdate>,
    updates_rx: Receiver<SessionUpdate>,
}

impl ClientInner {
    /// Feed one event, and any follow-ups its effects produce, through the
    /// state machine. `generation` scopes events to the activation that
    /// produced them; `None` is a user gesture.
    fn apply(self: &Arc<Self>, generation: Option<u64>, event: SessionEvent) -> Outcome {
        let mut state = self.state.lock();
        if !is_current(&state, generation) {
            return Outcome::default();
        }
        self.run(&mut state, event)
    }

    fn apply_inbound(self: &Arc<Self>, generation: u64, event: InboundEvent) {
        let mut state = self.state.lock();
        if !is_current(&state, Some(generation)) {
            return;
        }

        // Sampled under the guard the event is applied with, so a drain
        // notification cannot land in between
        let playback_idle = self.playback(&state).map_or(true, |playback| {
            if matches!(event, InboundEvent::ResponseComplete) {
                playback.finish_response();
            }
            !playback.is_playing()
        });
        if let Some(event) = SessionEvent::from_inbound(event, playback_idle) {
            self.run(&mut state, event);
        }
    }

    /// The playback queue reported it ran dry
    fn apply_drained(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if !is_current(&state, Some(generation)) {
            return;
        }
        // Refilled since the notification was sent; a later one will follow
        if self.playback(&state).is_some_and(|p| p.is_playing()) {
            debug!("Playback refilled before the drain was handled");
            return;
        }
        self.run(&mut state, SessionEvent::PlaybackComplete);
    }

    fn run(self: &Arc<Self>, state: &mut ClientState, event: SessionEvent) -> Outcome {
        let mut outcome = Outcome::default();
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let effects = state.session.handle(event);
            for effect in effects {
                self.execute(state, effect, &mut queue, &mut outcome);
            }
        }

        if !holds_activation(state) {
            state.activation = None;
        }
        if state.session.state() != VoiceState::Connecting {
            outcome.connect = None;
        }
        outcome
    }

    fn execute(
        self: &Arc<Self>,
        state: &mut ClientState,
        effect: Effect,
        follow_ups: &mut VecDeque<SessionEvent>,
        outcome: &mut Outcome,
    ) {
        // A failed setup step makes the rest of the setup moot
        let setup_failed = outcome.error.is_some();

        match effect {
            Effect::StartPlayback => {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.activation = Some(self.new_activation(generation));

                match self.start_playback(generation) {
                    Ok(playback) => {
                        if let Some(activation) = state.activation.as_mut() {
                            activation.playback = Some(playback);
                        }
                    }
                    Err(e) => {
                        follow_ups.push_back(SessionEvent::PlaybackFailed(e.to_string()));
                        outcome.error = Some(e);
                    }
                }
            }
            Effect::StartCapture if !setup_failed => {
                let Some(activation) = state.activation.as_mut() else {
                    return;
                };
                let sink: Arc<dyn FrameSink> = Arc::new(activation.connection.clone());
                match CapturePipeline::start(
                    self.backend.input_device(),
                    self.config.sample_rate,
                    self.config.block_size,
                    self.config.capture_queue_blocks,
                    sink,
                ) {
                    Ok(capture) => activation.capture = Some(capture),
                    Err(e) => {
                        warn!("Capture failed to start: {}", e);
                        follow_ups.push_back(SessionEvent::CaptureFailed(e.to_string()));
                        outcome.error = Some(e.into());
                    }
                }
            }
            Effect::Connect if !setup_failed => {
                outcome.connect = state.activation.as_ref().map(|a| PendingConnect {
                    connection: a.connection.clone(),
                    generation: a.generation,
                });
            }
            Effect::StartCapture | Effect::Connect => {
                debug!("Skipping {:?} after a failed setup step", effect);
            }
            Effect::CloseConnection => {
                if let Some(activation) = state.activation.as_ref() {
                    activation.connection.close();
                }
            }
            Effect::StopCapture => {
                if let Some(mut capture) = state.activation.as_mut().and_then(|a| a.capture.take()) {
                    capture.stop();
                }
            }
            Effect::StopPlayback => {
                if let Some(playback) = state.activation.as_mut().and_then(|a| a.playback.take()) {
                    playback.stop();
                }
            }
            Effect::EnqueueAudio(data) => {
                if let Some(playback) = self.playback(state) {
                    playback.enqueue(&data);
                }
            }
            Effect::InterruptPlayback => {
                if let Some(playback) = self.playback(state) {
                    playback.interrupt();
                }
            }
            Effect::SendInterrupt => {
                if let Some(activation) = state.activation.as_ref() {
                    activation.connection.send(OutboundEvent::Interrupt);
                }
            }
            Effect::PlayCue => {
                if self.config.chime {
                    if let Some(playback) = self.playback(state) {
                        playback.play_cue(&self.cue);
                    }
                }
            }
            Effect::Status(update) => {
                info!("Status: {} ({})", update.state, update.text);
                let _ = self.updates_tx.send(SessionUpdate::Status(update));
            }
            Effect::Transcript(transcript) => {
                let _ = self.updates_tx.send(SessionUpdate::Transcript(transcript));
            }
        }
    }

    fn playback<'a>(&self, state: &'a ClientState) -> Option<&'a PlaybackPipeline> {
        state.activation.as_ref().and_then(|a| a.playback.as_ref())
    }

    fn new_activation(self: &Arc<Self>, generation: u64) -> Activation {
        let handler = Arc::new(SessionLink {
            client: Arc::downgrade(self),
            generation,
        });
        Activation {
            generation,
            connection: ConnectionManager::new(ConnectionOptions::from_config(&self.config), handler),
            playback: None,
            capture: None,
        }
    }

    fn start_playback(self: &Arc<Self>, generation: u64) -> Result<PlaybackPipeline> {
        let (events_tx, events_rx) = unbounded();
        let client = Arc::downgrade(self);

        thread::Builder::new()
            .name("voicelink-playback-events".into())
            .spawn(move || forward_playback_events(client, generation, events_rx))
            .map_err(|e| VoiceLinkError::Channel(format!("Failed to spawn event forwarder: {}", e)))?;

        let playback =
            PlaybackPipeline::start(self.backend.output_device(), self.config.sample_rate, events_tx)?;
        Ok(playback)
    }
}

fn is_current(state: &ClientState, generation: Option<u64>) -> bool {
    let Some(generation) = generation else {
        return true;
    };
    let current = state.activation.as_ref().map(|a| a.generation);
    if current != Some(generation) {
        debug!("Ignoring event from a previous activation");
        return false;
    }
    true
}

/// Active states hold their activation. Error keeps it only while the
/// connection is still open after a fatal server error, until the service
/// closes it.
fn holds_activation(state: &ClientState) -> bool {
    match state.session.state() {
        VoiceState::Inactive => false,
        VoiceState::Error => state
            .activation
            .as_ref()
            .is_some_and(|a| a.connection.state().is_connected()),
        _ => true,
    }
}

/// Runs until the playback queue (and so its sender) is gone
fn forward_playback_events(client: Weak<ClientInner>, generation: u64, events: Receiver<PlaybackEvent>) {
    for event in events {
        match event {
            PlaybackEvent::Started => debug!("Playback started"),
            PlaybackEvent::Complete => {
                let Some(client) = client.upgrade() else {
                    break;
                };
                client.apply_drained(generation);
            }
        }
    }
}

/// Routes one activation's connection events into the client
struct SessionLink {
    client: Weak<ClientInner>,
    generation: u64,
}

impl InboundHandler for SessionLink {
    fn on_event(&self, event: InboundEvent) {
        if let Some(client) = self.client.upgrade() {
            client.apply_inbound(self.generation, event);
        }
    }

    fn on_notice(&self, notice: ConnectionNotice) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        match notice {
            ConnectionNotice::Lost(err) => {
                debug!("Connection lost: {}", err);
                client.apply(Some(self.generation), SessionEvent::ConnectionLost);
            }
            ConnectionNotice::Reconnected(session) => {
                info!("Reconnected as session {}", session.session_id);
            }
        }
    }
}

/// Real-time voice client
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct VoiceClient {
    inner: Arc<ClientInner>,
}

impl VoiceClient {
    pub fn new(config: ClientConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        config.validate()?;
        let (updates_tx, updates_rx) = unbounded();
        let cue = rising_tones(config.sample_rate);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                backend,
                cue,
                state: Mutex::new(ClientState {
                    session: VoiceSession::new(),
                    activation: None,
                    next_generation: 1,
                }),
                updates_tx,
                updates_rx,
            }),
        })
    }

    /// Status updates and transcripts, in emission order
    pub fn updates(&self) -> Receiver<SessionUpdate> {
        self.inner.updates_rx.clone()
    }

    /// Start playback and capture, then connect.
    ///
    /// Returns once the service is ready or setup has failed; in the latter
    /// case the session is in [`VoiceState::Error`].
    pub async fn activate(&self) -> Result<()> {
        let outcome = self.inner.apply(None, SessionEvent::Activate);
        if let Some(error) = outcome.error {
            return Err(error);
        }
        let Some(pending) = outcome.connect else {
            return Ok(());
        };

        let endpoint = self.inner.config.endpoint().to_string();
        match pending.connection.connect(&endpoint).await {
            Ok(session) => {
                debug!("Connected with session {}", session.session_id);
                Ok(())
            }
            Err(e) => {
                self.inner
                    .apply(Some(pending.generation), SessionEvent::ConnectFailed(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Turn voice mode off: deliberate close, capture and playback released
    pub fn deactivate(&self) {
        self.inner.apply(None, SessionEvent::Deactivate);
    }

    /// The user asked to talk; also retries a suspended output path
    pub fn voice_gesture(&self) {
        {
            let state = self.inner.state.lock();
            if let Some(playback) = self.inner.playback(&state) {
                playback.resume_on_gesture();
            }
        }
        self.inner.apply(None, SessionEvent::VoiceGesture);
    }

    /// Stop the current response
    pub fn interrupt(&self) {
        self.inner.apply(None, SessionEvent::Interrupt);
    }

    pub fn state(&self) -> VoiceState {
        self.inner.state.lock().session.state()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner
            .state
            .lock()
            .activation
            .as_ref()
            .map_or(ConnectionState::Disconnected, |a| a.connection.state().get())
    }

    pub fn session(&self) -> Option<Session> {
        let state = self.inner.state.lock();
        state.activation.as_ref().and_then(|a| a.connection.session())
    }

    /// Segments waiting or playing
    pub fn playback_queue_len(&self) -> usize {
        let state = self.inner.state.lock();
        self.inner.playback(&state).map_or(0, |p| p.queue_len())
    }

    pub fn capture_stats(&self) -> Option<Arc<CaptureStats>> {
        let state = self.inner.state.lock();
        state
            .activation
            .as_ref()
            .and_then(|a| a.capture.as_ref())
            .map(|c| c.stats())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}
