//! Playback pipeline for synthesized speech
//!
//! Segments are queued in arrival order behind a single now-playing slot.
//! The output device pulls samples through [`PlaybackQueue::render`], which
//! crosses segment boundaries inside one buffer so consecutive segments play
//! without a software gap. When the device runs at another rate, one
//! resampler carries filter state across segments, so joins stay seamless
//! there too.

use super::{resample_audio, OutputDevice, PlaybackError, StreamResampler};
use crate::codec::decode_inbound;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Notifications from the playback side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The queue went from idle to busy
    Started,
    /// Everything queued has been rendered or discarded
    Complete,
}

#[derive(Debug)]
struct Segment {
    seq: u64,
    samples: Vec<f32>,
}

#[derive(Debug)]
struct ActiveSegment {
    seq: u64,
    samples: Vec<f32>,
    position: usize,
}

impl ActiveSegment {
    fn remaining(&self) -> &[f32] {
        &self.samples[self.position..]
    }
}

impl From<Segment> for ActiveSegment {
    fn from(segment: Segment) -> Self {
        Self {
            seq: segment.seq,
            samples: segment.samples,
            position: 0,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Segment>,
    now_playing: Option<ActiveSegment>,
    /// Local cue, mixed on top and unaffected by interrupts
    cue: Option<ActiveSegment>,
    next_seq: u64,
}

impl QueueState {
    fn is_playing(&self) -> bool {
        self.now_playing.is_some() || !self.pending.is_empty()
    }
}

/// Ordered segment queue shared between the client and the output callback
#[derive(Clone)]
pub struct PlaybackQueue {
    state: Arc<Mutex<QueueState>>,
    events: Sender<PlaybackEvent>,
}

impl PlaybackQueue {
    pub fn new(events: Sender<PlaybackEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            events,
        }
    }

    /// Append a segment to the tail. Returns its arrival sequence number.
    pub fn push(&self, samples: Vec<f32>) -> u64 {
        let (seq, was_playing) = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            let was_playing = state.is_playing();
            state.pending.push_back(Segment { seq, samples });
            (seq, was_playing)
        };
        debug!("Queued segment {}", seq);

        if !was_playing {
            self.notify(PlaybackEvent::Started);
        }
        seq
    }

    /// Drop the active segment and everything queued.
    /// Returns true if anything was playing.
    pub fn clear(&self) -> bool {
        let was_playing = {
            let mut state = self.state.lock();
            let was_playing = state.is_playing();
            state.now_playing = None;
            state.pending.clear();
            was_playing
        };

        if was_playing {
            self.notify(PlaybackEvent::Complete);
        }
        was_playing
    }

    /// Mix a short local sound over whatever is playing
    pub fn play_cue(&self, samples: Vec<f32>) {
        self.state.lock().cue = Some(ActiveSegment {
            seq: 0,
            samples,
            position: 0,
        });
    }

    /// Fill `out` with mono samples, silence where nothing is queued.
    /// Returns the number of frames taken from speech segments.
    pub fn render(&self, out: &mut [f32]) -> usize {
        let (written, finished) = {
            let mut state = self.state.lock();
            let was_playing = state.is_playing();
            let mut written = 0;

            while written < out.len() {
                if state.now_playing.is_none() {
                    match state.pending.pop_front() {
                        Some(next) => state.now_playing = Some(next.into()),
                        None => break,
                    }
                }

                let Some(active) = state.now_playing.as_mut() else {
                    break;
                };
                let remaining = active.remaining();
                let n = remaining.len().min(out.len() - written);
                out[written..written + n].copy_from_slice(&remaining[..n]);
                active.position += n;
                written += n;

                if active.position >= active.samples.len() {
                    state.now_playing = None;
                }
            }
            out[written..].fill(0.0);

            if let Some(cue) = state.cue.as_mut() {
                let remaining = cue.remaining();
                let n = remaining.len().min(out.len());
                for (dst, src) in out[..n].iter_mut().zip(remaining) {
                    *dst = (*dst + *src).clamp(-1.0, 1.0);
                }
                cue.position += n;
                if cue.position >= cue.samples.len() {
                    state.cue = None;
                }
            }

            (written, was_playing && !state.is_playing())
        };

        if finished {
            self.notify(PlaybackEvent::Complete);
        }
        written
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().is_playing()
    }

    /// Segments not yet finished, including the one rendering
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + usize::from(state.now_playing.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the segment currently rendering
    pub fn now_playing(&self) -> Option<u64> {
        self.state.lock().now_playing.as_ref().map(|s| s.seq)
    }

    fn notify(&self, event: PlaybackEvent) {
        // Never block the audio callback
        if let Err(e) = self.events.try_send(event) {
            debug!("Dropped playback event {:?}: {}", event, e);
        }
    }
}

/// Owns the output device and the queue it renders from
pub struct PlaybackPipeline {
    queue: PlaybackQueue,
    device: Mutex<Box<dyn OutputDevice>>,
    /// Present when the device does not run at the wire rate
    resampler: Option<Mutex<StreamResampler>>,
    wire_rate: u32,
    device_rate: u32,
    suspended: AtomicBool,
}

impl PlaybackPipeline {
    /// Acquire the output device and try to start the output path.
    ///
    /// A suspended output engine is not an error here; it is retried before
    /// each enqueue and on the next user gesture.
    pub fn start(
        mut device: Box<dyn OutputDevice>,
        wire_rate: u32,
        events: Sender<PlaybackEvent>,
    ) -> Result<Self, PlaybackError> {
        let queue = PlaybackQueue::new(events);
        let device_rate = device.open(wire_rate, queue.clone())?;
        info!(
            "Playback ready: wire {}Hz, device {}Hz",
            wire_rate, device_rate
        );

        let resampler = if device_rate != wire_rate {
            match StreamResampler::new(wire_rate, device_rate) {
                Ok(resampler) => Some(Mutex::new(resampler)),
                Err(e) => {
                    device.close();
                    return Err(PlaybackError::Device(e.to_string()));
                }
            }
        } else {
            None
        };

        let pipeline = Self {
            queue,
            device: Mutex::new(device),
            resampler,
            wire_rate,
            device_rate,
            suspended: AtomicBool::new(true),
        };
        pipeline.try_resume();
        Ok(pipeline)
    }

    /// Decode a received segment and append it to the queue.
    /// Segments that fail to decode are dropped.
    ///
    /// Off the wire rate, up to one resampler chunk of the newest audio is
    /// held back until more arrives or [`finish_response`] releases it.
    ///
    /// [`finish_response`]: PlaybackPipeline::finish_response
    pub fn enqueue(&self, data: &str) {
        let samples = match decode_inbound(data) {
            Ok(samples) => samples,
            Err(e) => {
                warn!("Dropping undecodable audio segment: {}", e);
                return;
            }
        };
        if samples.is_empty() {
            debug!("Ignoring empty audio segment");
            return;
        }

        let samples = match self.resampler.as_ref() {
            Some(resampler) => match resampler.lock().process(&samples) {
                Ok(resampled) => resampled,
                Err(e) => {
                    warn!("Dropping audio segment that failed to resample: {}", e);
                    return;
                }
            },
            None => samples,
        };

        if self.is_suspended() {
            self.try_resume();
        }
        if !samples.is_empty() {
            self.queue.push(samples);
        }
    }

    /// The service finished sending the current response; queue whatever
    /// the resampler still holds.
    pub fn finish_response(&self) {
        let Some(resampler) = self.resampler.as_ref() else {
            return;
        };
        match resampler.lock().flush() {
            Ok(tail) if !tail.is_empty() => {
                self.queue.push(tail);
            }
            Ok(_) => {}
            Err(e) => warn!("Dropping resampler tail: {}", e),
        }
    }

    /// Stop the active segment and discard everything queued
    pub fn interrupt(&self) {
        self.reset_resampler();
        if self.queue.clear() {
            info!("Playback interrupted");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.queue.is_playing()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Play the local cue, given at the wire rate
    pub fn play_cue(&self, samples: &[f32]) {
        match resample_audio(samples, self.wire_rate, self.device_rate) {
            Ok(resampled) => self.queue.play_cue(resampled),
            Err(e) => warn!("Failed to prepare cue: {}", e),
        }
    }

    /// Retry a suspended output path after a user gesture
    pub fn resume_on_gesture(&self) {
        if self.is_suspended() {
            self.try_resume();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Release the output device and drop anything queued
    pub fn stop(&self) {
        self.reset_resampler();
        self.queue.clear();
        self.device.lock().close();
    }

    fn reset_resampler(&self) {
        if let Some(resampler) = self.resampler.as_ref() {
            resampler.lock().reset();
        }
    }

    fn try_resume(&self) {
        match self.device.lock().resume() {
            Ok(()) => {
                if self.suspended.swap(false, Ordering::SeqCst) {
                    debug!("Output path running");
                }
            }
            Err(e) => {
                self.suspended.store(true, Ordering::SeqCst);
                warn!("Output path still suspended: {}", e);
            }
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.device.get_mut().close();
    }
}
