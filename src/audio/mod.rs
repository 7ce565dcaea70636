//! Audio capture and playback
//!
//! Devices sit behind the [`InputDevice`] / [`OutputDevice`] traits so the
//! pipelines can run against cpal in the binary and against scripted devices
//! in tests.

pub mod capture;
pub mod cue;
#[cfg(feature = "audio-io")]
pub mod input;
#[cfg(feature = "audio-io")]
pub mod output;
pub mod playback;
pub mod resampler;

pub use capture::{CaptureHandle, CapturePipeline, CaptureStats, ChunkSender, FrameSink};
pub use cue::rising_tones;
#[cfg(feature = "audio-io")]
pub use input::CpalInput;
#[cfg(feature = "audio-io")]
pub use output::CpalOutput;
pub use playback::{PlaybackEvent, PlaybackPipeline, PlaybackQueue};
pub use resampler::{resample_audio, StreamResampler};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("no input device available")]
    NoDevice,

    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("input device error: {0}")]
    Device(String),

    #[error("capture processing error: {0}")]
    Processing(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("no output device available")]
    NoDevice,

    #[error("output device error: {0}")]
    Device(String),

    #[error("output engine is suspended: {0}")]
    Suspended(String),
}

/// A microphone that delivers mono f32 chunks from its realtime callback
pub trait InputDevice: Send {
    /// Acquire the device and start delivering chunks on `chunks`.
    ///
    /// Implementations must never block in the callback; a full channel
    /// drops the chunk. Returns the rate the device actually runs at.
    fn open(&mut self, preferred_rate: u32, chunks: ChunkSender) -> Result<u32, CaptureError>;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// A speaker that pulls mono f32 samples from a [`PlaybackQueue`]
pub trait OutputDevice: Send {
    /// Acquire the device and build a stream rendering from `source`.
    /// The stream may start suspended. Returns the device rate.
    fn open(&mut self, preferred_rate: u32, source: PlaybackQueue) -> Result<u32, PlaybackError>;

    /// Start or restart the output path
    fn resume(&mut self) -> Result<(), PlaybackError>;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// Factory for the devices of one activation
pub trait AudioBackend: Send + Sync {
    fn input_device(&self) -> Box<dyn InputDevice>;
    fn output_device(&self) -> Box<dyn OutputDevice>;
}

/// The default cpal host
#[cfg(feature = "audio-io")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

#[cfg(feature = "audio-io")]
impl AudioBackend for CpalBackend {
    fn input_device(&self) -> Box<dyn InputDevice> {
        Box::new(CpalInput::new())
    }

    fn output_device(&self) -> Box<dyn OutputDevice> {
        Box::new(CpalOutput::new())
    }
}

/// Average interleaved frames down to mono
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        data.to_vec()
    } else {
        data.chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}
