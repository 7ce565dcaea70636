use super::{CaptureError, ChunkSender, InputDevice};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig, SupportedStreamConfig,
};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Default cpal microphone
///
/// cpal streams are not `Send`, so the stream lives on its own thread for as
/// long as the device is open.
#[derive(Default)]
pub struct CpalInput {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    /// Chunks the callback could not queue
    overruns: Arc<AtomicU64>,
}

impl CpalInput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputDevice for CpalInput {
    fn open(&mut self, preferred_rate: u32, chunks: ChunkSender) -> Result<u32, CaptureError> {
        self.close();

        let (ready_tx, ready_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let overruns = Arc::clone(&self.overruns);

        let thread = thread::Builder::new()
            .name("voicelink-mic".into())
            .spawn(move || match open_stream(preferred_rate, chunks, overruns) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    // Hold the stream until told to stop or the owner goes away
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Input stream released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| CaptureError::Device(format!("Failed to spawn input thread: {}", e)))?;

        let rate = ready_rx
            .recv()
            .map_err(|_| CaptureError::Device("Input thread exited during setup".into()))??;

        self.stop_tx = Some(stop_tx);
        self.thread = Some(thread);
        Ok(rate)
    }

    fn close(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Input thread panicked");
            }
            let overruns = self.overruns.swap(0, Ordering::Relaxed);
            if overruns > 0 {
                debug!("Capture queue was full for {} callback(s)", overruns);
            }
            info!("Stopped audio recording");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(
    preferred_rate: u32,
    chunks: ChunkSender,
    overruns: Arc<AtomicU64>,
) -> Result<(Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = choose_config(&device, preferred_rate)?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    // cpal exposes no voice processing switches
    debug!("Echo cancellation, noise suppression and gain control are not available on this host");

    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, chunks, overruns),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, chunks, overruns),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, chunks, overruns),
        other => {
            return Err(CaptureError::Device(format!(
                "Unsupported input sample format: {:?}",
                other
            )))
        }
    }
    .map_err(map_build_error)?;

    stream.play().map_err(|e| {
        let message = e.to_string();
        if looks_like_permission(&message) {
            CaptureError::PermissionDenied(message)
        } else {
            CaptureError::Device(format!("Failed to start input stream: {}", message))
        }
    })?;

    info!("Started audio recording: {} Hz, {} channel(s)", rate, config.channels);
    Ok((stream, rate))
}

/// Prefer mono at the wire rate, then any channel count at it, then the default
fn choose_config(device: &Device, preferred_rate: u32) -> Result<SupportedStreamConfig, CaptureError> {
    let wanted = SampleRate(preferred_rate);

    match device.supported_input_configs() {
        Ok(ranges) => {
            let ranges: Vec<_> = ranges
                .filter(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
                .collect();

            if let Some(range) = ranges.iter().find(|r| r.channels() == 1) {
                return Ok(range.clone().with_sample_rate(wanted));
            }
            if let Some(range) = ranges.into_iter().next() {
                return Ok(range.with_sample_rate(wanted));
            }
        }
        Err(e) => warn!("Could not list input configs: {}", e),
    }

    device
        .default_input_config()
        .map_err(|e| CaptureError::Device(format!("Failed to get input config: {}", e)))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    chunks: ChunkSender,
    overruns: Arc<AtomicU64>,
) -> Result<Stream, BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let result = chunks.try_fill(|buf| {
                buf.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / channels as f32
                }))
            });
            if let Err(TrySendError::Full(_)) = result {
                overruns.fetch_add(1, Ordering::Relaxed);
            }
        },
        |err| error!("Audio input stream error: {}", err),
        None,
    )
}

fn map_build_error(e: BuildStreamError) -> CaptureError {
    match e {
        BuildStreamError::DeviceNotAvailable => CaptureError::NoDevice,
        other => {
            let message = other.to_string();
            if looks_like_permission(&message) {
                CaptureError::PermissionDenied(message)
            } else {
                CaptureError::Device(format!("Failed to build input stream: {}", message))
            }
        }
    }
}

fn looks_like_permission(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
}
