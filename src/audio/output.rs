use super::{OutputDevice, PlaybackError, PlaybackQueue};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream,
    StreamConfig, SupportedStreamConfig,
};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

enum OutputCommand {
    Resume(Sender<Result<(), PlaybackError>>),
    Shutdown,
}

/// Default cpal speaker rendering from a [`PlaybackQueue`]
///
/// The stream is built paused on a dedicated thread; [`OutputDevice::resume`]
/// starts it.
#[derive(Default)]
pub struct CpalOutput {
    commands: Option<Sender<OutputCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputDevice for CpalOutput {
    fn open(&mut self, preferred_rate: u32, source: PlaybackQueue) -> Result<u32, PlaybackError> {
        self.close();

        let (ready_tx, ready_rx) = bounded(1);
        let (command_tx, command_rx) = unbounded::<OutputCommand>();

        let thread = thread::Builder::new()
            .name("voicelink-speaker".into())
            .spawn(move || {
                let (stream, rate) = match open_stream(preferred_rate, source) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rate));

                while let Ok(command) = command_rx.recv() {
                    match command {
                        OutputCommand::Resume(reply) => {
                            let result = stream
                                .play()
                                .map_err(|e| PlaybackError::Suspended(e.to_string()));
                            let _ = reply.send(result);
                        }
                        OutputCommand::Shutdown => break,
                    }
                }

                drop(stream);
                debug!("Output stream released");
            })
            .map_err(|e| PlaybackError::Device(format!("Failed to spawn output thread: {}", e)))?;

        let rate = ready_rx
            .recv()
            .map_err(|_| PlaybackError::Device("Output thread exited during setup".into()))??;

        self.commands = Some(command_tx);
        self.thread = Some(thread);
        Ok(rate)
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| PlaybackError::Device("Output device is not open".into()))?;

        let (reply_tx, reply_rx) = bounded(1);
        commands
            .send(OutputCommand::Resume(reply_tx))
            .map_err(|_| PlaybackError::Device("Output thread is gone".into()))?;
        reply_rx
            .recv()
            .map_err(|_| PlaybackError::Device("Output thread is gone".into()))?
    }

    fn close(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(OutputCommand::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Output thread panicked");
            }
            info!("Stopped audio playback");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(preferred_rate: u32, source: PlaybackQueue) -> Result<(Stream, u32), PlaybackError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(PlaybackError::NoDevice)?;

    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = choose_config(&device, preferred_rate)?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let rate = config.sample_rate.0;

    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, source),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, source),
        SampleFormat::U16 => build_stream::<u16>(&device, &config, source),
        other => {
            return Err(PlaybackError::Device(format!(
                "Unsupported output sample format: {:?}",
                other
            )))
        }
    }
    .map_err(|e| match e {
        BuildStreamError::DeviceNotAvailable => PlaybackError::NoDevice,
        other => PlaybackError::Device(format!("Failed to build output stream: {}", other)),
    })?;

    // Some hosts start streams on build; keep it paused until resumed
    if let Err(e) = stream.pause() {
        debug!("Could not pause new output stream: {}", e);
    }

    info!("Output ready: {} Hz, {} channel(s)", rate, config.channels);
    Ok((stream, rate))
}

fn choose_config(device: &Device, preferred_rate: u32) -> Result<SupportedStreamConfig, PlaybackError> {
    let wanted = SampleRate(preferred_rate);

    match device.supported_output_configs() {
        Ok(mut ranges) => {
            if let Some(range) =
                ranges.find(|r| r.min_sample_rate() <= wanted && wanted <= r.max_sample_rate())
            {
                return Ok(range.with_sample_rate(wanted));
            }
        }
        Err(e) => warn!("Could not list output configs: {}", e),
    }

    device
        .default_output_config()
        .map_err(|e| PlaybackError::Device(format!("Failed to get output config: {}", e)))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    source: PlaybackQueue,
) -> Result<Stream, BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            scratch.resize(frames, 0.0);
            source.render(&mut scratch);

            for (frame, &sample) in data.chunks_mut(channels).zip(scratch.iter()) {
                for out in frame.iter_mut() {
                    *out = T::from_sample(sample);
                }
            }
        },
        |err| error!("Audio output stream error: {}", err),
        None,
    )
}
