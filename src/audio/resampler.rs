use crate::{Result, VoiceLinkError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Frames per resampler call
const CHUNK_SIZE: usize = 1024;

fn sinc_resampler(input_rate: u32, output_rate: u32) -> Result<SincFixedIn<f32>> {
    if input_rate == 0 || output_rate == 0 {
        return Err(VoiceLinkError::AudioProcessing(
            "Sample rates must be greater than 0".into(),
        ));
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };

    SincFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        2.0,
        params,
        CHUNK_SIZE,
        1,
    )
    .map_err(|e| VoiceLinkError::AudioProcessing(format!("Failed to create resampler: {}", e)))
}

/// Mono resampler for a continuous stream
///
/// Buffers input until a full chunk is available so consecutive calls join
/// without padding. Output is aligned with the input: the filter's delay is
/// dropped from the front and [`StreamResampler::flush`] releases the tail.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    ratio: f64,
    pending: Vec<f32>,
    /// Leading output frames still owed to the filter delay
    skip: usize,
    fed: usize,
    emitted: usize,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self> {
        let resampler = sinc_resampler(input_rate, output_rate)?;
        debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);
        Ok(Self {
            skip: resampler.output_delay(),
            resampler,
            ratio: output_rate as f64 / input_rate as f64,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
            fed: 0,
            emitted: 0,
        })
    }

    /// Feed samples, returning whatever output is ready
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        self.pending.extend_from_slice(input);
        self.fed += input.len();
        let mut output = Vec::new();
        self.run_chunks(&mut output)?;
        Ok(output)
    }

    /// Release everything still held back by buffering and filter delay,
    /// then start over from a clean state.
    ///
    /// The total output since the last reset is the input length scaled by
    /// the rate ratio.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let expected = (self.fed as f64 * self.ratio).round() as usize;
        let mut output = Vec::new();

        while self.emitted < expected {
            // Silence pushes the tail through the filter
            let needed = self.resampler.input_frames_next();
            self.pending.resize(needed.max(self.pending.len()), 0.0);
            self.run_chunks(&mut output)?;
        }

        let excess = self.emitted.saturating_sub(expected);
        output.truncate(output.len().saturating_sub(excess));
        self.reset();
        Ok(output)
    }

    /// Input frames accepted but not yet turned into output
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Discard buffered input and filter state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
        self.skip = self.resampler.output_delay();
        self.fed = 0;
        self.emitted = 0;
    }

    fn run_chunks(&mut self, output: &mut Vec<f32>) -> Result<()> {
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                return Ok(());
            }

            let out = self
                .resampler
                .process(&[&self.pending[..needed]], None)
                .map_err(|e| VoiceLinkError::AudioProcessing(format!("Resampling failed: {}", e)))?;
            self.pending.drain(..needed);

            let chunk = &out[0];
            let skipped = self.skip.min(chunk.len());
            self.skip -= skipped;
            output.extend_from_slice(&chunk[skipped..]);
            self.emitted += chunk.len() - skipped;
        }
    }
}

/// Resample a complete mono segment in one step
pub fn resample_audio(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == output_rate {
        return Ok(input.to_vec());
    }
    let mut resampler = StreamResampler::new(input_rate, output_rate)?;
    let mut output = resampler.process(input)?;
    output.extend(resampler.flush()?);
    Ok(output)
}
