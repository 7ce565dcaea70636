//! Sample codec for the wire format
//!
//! Outbound: f32 samples -> clamped i16 little-endian PCM -> base64 text.
//! Inbound: the exact inverse, normalizing by 32768.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

/// Scale applied to negative samples (and used to normalize on decode)
const NEG_SCALE: f32 = 32768.0;

/// Scale applied to non-negative samples, keeps +1.0 inside i16
const POS_SCALE: f32 = 32767.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid transport encoding: {0}")]
    Transport(String),

    #[error("payload of {0} bytes is not a whole number of 16-bit samples")]
    OddLength(usize),
}

/// Encode one captured block for transmission.
pub fn encode_outbound(samples: &[f32]) -> String {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    BASE64.encode(&pcm)
}

/// Decode one received segment into normalized samples.
pub fn decode_inbound(text: &str) -> Result<Vec<f32>, DecodeError> {
    let pcm = BASE64
        .decode(text.trim())
        .map_err(|e| DecodeError::Transport(e.to_string()))?;

    if pcm.len() % 2 != 0 {
        return Err(DecodeError::OddLength(pcm.len()));
    }

    Ok(pcm
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / NEG_SCALE)
        .collect())
}

#[inline]
fn quantize(sample: f32) -> i16 {
    // NaN clamps to NaN; treat it as silence
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * NEG_SCALE) as i16
    } else {
        (s * POS_SCALE) as i16
    }
}
