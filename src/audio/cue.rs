//! Local acoustic cue played when recording starts

use std::f32::consts::PI;

const TONES_HZ: [f32; 3] = [660.0, 880.0, 1175.0];
const TONE_MS: u64 = 70;
const GAP_MS: u64 = 30;
const FADE_MS: u64 = 5;
const AMPLITUDE: f32 = 0.25;

fn frames(sample_rate: u32, ms: u64) -> usize {
    (u64::from(sample_rate) * ms / 1000) as usize
}

/// Three short tones of rising pitch at `sample_rate`
pub fn rising_tones(sample_rate: u32) -> Vec<f32> {
    let tone_len = frames(sample_rate, TONE_MS);
    let gap_len = frames(sample_rate, GAP_MS);
    let fade_len = frames(sample_rate, FADE_MS).max(1);

    let mut samples = Vec::with_capacity(TONES_HZ.len() * (tone_len + gap_len));
    for (i, &freq) in TONES_HZ.iter().enumerate() {
        for n in 0..tone_len {
            // Linear fade at both ends avoids clicks
            let envelope = (n.min(tone_len - 1 - n) as f32 / fade_len as f32).min(1.0);
            let phase = 2.0 * PI * freq * n as f32 / sample_rate as f32;
            samples.push(phase.sin() * AMPLITUDE * envelope);
        }
        if i + 1 < TONES_HZ.len() {
            samples.extend(std::iter::repeat(0.0).take(gap_len));
        }
    }
    samples
}
