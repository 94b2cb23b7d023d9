//! # Audio Decoding
//!
//! Turns an uploaded WAV file into the 16 kHz mono f32 sample stream the
//! Whisper encoder expects. Multi-channel input is downmixed and anything
//! not already at 16 kHz is linearly resampled.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::Path;

/// Sample rate required by the Whisper mel frontend.
pub const SAMPLE_RATE: u32 = 16_000;

/// Decode a WAV file into 16 kHz mono f32 samples in [-1.0, 1.0].
pub fn load_wav(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read audio file {:?}", path))?;
    sniff_riff_header(&bytes)?;

    let mut reader = Cursor::new(bytes);
    let (header, data) = wav::read(&mut reader)
        .with_context(|| format!("Failed to parse WAV data in {:?}", path))?;

    let samples = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => pcm_to_float(&samples),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    if samples.is_empty() {
        return Err(anyhow!("WAV file {:?} contains no samples", path));
    }

    let mono = downmix(samples, header.channel_count as usize);
    Ok(resample(mono, header.sampling_rate, SAMPLE_RATE))
}

/// Check the RIFF/WAVE magic before handing the bytes to the WAV parser.
///
/// The parser's own errors are terse; failing here produces a message that
/// names the actual container format problem.
fn sniff_riff_header(bytes: &[u8]) -> Result<()> {
    if bytes.len() < 12 {
        return Err(anyhow!("Audio payload too short to be a WAV file"));
    }
    let mut cursor = Cursor::new(bytes);
    let riff = cursor.read_u32::<LittleEndian>()?;
    let _chunk_size = cursor.read_u32::<LittleEndian>()?;
    let wave = cursor.read_u32::<LittleEndian>()?;
    // "RIFF" and "WAVE" as little-endian u32s
    if riff != u32::from_le_bytes(*b"RIFF") || wave != u32::from_le_bytes(*b"WAVE") {
        return Err(anyhow!("Audio payload is not a RIFF/WAVE file"));
    }
    Ok(())
}

/// Convert 16-bit PCM samples to floats in [-1.0, 1.0].
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Average interleaved channels down to mono.
fn downmix(samples: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples;
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler. Adequate for speech input.
fn resample(samples: Vec<f32>, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples;
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples.get(idx + 1).copied().unwrap_or(a);
        out.push(a + (b - a) * frac);
    }
    out
}
