//! Raw PCM file loading
//!
//! Files are headerless interleaved 16-bit little-endian samples, laid out
//! exactly as the engine plays them.

use anyhow::{bail, Context, Result};
use std::path::Path;

use playstream_core::audio::SampleFormat;

/// Read a raw 16-bit little-endian PCM file into interleaved samples
pub fn load_pcm_file(path: &Path) -> Result<Vec<i16>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read PCM file: {:?}", path))?;
    let samples = decode_pcm_i16(&bytes);
    if samples.is_empty() {
        bail!("PCM file {:?} holds no samples", path);
    }
    log::info!("[PCM] Loaded {} samples from {:?}", samples.len(), path);
    Ok(samples)
}

fn decode_pcm_i16(bytes: &[u8]) -> Vec<i16> {
    let chunks = bytes.chunks_exact(SampleFormat::I16.bytes_per_sample());
    if !chunks.remainder().is_empty() {
        log::warn!("[PCM] Ignoring {} trailing byte(s)", chunks.remainder().len());
    }
    chunks.map(|b| i16::from_le_bytes([b[0], b[1]])).collect()
}
