use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use lofty::file::AudioFile;
use std::path::Path;
use std::time::Duration;

/// Sample rate of the live-broadcast PCM stream.
pub const STREAM_SAMPLE_RATE: u32 = 16_000;

/// Decode a base64 audio payload, stripping an optional `data:…;base64,` prefix.
pub fn decode_audio_payload(payload: &str) -> Result<Vec<u8>, String> {
    let raw = match payload.split_once("base64,") {
        Some((_, tail)) => tail,
        None => payload,
    };
    BASE64
        .decode(raw.trim())
        .map_err(|e| format!("Invalid base64 audio payload: {}", e))
}

/// Wrap raw signed-16-bit little-endian mono PCM in a minimal WAV container.
pub fn wrap_pcm_in_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let channels: u16 = 1;
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Probe the playable duration of a media file.
pub fn probe_duration(path: &Path) -> Result<Duration, String> {
    let tagged_file = lofty::read_from_path(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
    Ok(tagged_file.properties().duration())
}
