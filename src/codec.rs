//! PCM codec
//!
//! Converts normalized f32 samples to 16-bit little-endian PCM and wraps the
//! bytes in base64 so they can travel inside text protocols. The inverse
//! direction decodes service audio back into an [`AudioFrame`].
//!
//! All functions here are pure and synchronous.

use crate::error::CodecError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::SystemTime;

/// MIME type prefix for raw 16-bit little-endian PCM
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Sample rate of captured microphone audio
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Sample rate of synthesized speech from the service
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Immutable buffer of signed 16-bit samples (interleaved if multichannel)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    produced_at: SystemTime,
}

impl AudioFrame {
    /// Create a frame stamped with the current wall-clock time
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            produced_at: SystemTime::now(),
        }
    }

    /// Build a frame from normalized f32 samples
    pub fn from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        Self::new(
            samples.iter().map(|&s| f32_to_i16(s)).collect(),
            sample_rate,
            channels,
        )
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn produced_at(&self) -> SystemTime {
        self.produced_at
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of sample frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback duration of this frame in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Samples converted back to normalized f32
    pub fn to_f32(&self) -> Vec<f32> {
        samples_to_f32(&self.samples)
    }
}

/// Transport-safe serialization of an [`AudioFrame`]
///
/// Not `Clone`: a frame is handed to the transport exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    data: String,
    mime_type: String,
}

impl EncodedFrame {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Base64 payload
    pub fn data(&self) -> &str {
        &self.data
    }

    /// MIME-style tag, e.g. `audio/pcm;rate=16000`
    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Split into (payload, tag) for serialization
    pub fn into_parts(self) -> (String, String) {
        (self.data, self.mime_type)
    }

    /// Sample rate declared by the tag, if any
    fn declared_rate(&self) -> Result<Option<u32>, CodecError> {
        parse_pcm_tag(&self.mime_type)
    }
}

/// Build the MIME tag for PCM at the given rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{};rate={}", PCM_MIME_PREFIX, sample_rate)
}

/// Parse `audio/pcm[;rate=N]`, returning the declared rate
fn parse_pcm_tag(tag: &str) -> Result<Option<u32>, CodecError> {
    let mut parts = tag.split(';').map(str::trim);
    let base = parts.next().unwrap_or_default();
    if !base.eq_ignore_ascii_case(PCM_MIME_PREFIX) {
        return Err(CodecError::InvalidTag(tag.to_string()));
    }

    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("rate") {
                return value
                    .trim()
                    .parse::<u32>()
                    .map(Some)
                    .map_err(|_| CodecError::InvalidTag(tag.to_string()));
            }
        }
    }

    Ok(None)
}

/// Clamp to [-1, 1] and scale by 32767 so +1.0 does not overflow
fn f32_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clamped * 32767.0).round() as i16
}

/// Convert i16 samples to f32 by dividing by 32768
pub fn samples_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

fn pack_le(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Encode normalized samples for the outbound channel
pub fn encode_outbound(samples: &[f32], sample_rate: u32) -> EncodedFrame {
    let pcm: Vec<i16> = samples.iter().map(|&s| f32_to_i16(s)).collect();
    EncodedFrame::new(STANDARD.encode(pack_le(&pcm)), pcm_mime_type(sample_rate))
}

/// Encode an already-quantized frame for the outbound channel
pub fn encode_frame(frame: &AudioFrame) -> EncodedFrame {
    EncodedFrame::new(
        STANDARD.encode(pack_le(frame.samples())),
        pcm_mime_type(frame.sample_rate()),
    )
}

/// Decode an inbound frame into PCM samples
///
/// The declared rate must match `expected_rate`. A trailing partial sample
/// is dropped with a warning rather than failing the frame.
pub fn decode_inbound(
    frame: &EncodedFrame,
    channels: u16,
    expected_rate: u32,
) -> Result<AudioFrame, CodecError> {
    if channels == 0 {
        return Err(CodecError::InvalidChannels(channels));
    }

    if let Some(actual) = frame.declared_rate()? {
        if actual != expected_rate {
            return Err(CodecError::RateMismatch {
                expected: expected_rate,
                actual,
            });
        }
    }

    let bytes = STANDARD.decode(frame.data().trim())?;

    let stride = channels as usize * 2;
    let aligned = bytes.len() - bytes.len() % stride;
    if aligned != bytes.len() {
        tracing::debug!(
            "Inbound audio misaligned: {} bytes, dropping {} trailing byte(s)",
            bytes.len(),
            bytes.len() - aligned
        );
    }

    let samples = bytes[..aligned]
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    Ok(AudioFrame::new(samples, expected_rate, channels))
}
