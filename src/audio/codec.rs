//! # PCM Framer/Codec
//!
//! Converts captured floating point audio into the wire format of the remote
//! session and back.
//!
//! ## Wire Format:
//! - **Sample encoding**: 16-bit signed integers, little-endian
//! - **Transport encoding**: standard base64 text
//! - **Descriptor**: MIME-like `audio/pcm;rate=<hz>`
//!
//! ## Lossy vs. Lossless:
//! Quantizing a float to 16 bits is one-way. Everything after that (bytes to
//! text and back) is exact, so `decode(encode(s))` always yields
//! `quantize16(s)`.

use crate::audio::frame::{AudioFrame, CAPTURE_SAMPLE_RATE, PCM16_SCALE};
use crate::error::{WidgetError, WidgetResult};
use base64::{engine::general_purpose, Engine as _};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Encoding and rate of a PCM16 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
}

impl PcmFormat {
    /// Name of the only encoding the widget speaks.
    pub const ENCODING: &'static str = "pcm16";

    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Render as the MIME-like descriptor carried next to the payload.
    pub fn mime_type(&self) -> String {
        format!("{};rate={}", PCM_MIME_PREFIX, self.sample_rate)
    }

    /// Parse `audio/pcm;rate=24000`. Returns None for anything that is not
    /// PCM or has no readable rate.
    pub fn parse(mime_type: &str) -> Option<Self> {
        let mut parts = mime_type.split(';').map(str::trim);
        if !parts.next()?.eq_ignore_ascii_case(PCM_MIME_PREFIX) {
            return None;
        }

        parts
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
            .and_then(|(_, value)| value.trim().parse().ok())
            .filter(|&rate| rate > 0)
            .map(Self::new)
    }
}

/// A frame's bytes rendered as transport-safe text plus its descriptor.
///
/// Serializes as `{"mimeType": "...", "data": "..."}`, the blob shape used
/// by the remote session in both directions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPacket {
    pub mime_type: String,
    pub data: String,
}

impl EncodedPacket {
    /// Descriptor parsed from the MIME type, if it is PCM.
    pub fn format(&self) -> Option<PcmFormat> {
        PcmFormat::parse(&self.mime_type)
    }

    /// Size of the decoded payload in bytes, without decoding it.
    pub fn payload_len(&self) -> usize {
        let padding = self.data.bytes().rev().take_while(|&b| b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding)
    }
}

/// The 16-bit truncation applied to every captured sample.
///
/// Scales by 32768 and truncates toward zero. Values outside [-1, 1] are the
/// caller's responsibility and saturate at the i16 bounds.
pub fn quantize16(sample: f32) -> i16 {
    (sample * PCM16_SCALE) as i16
}

/// Encode captured float samples as a 16 kHz PCM16 packet.
pub fn encode(samples: &[f32]) -> EncodedPacket {
    encode_at(samples, CAPTURE_SAMPLE_RATE)
}

/// Encode float samples tagged with another rate.
pub fn encode_at(samples: &[f32], sample_rate: u32) -> EncodedPacket {
    let quantized: Vec<i16> = samples.iter().map(|&s| quantize16(s)).collect();
    encode_pcm(&quantized, sample_rate)
}

/// Encode already-quantized samples at an arbitrary rate.
pub fn encode_pcm(samples: &[i16], sample_rate: u32) -> EncodedPacket {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);

    EncodedPacket {
        mime_type: PcmFormat::new(sample_rate).mime_type(),
        data: general_purpose::STANDARD.encode(&bytes),
    }
}

/// Decode a packet into a frame at the given rate and channel count.
pub fn decode(packet: &EncodedPacket, sample_rate: u32, channels: u16) -> WidgetResult<AudioFrame> {
    let bytes = general_purpose::STANDARD.decode(packet.data.as_bytes())?;
    decode_bytes(&bytes, sample_rate, channels)
}

/// Decode raw little-endian PCM16 bytes into a frame.
///
/// ## Validation:
/// The byte count must be a whole multiple of `2 × channels`. A trailing
/// partial sample is rejected with `MalformedFrame`, never truncated.
pub fn decode_bytes(bytes: &[u8], sample_rate: u32, channels: u16) -> WidgetResult<AudioFrame> {
    if channels == 0 {
        return Err(WidgetError::MalformedFrame("channel count must be greater than 0".to_string()));
    }

    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(WidgetError::MalformedFrame(format!(
            "{} bytes is not a multiple of {} ({} channel(s) of 16-bit samples)",
            bytes.len(),
            frame_bytes,
            channels
        )));
    }

    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(bytes, &mut samples);

    AudioFrame::new(samples, sample_rate, channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i as f32 * 0.37).sin() * 0.9)).collect()
    }

    #[test]
    fn test_round_trip_matches_quantization() {
        for channels in 1..=2u16 {
            for len in [0usize, 2, 8, 4096, 4098] {
                let samples = sweep(len);
                let packet = encode(&samples);
                let frame = decode(&packet, 16000, channels).unwrap();

                let expected: Vec<i16> = samples.iter().map(|&s| quantize16(s)).collect();
                assert_eq!(frame.samples(), expected.as_slice(), "channels={} len={}", channels, len);
                assert_eq!(frame.channels(), channels);
            }
        }
    }

    #[test]
    fn test_quantize_truncates_toward_zero() {
        assert_eq!(quantize16(0.5), 16384);
        assert_eq!(quantize16(-0.5), -16384);
        assert_eq!(quantize16(0.00002), 0); // 0.655 truncates to 0
        assert_eq!(quantize16(-0.00002), 0);
        assert_eq!(quantize16(-1.0), -32768);
    }

    #[test]
    fn test_little_endian_layout() {
        let packet = encode_pcm(&[1, -2], 24000);
        let bytes = general_purpose::STANDARD.decode(&packet.data).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(packet.mime_type, "audio/pcm;rate=24000");
        assert_eq!(packet.payload_len(), 4);
    }

    #[test]
    fn test_encode_tags_capture_rate() {
        let packet = encode(&[0.0; 4]);
        assert_eq!(packet.format(), Some(PcmFormat::new(16000)));
    }

    #[test]
    fn test_rejects_odd_lengths() {
        assert!(matches!(decode_bytes(&[0u8; 3], 24000, 1), Err(WidgetError::MalformedFrame(_))));
        // Whole samples but not whole stereo frames
        assert!(matches!(decode_bytes(&[0u8; 6], 24000, 2), Err(WidgetError::MalformedFrame(_))));
        assert!(decode_bytes(&[0u8; 8], 24000, 2).is_ok());
    }

    #[test]
    fn test_rejects_invalid_base64() {
        let packet = EncodedPacket {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: "%%%".to_string(),
        };
        assert!(matches!(decode(&packet, 24000, 1), Err(WidgetError::MalformedFrame(_))));
    }

    #[test]
    fn test_parse_mime_type() {
        assert_eq!(PcmFormat::parse("audio/pcm;rate=24000"), Some(PcmFormat::new(24000)));
        assert_eq!(PcmFormat::parse("audio/PCM; rate=16000"), Some(PcmFormat::new(16000)));
        assert_eq!(PcmFormat::parse("audio/pcm"), None);
        assert_eq!(PcmFormat::parse("audio/pcm;rate=0"), None);
        assert_eq!(PcmFormat::parse("audio/opus;rate=24000"), None);
    }

    #[test]
    fn test_packet_wire_shape() {
        let packet = encode_pcm(&[0], 16000);
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["data"], "AAA=");
    }
}
