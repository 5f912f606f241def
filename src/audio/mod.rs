//! # Audio Pipeline
//!
//! Everything between the visitor's microphone and speaker and the encoded
//! packets exchanged with the remote assistant.
//!
//! ## Key Components:
//! - **Frames**: PCM16 buffers tagged with rate and channel count
//! - **Codec**: float ⇄ PCM16 little-endian ⇄ base64 packets
//! - **Outbound Queue**: bounded drop-oldest buffer in front of the transport
//! - **Capture**: microphone → 16kHz mono frames of 4096 samples
//! - **Playback**: gapless scheduling of 24kHz speech with barge-in support
//!
//! ## Audio Format Requirements:
//! - **Upstream**: 16kHz, 16-bit PCM, mono, little-endian
//! - **Downstream**: 24kHz, 16-bit PCM, mono, little-endian

pub mod buffer;    // Bounded outbound packet queue
pub mod capture;   // Microphone acquisition and framing
pub mod codec;     // PCM16 / base64 wire codec
pub mod frame;     // AudioFrame and format constants
pub mod output;    // cpal speaker with a sample-accurate timeline
pub mod playback;  // Playback scheduler and output device seam
pub mod resample;  // Rate conversion and frame assembly
