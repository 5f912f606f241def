//! # Audio Frames
//!
//! The unit of audio handed between pipeline stages: interleaved PCM16
//! samples tagged with their sample rate and channel count. A frame is
//! immutable once built and moves from stage to stage without being shared.

use crate::error::{WidgetError, WidgetResult};

/// Rate of microphone frames sent to the remote session.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Rate of synthesized speech received from the remote session.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Samples per captured frame.
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

/// Scale between PCM16 integers and floating point samples in [-1, 1].
pub const PCM16_SCALE: f32 = 32768.0;

/// Ordered, interleaved signed 16-bit samples at a known rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Build a frame, checking that the samples divide evenly into channels.
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> WidgetResult<Self> {
        if sample_rate == 0 {
            return Err(WidgetError::MalformedFrame("sample rate must be greater than 0".to_string()));
        }
        if channels == 0 {
            return Err(WidgetError::MalformedFrame("channel count must be greater than 0".to_string()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(WidgetError::MalformedFrame(format!(
                "{} samples do not divide into {} channels",
                samples.len(),
                channels
            )));
        }

        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (one sample per channel).
    pub fn frame_count(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// De-interleaved floating point view, one vector per channel.
    ///
    /// ## Conversion:
    /// Each sample is divided by 32768, mapping [-32768, 32767] onto [-1.0, 1.0).
    pub fn to_planar(&self) -> Vec<Vec<f32>> {
        let channels = self.channels as usize;
        let mut planar = vec![Vec::with_capacity(self.frame_count()); channels];
        for frame in self.samples.chunks_exact(channels) {
            for (channel, &sample) in frame.iter().enumerate() {
                planar[channel].push(sample as f32 / PCM16_SCALE);
            }
        }
        planar
    }

    /// Floating point mono mix of all channels.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels as usize;
        self.samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: f32 = frame.iter().map(|&s| s as f32 / PCM16_SCALE).sum();
                sum / channels as f32
            })
            .collect()
    }
}
