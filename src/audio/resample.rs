//! # Rate Conversion and Frame Assembly
//!
//! Device streams run at whatever rate the hardware prefers (usually 44.1 or
//! 48 kHz), while the remote session speaks 16 kHz up and 24 kHz down.
//!
//! - [`StreamResampler`]: stateful converter for an unbounded signal. Blocks
//!   fed one after another come out as one continuous signal, so it is what
//!   both device streams use.
//! - [`FrameAssembler`]: capture side. Cuts the converted signal into
//!   fixed-size frames.
//! - [`resample_mono`]: one-shot conversion of an isolated buffer. Its edges
//!   are treated as silence, so it is only for speech that arrives at a rate
//!   the output timeline does not run at.

use crate::error::{WidgetError, WidgetResult};
use rubato::{FftFixedIn, Resampler};

/// Input block size fed to the FFT resampler.
const RESAMPLER_CHUNK_SIZE: usize = 1024;

fn new_resampler(from_hz: u32, to_hz: u32) -> WidgetResult<FftFixedIn<f32>> {
    FftFixedIn::<f32>::new(from_hz as usize, to_hz as usize, RESAMPLER_CHUNK_SIZE, 1, 1)
        .map_err(|e| WidgetError::DeviceUnavailable(format!("cannot convert {}Hz to {}Hz: {}", from_hz, to_hz, e)))
}

/// Converts a continuous mono signal from `in_hz` to `out_hz`.
///
/// Input is buffered until a whole resampler block is available, and the
/// filter history carries over from block to block. A passthrough when both
/// rates match.
pub struct StreamResampler {
    resampler: Option<FftFixedIn<f32>>,
    block_len: usize,
    in_buf: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_hz: u32, out_hz: u32) -> WidgetResult<Self> {
        let resampler = if in_hz != out_hz {
            Some(new_resampler(in_hz, out_hz)?)
        } else {
            None
        };
        // The resampler rounds the requested block to a size its FFT supports
        let block_len = resampler
            .as_ref()
            .map(|r| r.input_frames_next())
            .unwrap_or(RESAMPLER_CHUNK_SIZE);

        Ok(Self {
            resampler,
            block_len,
            in_buf: Vec::with_capacity(block_len),
        })
    }

    /// Input samples consumed per conversion step.
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    /// Output samples by which the converted signal lags the input.
    pub fn output_delay(&self) -> usize {
        self.resampler.as_ref().map(|r| r.output_delay()).unwrap_or(0)
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feed samples, calling `emit` with every block of converted output.
    pub fn push(&mut self, mut src: &[f32], mut emit: impl FnMut(&[f32])) {
        let Some(resampler) = self.resampler.as_mut() else {
            if !src.is_empty() {
                emit(src);
            }
            return;
        };

        while !src.is_empty() {
            let take = (self.block_len - self.in_buf.len()).min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == self.block_len {
                if let Ok(out) = resampler.process(&[&self.in_buf[..]], None) {
                    emit(&out[0]);
                }
                self.in_buf.clear();
            }
        }
    }
}

/// Turns a stream of mono samples at `in_hz` into fixed frames at `out_hz`.
pub struct FrameAssembler {
    resampler: StreamResampler,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(in_hz: u32, out_hz: u32, frame_samples: usize) -> WidgetResult<Self> {
        if frame_samples == 0 {
            return Err(WidgetError::ConfigError("frame size must be greater than 0".to_string()));
        }

        Ok(Self {
            resampler: StreamResampler::new(in_hz, out_hz)?,
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        })
    }

    /// Feed samples, calling `emit` once for every completed frame.
    pub fn push(&mut self, src: &[f32], mut emit: impl FnMut(&[f32])) {
        let Self {
            resampler,
            frame_samples,
            pending,
        } = self;

        resampler.push(src, |mut data| {
            while !data.is_empty() {
                let take = (*frame_samples - pending.len()).min(data.len());
                pending.extend_from_slice(&data[..take]);
                data = &data[take..];

                if pending.len() == *frame_samples {
                    emit(&pending[..]);
                    pending.clear();
                }
            }
        });
    }

    /// Samples waiting to complete the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Resample a complete mono buffer.
///
/// The tail is zero-padded up to the resampler block size and the output is
/// trimmed back to the input's duration at the new rate, rounded the same
/// way output start times are.
pub fn resample_mono(samples: &[f32], from_hz: u32, to_hz: u32) -> WidgetResult<Vec<f32>> {
    if from_hz == to_hz || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = new_resampler(from_hz, to_hz)?;
    let chunk_size = resampler.input_frames_next();

    let expected_len = (samples.len() as f64 * to_hz as f64 / from_hz as f64).round() as usize;
    let mut output = Vec::with_capacity(expected_len + chunk_size);
    let mut block = vec![0.0f32; chunk_size];

    // Silent blocks after the input flush the resampler's internal delay
    let delay = resampler.output_delay();
    let mut input_pos = 0;
    while output.len() < expected_len + delay && input_pos < samples.len() + 2 * chunk_size {
        let end = (input_pos + chunk_size).min(samples.len());
        block.fill(0.0);
        if input_pos < end {
            block[..end - input_pos].copy_from_slice(&samples[input_pos..end]);
        }

        let resampled = resampler
            .process(&[&block[..]], None)
            .map_err(|e| WidgetError::DeviceUnavailable(format!("resampling failed: {}", e)))?;
        output.extend_from_slice(&resampled[0]);
        input_pos += chunk_size;
    }

    // Drop the delay introduced by the FFT resampler so timing stays aligned
    output.drain(..delay.min(output.len()));
    output.resize(expected_len, 0.0);
    Ok(output)
}
