//! # Speaker Output
//!
//! cpal implementation of [`OutputDevice`].
//!
//! Scheduled buffers ("voices") sit on a shared [`Timeline`] that runs at the
//! speech rate, so start times and lengths are exact sample counts. The device
//! clock is the number of timeline frames rendered divided by that rate.
//!
//! The stream callback pulls the mix through an [`OutputFeed`], which owns one
//! [`StreamResampler`] for the life of the device. Consecutive voices are
//! converted as a single continuous signal, with no edge at each buffer.

use crate::audio::frame::AudioFrame;
use crate::audio::playback::{OutputDevice, TokenId};
use crate::audio::resample::{resample_mono, StreamResampler};
use crate::device::{find_device, stream_error, DeviceRole, DeviceSelection, StreamWorker};
use crate::error::{WidgetError, WidgetResult};
use cpal::traits::DeviceTrait;
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

struct Voice {
    token: TokenId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sample-accurate mono timeline shared between the scheduler side and the
/// stream callback.
pub struct Timeline {
    sample_rate: u32,
    rendered_frames: u64,
    voices: Vec<Voice>,
}

impl Timeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            rendered_frames: 0,
            voices: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn current_time(&self) -> f64 {
        self.rendered_frames as f64 / self.sample_rate as f64
    }

    /// Place samples at time `at`. A start already in the past plays from the
    /// next rendered block instead.
    pub fn insert(&mut self, token: TokenId, samples: Vec<f32>, at: f64) {
        let requested = (at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.voices.push(Voice {
            token,
            start_frame: requested.max(self.rendered_frames),
            samples,
        });
    }

    /// Drop voices without reporting them. Returns how many were present.
    pub fn remove_all(&mut self, tokens: &[TokenId]) -> usize {
        let before = self.voices.len();
        self.voices.retain(|voice| !tokens.contains(&voice.token));
        before - self.voices.len()
    }

    /// Mix the next `out.len()` frames into `out` and advance the clock.
    ///
    /// Returns the voices that ended within this block.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<TokenId> {
        out.fill(0.0);
        let begin = self.rendered_frames;
        let end = begin + out.len() as u64;

        for voice in &self.voices {
            if voice.start_frame >= end || voice.end_frame() <= begin {
                continue;
            }
            let from = voice.start_frame.max(begin);
            let to = voice.end_frame().min(end);
            let src = &voice.samples[(from - voice.start_frame) as usize..(to - voice.start_frame) as usize];
            let dst = &mut out[(from - begin) as usize..(to - begin) as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }
        self.rendered_frames = end;

        let mut finished = Vec::new();
        self.voices.retain(|voice| {
            let done = voice.end_frame() <= end;
            if done {
                finished.push(voice.token);
            }
            !done
        });
        finished
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }
}

fn lock(timeline: &Mutex<Timeline>) -> MutexGuard<'_, Timeline> {
    // A panicking callback must not take the whole widget down with it
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Device-side reader of a [`Timeline`]: renders it block by block, converts
/// to the device rate and reports finished voices.
pub struct OutputFeed {
    timeline: Arc<Mutex<Timeline>>,
    resampler: StreamResampler,
    block: Vec<f32>,
    ready: VecDeque<f32>,
    completions: mpsc::UnboundedSender<TokenId>,
}

impl OutputFeed {
    pub fn new(
        timeline: Arc<Mutex<Timeline>>,
        device_rate: u32,
        completions: mpsc::UnboundedSender<TokenId>,
    ) -> WidgetResult<Self> {
        let speech_rate = lock(&timeline).sample_rate();
        let resampler = StreamResampler::new(speech_rate, device_rate)?;
        let block = vec![0.0; resampler.block_len()];

        Ok(Self {
            timeline,
            resampler,
            block,
            ready: VecDeque::new(),
            completions,
        })
    }

    /// Fill `out` with mono samples at the device rate.
    pub fn fill(&mut self, out: &mut [f32]) {
        while self.ready.len() < out.len() {
            let finished = lock(&self.timeline).render(&mut self.block);
            for token in finished {
                let _ = self.completions.send(token);
            }

            let before = self.ready.len();
            let ready = &mut self.ready;
            self.resampler.push(&self.block, |converted| ready.extend(converted.iter().copied()));
            if self.ready.len() == before {
                // Conversion failed; pad this callback with silence
                break;
            }
        }

        let available = out.len().min(self.ready.len());
        for (dst, src) in out.iter_mut().zip(self.ready.drain(..available)) {
            *dst = src;
        }
        out[available..].fill(0.0);
    }
}

/// The system speaker, driven by a cpal output stream.
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    speech_rate: u32,
    worker: Option<StreamWorker>,
}

impl CpalOutput {
    /// Open `selection` and start rendering silence.
    ///
    /// `sample_rate` is the rate of the speech that will be scheduled and the
    /// rate the timeline runs at. The device may run at another rate.
    pub fn open(
        selection: DeviceSelection,
        sample_rate: u32,
        completions: mpsc::UnboundedSender<TokenId>,
    ) -> WidgetResult<Self> {
        let (worker, timeline) = StreamWorker::spawn("voice-output", move || {
            let host = cpal::default_host();
            let device = find_device(&host, &selection, DeviceRole::Output)?;
            let supported = device
                .default_output_config()
                .map_err(|e| stream_error(DeviceRole::Output, e))?;
            let config = supported.config();
            info!(
                "Output device {}: {}Hz, {} channel(s), {:?}",
                device.name().unwrap_or_else(|_| "unknown".to_string()),
                config.sample_rate.0,
                config.channels,
                supported.sample_format()
            );
            if config.sample_rate.0 != sample_rate {
                debug!("Speech at {}Hz will be resampled to {}Hz", sample_rate, config.sample_rate.0);
            }

            let timeline = Arc::new(Mutex::new(Timeline::new(sample_rate)));
            let feed = OutputFeed::new(Arc::clone(&timeline), config.sample_rate.0, completions)?;
            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_output::<f32>(&device, &config, feed),
                SampleFormat::I16 => build_output::<i16>(&device, &config, feed),
                SampleFormat::U16 => build_output::<u16>(&device, &config, feed),
                SampleFormat::I32 => build_output::<i32>(&device, &config, feed),
                other => Err(stream_error(DeviceRole::Output, format!("unsupported sample format {:?}", other))),
            }?;
            Ok((stream, timeline))
        })?;

        Ok(Self {
            timeline,
            speech_rate: sample_rate,
            worker: Some(worker),
        })
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        lock(&self.timeline).current_time()
    }

    fn start(&mut self, token: TokenId, frame: AudioFrame, at: f64) -> WidgetResult<()> {
        if self.worker.is_none() {
            return Err(WidgetError::DeviceUnavailable("output device is closed".to_string()));
        }

        let samples = if frame.sample_rate() == self.speech_rate {
            frame.to_mono()
        } else {
            debug!("Converting {} from {}Hz", token, frame.sample_rate());
            resample_mono(&frame.to_mono(), frame.sample_rate(), self.speech_rate)?
        };
        lock(&self.timeline).insert(token, samples, at);
        Ok(())
    }

    fn stop(&mut self, tokens: &[TokenId]) {
        lock(&self.timeline).remove_all(tokens);
    }

    fn close(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        lock(&self.timeline).clear();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_output<T>(device: &cpal::Device, config: &cpal::StreamConfig, mut feed: OutputFeed) -> WidgetResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                mono.resize(data.len() / channels, 0.0);
                feed.fill(&mut mono);

                // Mono speech goes to every device channel
                for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    frame.fill(T::from_sample(sample));
                }
            },
            |err| error!("Output stream error: {}", err),
            None,
        )
        .map_err(|e| stream_error(DeviceRole::Output, e))
}
