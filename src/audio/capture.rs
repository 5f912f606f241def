//! # Capture Pipeline
//!
//! Turns the visitor's microphone into fixed-size 16 kHz mono frames.
//!
//! ## Pipeline:
//! 1. The device callback (audio thread) downmixes native audio to mono
//! 2. [`FrameAssembler`] converts to the capture rate and cuts 4096-sample frames
//! 3. Frames cross to the session event loop over a small bounded channel;
//!    a full channel drops the new frame so the audio thread never blocks
//! 4. The session encodes each frame and queues it for the remote
//!
//! The microphone is acquired when a session starts connecting (that is when
//! the platform asks for permission) but frames only flow once `start` is
//! called on an open session.

use crate::audio::frame::{CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE};
use crate::audio::resample::FrameAssembler;
use crate::device::{find_device, stream_error, AudioBackend, DeviceRole, DeviceSelection, StreamWorker};
use crate::error::{WidgetError, WidgetResult};
use cpal::traits::DeviceTrait;
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, trace};

/// Shape of the frames a microphone must deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSpec {
    pub sample_rate: u32,
    pub frame_samples: usize,
}

impl Default for CaptureSpec {
    fn default() -> Self {
        Self {
            sample_rate: CAPTURE_SAMPLE_RATE,
            frame_samples: CAPTURE_FRAME_SAMPLES,
        }
    }
}

/// An acquired microphone.
pub trait Microphone: Send {
    /// Begin delivering mono float frames. Frames that do not fit in the
    /// channel are dropped.
    fn start(&mut self, frames: mpsc::Sender<Vec<f32>>) -> WidgetResult<()>;

    /// Stop delivering frames and release the hardware.
    fn stop(&mut self);
}

pub struct CapturePipeline {
    microphone: Option<Box<dyn Microphone>>,
    frames: Option<mpsc::Receiver<Vec<f32>>>,
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CapturePipeline {
    pub fn new() -> Self {
        Self {
            microphone: None,
            frames: None,
        }
    }

    /// Acquire the microphone. Does nothing if one is already held.
    pub fn acquire(&mut self, backend: &dyn AudioBackend, spec: CaptureSpec) -> WidgetResult<()> {
        if self.microphone.is_none() {
            self.microphone = Some(backend.open_microphone(spec)?);
            info!("Microphone acquired ({}Hz, {} samples per frame)", spec.sample_rate, spec.frame_samples);
        }
        Ok(())
    }

    /// Start streaming frames through a channel holding `capacity` frames.
    pub fn start(&mut self, capacity: usize) -> WidgetResult<()> {
        let microphone = self
            .microphone
            .as_mut()
            .ok_or_else(|| WidgetError::DeviceUnavailable("microphone not acquired".to_string()))?;

        if self.frames.is_none() {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            microphone.start(tx)?;
            self.frames = Some(rx);
            info!("Capture started");
        }
        Ok(())
    }

    /// Next captured frame; pending forever while capture is not running.
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        match self.frames.as_mut() {
            Some(frames) => {
                let frame = frames.recv().await;
                if frame.is_none() {
                    self.frames = None;
                }
                frame
            }
            None => std::future::pending().await,
        }
    }

    /// Stop the stream and release the microphone. Frames still in flight
    /// are discarded. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.frames = None;
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
            info!("Microphone released");
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.microphone.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.frames.is_some()
    }
}

/// Microphone backed by a cpal input stream.
pub struct CpalMicrophone {
    selection: DeviceSelection,
    spec: CaptureSpec,
    worker: Option<StreamWorker>,
}

impl CpalMicrophone {
    /// Check that the device exists and can report an input configuration.
    pub fn acquire(selection: DeviceSelection, spec: CaptureSpec) -> WidgetResult<Self> {
        let host = cpal::default_host();
        let device = find_device(&host, &selection, DeviceRole::Input)?;
        let supported = device
            .default_input_config()
            .map_err(|e| stream_error(DeviceRole::Input, e))?;

        info!(
            "Input device {}: {}Hz, {} channel(s)",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            supported.sample_rate().0,
            supported.channels()
        );

        Ok(Self {
            selection,
            spec,
            worker: None,
        })
    }
}

impl Microphone for CpalMicrophone {
    fn start(&mut self, frames: mpsc::Sender<Vec<f32>>) -> WidgetResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let selection = self.selection.clone();
        let spec = self.spec;
        let (worker, native_rate) = StreamWorker::spawn("voice-capture", move || {
            let host = cpal::default_host();
            let device = find_device(&host, &selection, DeviceRole::Input)?;
            let supported = device
                .default_input_config()
                .map_err(|e| stream_error(DeviceRole::Input, e))?;
            let config = supported.config();
            let assembler = FrameAssembler::new(config.sample_rate.0, spec.sample_rate, spec.frame_samples)?;

            let stream = match supported.sample_format() {
                SampleFormat::F32 => build_input::<f32>(&device, &config, assembler, frames),
                SampleFormat::I16 => build_input::<i16>(&device, &config, assembler, frames),
                SampleFormat::U16 => build_input::<u16>(&device, &config, assembler, frames),
                SampleFormat::I32 => build_input::<i32>(&device, &config, assembler, frames),
                other => Err(stream_error(DeviceRole::Input, format!("unsupported sample format {:?}", other))),
            }?;
            Ok((stream, config.sample_rate.0))
        })?;

        info!("Microphone streaming at {}Hz native", native_rate);
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut assembler: FrameAssembler,
    frames: mpsc::Sender<Vec<f32>>,
) -> WidgetResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks_exact(channels).map(|frame| {
                    let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                    sum / channels as f32
                }));

                assembler.push(&mono, |frame| match frames.try_send(frame.to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => trace!("Capture channel full, frame dropped"),
                    Err(TrySendError::Closed(_)) => {}
                });
            },
            |err| error!("Input stream error: {}", err),
            None,
        )
        .map_err(|e| stream_error(DeviceRole::Input, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[tokio::test]
    async fn test_frames_flow_after_start() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::new();

        capture.acquire(&backend, CaptureSpec::default()).unwrap();
        assert!(capture.is_acquired());
        assert!(!capture.is_running());
        assert!(!backend.microphone().is_streaming());

        capture.start(4).unwrap();
        assert!(backend.microphone().speak(vec![0.5; 4096]));

        let frame = capture.next_frame().await.unwrap();
        assert_eq!(frame.len(), 4096);
    }

    #[test]
    fn test_start_requires_microphone() {
        let mut capture = CapturePipeline::new();
        assert!(matches!(capture.start(4), Err(WidgetError::DeviceUnavailable(_))));
    }

    #[test]
    fn test_permission_denied_is_surfaced() {
        let backend = FakeBackend::new();
        backend.fail_microphone();
        let mut capture = CapturePipeline::new();

        let err = capture.acquire(&backend, CaptureSpec::default()).unwrap_err();
        assert_eq!(err.user_message(), "Microphone inaccessible");
        assert!(!capture.is_acquired());
    }

    #[test]
    fn test_full_channel_drops_new_frames() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::new();
        capture.acquire(&backend, CaptureSpec::default()).unwrap();
        capture.start(1).unwrap();

        assert!(backend.microphone().speak(vec![0.1; 8]));
        assert!(!backend.microphone().speak(vec![0.2; 8]));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let backend = FakeBackend::new();
        let mut capture = CapturePipeline::new();
        capture.acquire(&backend, CaptureSpec::default()).unwrap();
        capture.start(4).unwrap();

        capture.teardown();
        capture.teardown();

        assert!(!capture.is_acquired());
        assert!(!capture.is_running());
        assert_eq!(backend.microphone().stop_count(), 1);
        // In-flight frames have nowhere to go
        assert!(!backend.microphone().speak(vec![0.0; 8]));
    }
}
