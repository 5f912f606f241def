//! # Audio Device Selection and Management
//!
//! Resolves microphones and speakers through cpal and hides the platform
//! specifics behind [`AudioBackend`], so the session manager only sees the
//! [`OutputDevice`] and [`Microphone`] seams.
//!
//! ## Threading Model:
//! cpal streams are not `Send` on every platform. Each stream is therefore
//! built, played and dropped on its own OS thread ([`StreamWorker`]); the
//! rest of the widget talks to it through channels and shared timelines.

use crate::audio::capture::{CaptureSpec, CpalMicrophone, Microphone};
use crate::audio::output::CpalOutput;
use crate::audio::playback::{OutputDevice, TokenId};
use crate::config::AudioSettings;
use crate::error::{WidgetError, WidgetResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Source of the audio devices used by a session.
///
/// Opening may prompt the platform for permission; any refusal is reported as
/// `DeviceUnavailable` and is never retried behind the visitor's back.
pub trait AudioBackend: Send + Sync {
    /// Open an output able to play buffers at `sample_rate`. Finished buffers
    /// are reported on `completions`.
    fn open_output(
        &self,
        sample_rate: u32,
        completions: mpsc::UnboundedSender<TokenId>,
    ) -> WidgetResult<Box<dyn OutputDevice>>;

    /// Acquire a microphone producing frames as described by `spec`.
    fn open_microphone(&self, spec: CaptureSpec) -> WidgetResult<Box<dyn Microphone>>;
}

/// Which physical device to use for a role.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    /// The host's default device
    #[default]
    Default,
    /// First device whose name matches exactly
    Named(String),
}

impl DeviceSelection {
    pub fn from_config(name: Option<&str>) -> Self {
        match name.map(str::trim) {
            None | Some("") => DeviceSelection::Default,
            Some(name) if name.eq_ignore_ascii_case("default") => DeviceSelection::Default,
            Some(name) => DeviceSelection::Named(name.to_string()),
        }
    }
}

impl std::fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelection::Default => write!(f, "default"),
            DeviceSelection::Named(name) => write!(f, "\"{}\"", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Input,
    Output,
}

impl DeviceRole {
    fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Input => "input",
            DeviceRole::Output => "output",
        }
    }
}

/// Backend over the host's default cpal audio API.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input: DeviceSelection,
    output: DeviceSelection,
}

impl CpalBackend {
    pub fn new(settings: &AudioSettings) -> Self {
        Self {
            input: DeviceSelection::from_config(settings.input_device.as_deref()),
            output: DeviceSelection::from_config(settings.output_device.as_deref()),
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_output(
        &self,
        sample_rate: u32,
        completions: mpsc::UnboundedSender<TokenId>,
    ) -> WidgetResult<Box<dyn OutputDevice>> {
        let output = CpalOutput::open(self.output.clone(), sample_rate, completions)?;
        Ok(Box::new(output))
    }

    fn open_microphone(&self, spec: CaptureSpec) -> WidgetResult<Box<dyn Microphone>> {
        let microphone = CpalMicrophone::acquire(self.input.clone(), spec)?;
        Ok(Box::new(microphone))
    }
}

/// Resolve a device on `host`.
pub fn find_device(host: &cpal::Host, selection: &DeviceSelection, role: DeviceRole) -> WidgetResult<cpal::Device> {
    let device = match selection {
        DeviceSelection::Default => match role {
            DeviceRole::Input => host.default_input_device(),
            DeviceRole::Output => host.default_output_device(),
        },
        DeviceSelection::Named(wanted) => {
            let mut devices = match role {
                DeviceRole::Input => host.input_devices(),
                DeviceRole::Output => host.output_devices(),
            }
            .map_err(|e| WidgetError::DeviceUnavailable(format!("cannot list {} devices: {}", role.as_str(), e)))?;

            devices.find(|device| device.name().map(|name| &name == wanted).unwrap_or(false))
        }
    };

    device.ok_or_else(|| WidgetError::DeviceUnavailable(format!("no {} {} device", selection, role.as_str())))
}

/// Map a cpal build error to the widget taxonomy.
pub fn stream_error(role: DeviceRole, err: impl std::fmt::Display) -> WidgetError {
    WidgetError::DeviceUnavailable(format!("cannot open {} stream: {}", role.as_str(), err))
}

/// Names of the devices visible to the default host, for startup logs.
#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub host: String,
    pub default_input: Option<String>,
    pub default_output: Option<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl DeviceSummary {
    pub fn collect() -> Self {
        let host = cpal::default_host();

        Self {
            host: host.id().name().to_string(),
            default_input: host.default_input_device().and_then(|d| d.name().ok()),
            default_output: host.default_output_device().and_then(|d| d.name().ok()),
            inputs: host
                .input_devices()
                .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
                .unwrap_or_default(),
            outputs: host
                .output_devices()
                .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
                .unwrap_or_default(),
        }
    }

    pub fn log(&self) {
        info!(
            "Audio host {}: default input {:?}, default output {:?}",
            self.host, self.default_input, self.default_output
        );
        debug!("Input devices: {:?}", self.inputs);
        debug!("Output devices: {:?}", self.outputs);
        if self.default_input.is_none() {
            warn!("No default microphone, voice chat will not start");
        }
    }
}

/// A cpal stream kept alive on a dedicated thread.
///
/// `build` runs on the new thread; it returns the stream plus a value handed
/// back to the caller once the stream is playing. Dropping the worker stops
/// and joins the thread.
pub struct StreamWorker {
    stop: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl StreamWorker {
    pub fn spawn<F, T>(name: &str, build: F) -> WidgetResult<(Self, T)>
    where
        F: FnOnce() -> WidgetResult<(cpal::Stream, T)> + Send + 'static,
        T: Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<WidgetResult<T>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (stream, value) = match build() {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(WidgetError::DeviceUnavailable(format!("cannot start stream: {}", e))));
                    return;
                }

                if ready_tx.send(Ok(value)).is_err() {
                    return;
                }

                // Parked until stop() or the worker is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| WidgetError::DeviceUnavailable(format!("cannot spawn audio thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(value)) => {
                debug!("Audio thread {} running", name);
                let worker = Self {
                    stop: Some(stop_tx),
                    handle: Some(handle),
                    name: name.to_string(),
                };
                Ok((worker, value))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(WidgetError::DeviceUnavailable(format!("audio thread {} exited during setup", name)))
            }
        }
    }

    /// Stop the stream and wait for its thread. Idempotent.
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Audio thread {} panicked", self.name);
            } else {
                debug!("Audio thread {} stopped", self.name);
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_from_config() {
        assert_eq!(DeviceSelection::from_config(None), DeviceSelection::Default);
        assert_eq!(DeviceSelection::from_config(Some("  ")), DeviceSelection::Default);
        assert_eq!(DeviceSelection::from_config(Some("Default")), DeviceSelection::Default);
        assert_eq!(
            DeviceSelection::from_config(Some("USB Headset")),
            DeviceSelection::Named("USB Headset".to_string())
        );
    }

    #[test]
    fn test_backend_uses_configured_names() {
        let mut settings = crate::config::AppConfig::default().audio;
        settings.output_device = Some("Speakers".to_string());
        let backend = CpalBackend::new(&settings);
        assert_eq!(backend.input, DeviceSelection::Default);
        assert_eq!(backend.output, DeviceSelection::Named("Speakers".to_string()));
    }

    #[test]
    fn test_stream_error_is_device_unavailable() {
        let err = stream_error(DeviceRole::Input, "permission denied");
        assert_eq!(err.code(), "device_unavailable");
        assert!(err.to_string().contains("input"));
    }
}
