//! In-memory stand-ins for the audio hardware and the remote service.

use crate::audio::capture::{CaptureSpec, Microphone};
use crate::audio::frame::AudioFrame;
use crate::audio::playback::{OutputDevice, TokenId};
use crate::device::AudioBackend;
use crate::error::{WidgetError, WidgetResult};
use crate::websocket::{LiveConnector, OutboundMessage, ServerEvent, SessionSetup, TransportLink};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct OutputState {
    time: f64,
    started: Vec<(TokenId, f64)>,
    stopped: Vec<TokenId>,
    stop_calls: usize,
    close_count: usize,
    completions: Option<mpsc::UnboundedSender<TokenId>>,
}

/// Test-side view of the fake speaker.
#[derive(Clone, Default)]
pub struct FakeOutputHandle(Arc<Mutex<OutputState>>);

impl FakeOutputHandle {
    pub fn set_time(&self, time: f64) {
        self.0.lock().unwrap().time = time;
    }

    pub fn started(&self) -> Vec<(TokenId, f64)> {
        self.0.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<TokenId> {
        self.0.lock().unwrap().stopped.clone()
    }

    /// How many separate `stop` batches the device received.
    pub fn stop_calls(&self) -> usize {
        self.0.lock().unwrap().stop_calls
    }

    pub fn close_count(&self) -> usize {
        self.0.lock().unwrap().close_count
    }

    /// Report a buffer as fully played.
    pub fn finish(&self, token: TokenId) {
        if let Some(completions) = &self.0.lock().unwrap().completions {
            let _ = completions.send(token);
        }
    }
}

struct FakeOutput {
    handle: FakeOutputHandle,
    closed: bool,
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        self.handle.0.lock().unwrap().time
    }

    fn start(&mut self, token: TokenId, _frame: AudioFrame, at: f64) -> WidgetResult<()> {
        self.handle.0.lock().unwrap().started.push((token, at));
        Ok(())
    }

    fn stop(&mut self, tokens: &[TokenId]) {
        let mut state = self.handle.0.lock().unwrap();
        state.stopped.extend_from_slice(tokens);
        state.stop_calls += 1;
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.handle.0.lock().unwrap().close_count += 1;
        }
    }
}

#[derive(Default)]
struct MicrophoneState {
    frames: Option<mpsc::Sender<Vec<f32>>>,
    stop_count: usize,
}

/// Test-side view of the fake microphone.
#[derive(Clone, Default)]
pub struct FakeMicrophoneHandle(Arc<Mutex<MicrophoneState>>);

impl FakeMicrophoneHandle {
    /// Deliver a frame the way a device callback would. Returns false if it
    /// was dropped.
    pub fn speak(&self, frame: Vec<f32>) -> bool {
        match &self.0.lock().unwrap().frames {
            Some(frames) => frames.try_send(frame).is_ok(),
            None => false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.0.lock().unwrap().frames.is_some()
    }

    pub fn stop_count(&self) -> usize {
        self.0.lock().unwrap().stop_count
    }
}

struct FakeMicrophone {
    handle: FakeMicrophoneHandle,
}

impl Microphone for FakeMicrophone {
    fn start(&mut self, frames: mpsc::Sender<Vec<f32>>) -> WidgetResult<()> {
        self.handle.0.lock().unwrap().frames = Some(frames);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.handle.0.lock().unwrap();
        state.frames = None;
        state.stop_count += 1;
    }
}

#[derive(Default)]
struct BackendState {
    fail_output: bool,
    fail_microphone: bool,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
    output: FakeOutputHandle,
    microphone: FakeMicrophoneHandle,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_output(&self) {
        self.state.lock().unwrap().fail_output = true;
    }

    pub fn fail_microphone(&self) {
        self.state.lock().unwrap().fail_microphone = true;
    }

    pub fn output(&self) -> FakeOutputHandle {
        self.output.clone()
    }

    pub fn microphone(&self) -> FakeMicrophoneHandle {
        self.microphone.clone()
    }
}

impl AudioBackend for FakeBackend {
    fn open_output(
        &self,
        _sample_rate: u32,
        completions: mpsc::UnboundedSender<TokenId>,
    ) -> WidgetResult<Box<dyn OutputDevice>> {
        if self.state.lock().unwrap().fail_output {
            return Err(WidgetError::DeviceUnavailable("no output device".to_string()));
        }
        self.output.0.lock().unwrap().completions = Some(completions);
        Ok(Box::new(FakeOutput {
            handle: self.output.clone(),
            closed: false,
        }))
    }

    fn open_microphone(&self, _spec: CaptureSpec) -> WidgetResult<Box<dyn Microphone>> {
        if self.state.lock().unwrap().fail_microphone {
            return Err(WidgetError::DeviceUnavailable("permission denied".to_string()));
        }
        Ok(Box::new(FakeMicrophone {
            handle: self.microphone.clone(),
        }))
    }
}

/// The remote end of a fake session.
pub struct FakeRemote {
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub inbound: mpsc::UnboundedSender<ServerEvent>,
}

#[derive(Clone, Default)]
enum ConnectMode {
    #[default]
    Accept,
    Refuse(String),
    Hang,
}

#[derive(Default)]
struct ConnectorState {
    mode: ConnectMode,
    setups: Vec<SessionSetup>,
    remote: Option<FakeRemote>,
}

#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
    link_capacity: usize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::with_link_capacity(32)
    }

    pub fn with_link_capacity(link_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState::default())),
            link_capacity,
        }
    }

    pub fn accept(&self) {
        self.state.lock().unwrap().mode = ConnectMode::Accept;
    }

    pub fn refuse(&self, reason: &str) {
        self.state.lock().unwrap().mode = ConnectMode::Refuse(reason.to_string());
    }

    pub fn hang(&self) {
        self.state.lock().unwrap().mode = ConnectMode::Hang;
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().setups.len()
    }

    pub fn setups(&self) -> Vec<SessionSetup> {
        self.state.lock().unwrap().setups.clone()
    }

    /// The remote end of the last accepted session.
    pub fn take_remote(&self) -> Option<FakeRemote> {
        self.state.lock().unwrap().remote.take()
    }
}

impl LiveConnector for FakeConnector {
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, WidgetResult<TransportLink>> {
        let mut state = self.state.lock().unwrap();
        state.setups.push(setup);

        match state.mode.clone() {
            ConnectMode::Accept => {
                let (outbound_tx, outbound_rx) = mpsc::channel(self.link_capacity);
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                state.remote = Some(FakeRemote {
                    outbound: outbound_rx,
                    inbound: inbound_tx,
                });
                let link = TransportLink {
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                };
                async move { Ok(link) }.boxed()
            }
            ConnectMode::Refuse(reason) => async move { Err(WidgetError::ConnectionError(reason)) }.boxed(),
            ConnectMode::Hang => futures_util::future::pending().boxed(),
        }
    }
}
