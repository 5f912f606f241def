//! # Session Manager
//!
//! Owns one conversation with the remote assistant from the moment the
//! visitor presses the microphone button until the session ends, and mediates
//! between the capture pipeline, the transport and the playback scheduler.
//!
//! ## Lifecycle:
//! ```text
//! Disconnected ──connect()──▶ Connecting ──setup acknowledged──▶ Open
//!      ▲                          │                               │
//!      └────── close() / remote close / transport error ─────────┘
//! ```
//! `Closing` is observable only while resources are being released.
//!
//! ## Event Loop:
//! [`SessionManager::run`] is the single owner of all session state. It waits
//! on user commands, the pending connect, microphone frames, server events,
//! playback completions, outbound capacity and the speaking-indicator
//! deadline, and handles each event to completion before taking the next.
//! An interruption from the server therefore always lands between two
//! `schedule` calls, never in the middle of one.

use crate::audio::buffer::OutboundQueue;
use crate::audio::capture::{CapturePipeline, CaptureSpec};
use crate::audio::codec::{self, EncodedPacket};
use crate::audio::playback::{PlaybackScheduler, TokenId};
use crate::config::AppConfig;
use crate::device::AudioBackend;
use crate::error::{WidgetError, WidgetResult};
use crate::state::{SessionMetrics, StatusError, WidgetStatus};
use crate::websocket::{LiveConnector, OutboundMessage, ServerEvent, SessionSetup, TransportLink};
use crate::widget::WidgetCommand;
use chrono::Utc;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Connection state of the widget's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
        }
    }

    /// Whether a session is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }
}

/// Everything the event loop can wake up for.
enum Event {
    Command(Option<WidgetCommand>),
    Connected(WidgetResult<TransportLink>),
    Server(Option<ServerEvent>),
    Captured(Option<Vec<f32>>),
    PlaybackFinished(Option<TokenId>),
    OutboundReady(Option<OwnedPermit<OutboundMessage>>),
    SpeakingTimeout,
}

pub struct SessionManager {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn LiveConnector>,

    state: SessionState,
    session_id: Option<Uuid>,
    connecting: Option<BoxFuture<'static, WidgetResult<TransportLink>>>,
    outbound: Option<mpsc::Sender<OutboundMessage>>,
    inbound: Option<mpsc::UnboundedReceiver<ServerEvent>>,

    queue: OutboundQueue,
    capture: CapturePipeline,
    playback: PlaybackScheduler,

    is_speaking: bool,
    speaking_until: Option<Instant>,
    last_error: Option<WidgetError>,
    status: watch::Sender<WidgetStatus>,
    metrics: SessionMetrics,
}

impl SessionManager {
    pub fn new(config: AppConfig, backend: Arc<dyn AudioBackend>, connector: Arc<dyn LiveConnector>) -> Self {
        let (status, _) = watch::channel(WidgetStatus::default());
        let queue = OutboundQueue::new(config.audio.outbound_queue_capacity);

        Self {
            config,
            backend,
            connector,
            state: SessionState::Disconnected,
            session_id: None,
            connecting: None,
            outbound: None,
            inbound: None,
            queue,
            capture: CapturePipeline::new(),
            playback: PlaybackScheduler::new(),
            is_speaking: false,
            speaking_until: None,
            last_error: None,
            status,
            metrics: SessionMetrics::default(),
        }
    }

    /// Observe status changes.
    pub fn subscribe(&self) -> watch::Receiver<WidgetStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> WidgetStatus {
        self.status.borrow().clone()
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    /// Packets waiting for transport capacity.
    pub fn outbound_pending(&self) -> usize {
        self.queue.len()
    }

    /// Start a new session.
    ///
    /// ## Steps:
    /// 1. Open the speaker, then acquire the microphone (may prompt the visitor)
    /// 2. Start the remote connect with the persona and AUDIO responses
    ///
    /// The session becomes Open once the pending connect resolves through the
    /// event loop.
    ///
    /// ## Errors:
    /// - `AlreadyActive` while connecting or open; the current session is untouched
    /// - `DeviceUnavailable` if either device cannot be opened; everything
    ///   acquired so far is released and the error shows on the status line
    pub fn connect(&mut self) -> WidgetResult<()> {
        if self.state != SessionState::Disconnected {
            return Err(WidgetError::AlreadyActive);
        }

        let session_id = Uuid::new_v4();
        info!("Starting session {}", session_id);
        self.session_id = Some(session_id);
        self.last_error = None;
        self.metrics = SessionMetrics::default();
        self.state = SessionState::Connecting;
        self.publish();

        let audio = &self.config.audio;
        let spec = CaptureSpec {
            sample_rate: audio.input_sample_rate,
            frame_samples: audio.capture_frame_samples,
        };
        let output_rate = audio.output_sample_rate;

        if let Err(e) = self.playback.open(self.backend.as_ref(), output_rate) {
            self.fail(e.clone());
            return Err(e);
        }
        if let Err(e) = self.capture.acquire(self.backend.as_ref(), spec) {
            self.fail(e.clone());
            return Err(e);
        }

        let setup = SessionSetup {
            model: self.config.live.model.clone(),
            system_instruction: self.config.live.system_instruction.clone(),
        };
        self.connecting = Some(self.connector.connect(setup));
        Ok(())
    }

    /// Wait for the pending connect and apply its outcome.
    pub async fn complete_connect(&mut self) {
        if let Some(connecting) = self.connecting.as_mut() {
            let result = connecting.await;
            self.on_connected(result);
        }
    }

    fn on_connected(&mut self, result: WidgetResult<TransportLink>) {
        self.connecting = None;

        if self.state != SessionState::Connecting {
            debug!("Dropping connect result for a session that already ended");
            return;
        }

        let link = match result {
            Ok(link) => link,
            Err(e) => return self.fail(e),
        };

        self.outbound = Some(link.outbound);
        self.inbound = Some(link.inbound);
        self.state = SessionState::Open;
        self.metrics.connected_at = Some(Utc::now());

        if let Err(e) = self.capture.start(self.config.audio.capture_channel_capacity) {
            return self.fail(e);
        }

        info!("Session {} open", self.session_id.unwrap_or_default());
        self.publish();
    }

    /// Queue a packet for the remote. Fire-and-forget; the transport decides
    /// when it actually leaves.
    pub fn send(&mut self, packet: EncodedPacket) -> WidgetResult<()> {
        if self.state != SessionState::Open {
            return Err(WidgetError::NotConnected);
        }

        if self.queue.push(packet).is_some() {
            self.metrics.packets_dropped += 1;
            warn!(
                "Outbound queue full, dropped oldest packet ({} dropped this session)",
                self.metrics.packets_dropped
            );
        }
        self.flush_outbound();
        Ok(())
    }

    /// Move queued packets into the transport until it pushes back.
    fn flush_outbound(&mut self) {
        let Some(outbound) = self.outbound.clone() else {
            return;
        };

        while let Some(packet) = self.queue.pop() {
            match outbound.try_send(OutboundMessage::Media(packet)) {
                Ok(()) => self.metrics.packets_sent += 1,
                Err(TrySendError::Full(OutboundMessage::Media(packet))) => {
                    if self.queue.requeue(packet).is_some() {
                        self.metrics.packets_dropped += 1;
                    }
                    break;
                }
                Err(TrySendError::Full(_)) => break,
                Err(TrySendError::Closed(_)) => {
                    // The reader reports why; stop feeding a dead socket
                    self.queue.clear();
                    self.outbound = None;
                    break;
                }
            }
        }
    }

    fn on_outbound_ready(&mut self, permit: Option<OwnedPermit<OutboundMessage>>) {
        let Some(permit) = permit else {
            self.queue.clear();
            self.outbound = None;
            return;
        };

        match self.queue.pop() {
            Some(packet) => {
                permit.send(OutboundMessage::Media(packet));
                self.metrics.packets_sent += 1;
                self.flush_outbound();
            }
            None => drop(permit),
        }
    }

    /// Encode a microphone frame and send it.
    pub fn on_capture_frame(&mut self, samples: Vec<f32>) {
        if self.state != SessionState::Open {
            return;
        }

        self.metrics.capture_frames += 1;
        trace!("Captured frame of {} samples", samples.len());
        let packet = codec::encode_at(&samples, self.config.audio.input_sample_rate);
        if let Err(e) = self.send(packet) {
            debug!("Captured frame not sent: {}", e);
        }
    }

    /// Dispatch one event from the remote.
    pub fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Audio(packet) => self.play(packet),
            ServerEvent::Interrupted => self.interrupt(),
            ServerEvent::TurnComplete => debug!("Assistant turn complete"),
            ServerEvent::Closed(reason) => {
                if !self.state.is_active() {
                    return;
                }
                info!("Remote closed the session: {}", reason.as_deref().unwrap_or("no reason given"));
                self.fail(WidgetError::ConnectionClosed(reason));
            }
            ServerEvent::Error(message) => {
                if self.state.is_active() {
                    self.fail(WidgetError::ConnectionError(message));
                }
            }
        }
    }

    fn play(&mut self, packet: EncodedPacket) {
        if self.state != SessionState::Open {
            return;
        }

        let sample_rate = packet
            .format()
            .map(|format| format.sample_rate)
            .unwrap_or(self.config.audio.output_sample_rate);

        let frame = match codec::decode(&packet, sample_rate, 1) {
            Ok(frame) => frame,
            Err(e) => {
                self.metrics.malformed_frames += 1;
                warn!("Skipping speech chunk: {}", e);
                return;
            }
        };

        let duration = frame.duration();
        match self.playback.schedule(frame) {
            Ok(_) => {
                self.metrics.frames_scheduled += 1;
                self.metrics.seconds_scheduled += duration;
            }
            Err(e) => {
                warn!("Speech chunk not played: {}", e);
                return;
            }
        }

        self.speaking_until = Some(Instant::now() + self.config.speaking_indicator());
        if !self.is_speaking {
            self.is_speaking = true;
            self.publish();
        }
    }

    /// Barge-in: silence the assistant immediately.
    pub fn interrupt(&mut self) {
        let stopped = self.playback.interrupt();
        self.metrics.interruptions += 1;
        info!("Assistant interrupted, {} buffer(s) flushed", stopped);

        self.speaking_until = None;
        if self.is_speaking {
            self.is_speaking = false;
            self.publish();
        }
    }

    pub fn on_speaking_timeout(&mut self) {
        self.speaking_until = None;
        if self.is_speaking {
            self.is_speaking = false;
            self.publish();
        }
    }

    pub fn on_playback_finished(&mut self, token: TokenId) {
        if self.playback.on_finished(token) {
            trace!("Buffer {} finished", token);
        }
    }

    /// End the session and release every resource. Safe to call in any state
    /// and any number of times.
    pub fn close(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }

        self.state = SessionState::Closing;
        self.publish();
        self.release();
        self.state = SessionState::Disconnected;
        self.publish();
    }

    /// Close because something went wrong, leaving the error on the status line.
    fn fail(&mut self, err: WidgetError) {
        error!("Session failed: {}", err);
        self.release();
        self.state = SessionState::Disconnected;
        if err.is_user_visible() {
            self.last_error = Some(err);
        }
        self.publish();
    }

    fn release(&mut self) {
        if self.connecting.take().is_some() {
            debug!("Pending connect cancelled");
        }

        self.capture.teardown();

        if let Some(outbound) = self.outbound.take() {
            // The writer task closes the socket on Close or when the channel drops
            let _ = outbound.try_send(OutboundMessage::Close);
        }
        self.inbound = None;
        self.queue.clear();
        self.playback.shutdown();
        self.is_speaking = false;
        self.speaking_until = None;

        if self.metrics.connected_at.is_some() {
            info!(
                "Session {} ended after {}s: {} frame(s) captured, {} packet(s) sent, {} dropped, {} speech chunk(s) ({:.1}s), {} interruption(s), {} malformed",
                self.session_id.unwrap_or_default(),
                self.metrics.duration().num_seconds(),
                self.metrics.capture_frames,
                self.metrics.packets_sent,
                self.metrics.packets_dropped,
                self.metrics.frames_scheduled,
                self.metrics.seconds_scheduled,
                self.metrics.interruptions,
                self.metrics.malformed_frames
            );
            self.metrics.connected_at = None;
        }
    }

    fn publish(&self) {
        self.status.send_replace(WidgetStatus {
            connection: self.state,
            is_speaking: self.is_speaking,
            error: self.last_error.as_ref().map(StatusError::from),
            session_id: self.session_id,
            updated_at: Utc::now(),
        });
    }

    fn handle_command(&mut self, command: WidgetCommand) {
        debug!("Command: {:?}", command);
        match command {
            WidgetCommand::Connect => {
                if let Err(e) = self.connect() {
                    warn!("Connect refused: {}", e);
                }
            }
            WidgetCommand::Disconnect => self.close(),
            WidgetCommand::Toggle => {
                if self.state.is_active() {
                    self.close();
                } else if let Err(e) = self.connect() {
                    warn!("Connect refused: {}", e);
                }
            }
        }
    }

    /// Run the event loop until every command sender is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<WidgetCommand>) {
        info!("Voice widget ready");

        loop {
            let speaking_deadline = self.speaking_until.unwrap_or_else(Instant::now);
            let outbound = self.outbound.clone();
            let has_backlog = !self.queue.is_empty();

            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                result = wait_connect(&mut self.connecting) => Event::Connected(result),
                event = recv_inbound(&mut self.inbound) => Event::Server(event),
                frame = self.capture.next_frame() => Event::Captured(frame),
                token = self.playback.next_finished() => Event::PlaybackFinished(token),
                permit = reserve_outbound(outbound), if has_backlog => Event::OutboundReady(permit),
                _ = tokio::time::sleep_until(speaking_deadline), if self.speaking_until.is_some() => Event::SpeakingTimeout,
            };

            match event {
                Event::Command(Some(command)) => self.handle_command(command),
                Event::Command(None) => break,
                Event::Connected(result) => self.on_connected(result),
                Event::Server(Some(event)) => self.on_server_event(event),
                Event::Server(None) => {
                    self.inbound = None;
                    if self.state.is_active() {
                        self.fail(WidgetError::ConnectionClosed(None));
                    }
                }
                Event::Captured(Some(frame)) => self.on_capture_frame(frame),
                Event::Captured(None) => {
                    if self.state == SessionState::Open {
                        self.fail(WidgetError::DeviceUnavailable("microphone stream ended".to_string()));
                    }
                }
                Event::PlaybackFinished(Some(token)) => self.on_playback_finished(token),
                Event::PlaybackFinished(None) => {}
                Event::OutboundReady(permit) => self.on_outbound_ready(permit),
                Event::SpeakingTimeout => self.on_speaking_timeout(),
            }
        }

        self.close();
        info!("Voice widget stopped");
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close();
    }
}

async fn wait_connect(connecting: &mut Option<BoxFuture<'static, WidgetResult<TransportLink>>>) -> WidgetResult<TransportLink> {
    match connecting.as_mut() {
        Some(connecting) => connecting.await,
        None => std::future::pending().await,
    }
}

async fn recv_inbound(inbound: &mut Option<mpsc::UnboundedReceiver<ServerEvent>>) -> Option<ServerEvent> {
    match inbound.as_mut() {
        Some(inbound) => inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn reserve_outbound(outbound: Option<mpsc::Sender<OutboundMessage>>) -> Option<OwnedPermit<OutboundMessage>> {
    match outbound {
        Some(outbound) => outbound.reserve_owned().await.ok(),
        None => std::future::pending().await,
    }
}
