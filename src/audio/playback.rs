//! # Playback Scheduler
//!
//! Places decoded speech frames on the output device back-to-back, in the
//! order they arrive, with no gap and no overlap.
//!
//! ## Scheduling Model:
//! The scheduler keeps a single "next available start time" (the schedule
//! clock) on the device timeline. Each frame starts at
//! `max(clock, device_now)` and pushes the clock forward by its duration:
//!
//! ```text
//! device now ─┐
//!             ▼
//!  ───────────|[ frame 1 ][ frame 2 ][ frame 3 ]──────▶ time
//!                                               ▲
//!                                      schedule clock
//! ```
//!
//! A burst of frames therefore queues up seamlessly, while a frame arriving
//! after the previous one finished starts right away instead of in the past.
//!
//! ## Interruption:
//! On barge-in every live token is stopped regardless of its position, the
//! live set is emptied and the clock jumps back to the device's current time.
//! The scheduler is owned by a single event loop and every operation takes
//! `&mut self`, so an interruption can never interleave with a `schedule`.

use crate::audio::frame::AudioFrame;
use crate::device::AudioBackend;
use crate::error::{WidgetError, WidgetResult};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identifier of one scheduled output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A buffer handed to the device and not yet finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackToken {
    pub id: TokenId,
    /// Device time (seconds) at which the buffer starts
    pub start_time: f64,
    /// Buffer length in seconds
    pub duration: f64,
}

impl PlaybackToken {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// An audio output that can start buffers at explicit times on its own clock.
///
/// ## Contract:
/// - `current_time` is monotonic while the device is open
/// - a buffer started with `start` is reported on the completion channel given
///   to [`AudioBackend::open_output`] once it has fully played
/// - buffers removed with `stop` are silenced immediately and never reported
pub trait OutputDevice: Send {
    /// Current position of the device clock in seconds.
    fn current_time(&self) -> f64;

    /// Play `frame` starting at device time `at`.
    fn start(&mut self, token: TokenId, frame: AudioFrame, at: f64) -> WidgetResult<()>;

    /// Silence a batch of buffers at once, so none of them is heard after
    /// any other has been cut. Unknown tokens are ignored.
    fn stop(&mut self, tokens: &[TokenId]);

    /// Release the device. Further calls are no-ops.
    fn close(&mut self);
}

pub struct PlaybackScheduler {
    device: Option<Box<dyn OutputDevice>>,
    finished: Option<mpsc::UnboundedReceiver<TokenId>>,
    clock: f64,
    live: HashMap<TokenId, PlaybackToken>,
    next_id: u64,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            device: None,
            finished: None,
            clock: 0.0,
            live: HashMap::new(),
            next_id: 0,
        }
    }

    /// Open the output device through `backend`.
    ///
    /// ## Errors:
    /// `DeviceUnavailable` if the backend cannot provide an output. The error
    /// is returned as-is; retrying is the visitor's decision.
    pub fn open(&mut self, backend: &dyn AudioBackend, sample_rate: u32) -> WidgetResult<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let (completions, finished) = mpsc::unbounded_channel();
        let device = backend.open_output(sample_rate, completions)?;
        info!("Output device opened at {}Hz", sample_rate);

        self.device = Some(device);
        self.finished = Some(finished);
        self.clock = 0.0;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Schedule a decoded frame right after everything already scheduled.
    pub fn schedule(&mut self, frame: AudioFrame) -> WidgetResult<PlaybackToken> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| WidgetError::DeviceUnavailable("output device is not open".to_string()))?;

        let start_time = self.clock.max(device.current_time());
        let duration = frame.duration();
        let id = TokenId(self.next_id);
        self.next_id += 1;

        device.start(id, frame, start_time)?;

        let token = PlaybackToken {
            id,
            start_time,
            duration,
        };
        self.clock = token.end_time();
        self.live.insert(id, token);

        debug!("Scheduled {} at {:.3}s for {:.3}s", id, start_time, duration);
        Ok(token)
    }

    /// Wait for the device to report a finished buffer.
    ///
    /// Never resolves while no device is open, which lets the session event
    /// loop select on it unconditionally.
    pub async fn next_finished(&mut self) -> Option<TokenId> {
        match self.finished.as_mut() {
            Some(finished) => {
                let id = finished.recv().await;
                if id.is_none() {
                    // Device side hung up; stop polling a closed channel
                    self.finished = None;
                }
                id
            }
            None => std::future::pending().await,
        }
    }

    /// Forget a token that played to the end. Returns false for tokens that
    /// were already cancelled.
    pub fn on_finished(&mut self, id: TokenId) -> bool {
        self.live.remove(&id).is_some()
    }

    /// Stop everything that is playing or queued and reset the clock.
    ///
    /// Returns the number of tokens that were stopped.
    pub fn interrupt(&mut self) -> usize {
        // Snapshot first: the device must not see a set that changes under it
        let stopped: Vec<TokenId> = self.live.drain().map(|(id, _)| id).collect();

        match self.device.as_mut() {
            Some(device) => {
                if !stopped.is_empty() {
                    device.stop(&stopped);
                }
                self.clock = device.current_time();
            }
            None => self.clock = 0.0,
        }

        if !stopped.is_empty() {
            info!("Playback interrupted, {} buffer(s) stopped", stopped.len());
        }
        stopped.len()
    }

    /// Stop playback and release the device. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.interrupt();
        if let Some(mut device) = self.device.take() {
            device.close();
            info!("Output device closed");
        }
        self.finished = None;
        self.clock = 0.0;
    }

    /// The schedule clock: when the next frame would start at the earliest.
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn current_time(&self) -> Option<f64> {
        self.device.as_ref().map(|d| d.current_time())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Live tokens ordered by start time.
    pub fn live_tokens(&self) -> Vec<PlaybackToken> {
        let mut tokens: Vec<_> = self.live.values().copied().collect();
        tokens.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    fn speech(samples: usize) -> AudioFrame {
        AudioFrame::new(vec![1000; samples], 24000, 1).unwrap()
    }

    fn open_scheduler(backend: &FakeBackend) -> PlaybackScheduler {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.open(backend, 24000).unwrap();
        scheduler
    }

    #[test]
    fn test_schedule_without_device_fails() {
        let mut scheduler = PlaybackScheduler::new();
        let err = scheduler.schedule(speech(10)).unwrap_err();
        assert_eq!(err.code(), "device_unavailable");
    }

    #[test]
    fn test_open_failure_is_surfaced() {
        let backend = FakeBackend::new();
        backend.fail_output();
        let mut scheduler = PlaybackScheduler::new();
        assert!(matches!(
            scheduler.open(&backend, 24000),
            Err(WidgetError::DeviceUnavailable(_))
        ));
        assert!(!scheduler.is_open());
    }

    #[test]
    fn test_back_to_back_scheduling() {
        let backend = FakeBackend::new();
        let mut scheduler = open_scheduler(&backend);

        let sizes = [24000, 12000, 6000, 2400];
        let tokens: Vec<_> = sizes.iter().map(|&n| scheduler.schedule(speech(n)).unwrap()).collect();

        assert_eq!(tokens[0].start_time, 0.0);
        for pair in tokens.windows(2) {
            assert_eq!(pair[1].start_time, pair[0].end_time(), "gap or overlap between frames");
        }
        assert_eq!(scheduler.clock(), 1.0 + 0.5 + 0.25 + 0.1);
        assert_eq!(scheduler.live_count(), 4);
        assert_eq!(backend.output().started().len(), 4);
    }

    #[test]
    fn test_late_frame_starts_at_device_time() {
        let backend = FakeBackend::new();
        let mut scheduler = open_scheduler(&backend);

        scheduler.schedule(speech(2400)).unwrap(); // ends at 0.1
        backend.output().set_time(0.75);
        let token = scheduler.schedule(speech(2400)).unwrap();

        assert_eq!(token.start_time, 0.75);
        assert!((scheduler.clock() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_natural_completion_only_removes_token() {
        let backend = FakeBackend::new();
        let mut scheduler = open_scheduler(&backend);

        let first = scheduler.schedule(speech(2400)).unwrap();
        scheduler.schedule(speech(2400)).unwrap();
        let clock = scheduler.clock();

        assert!(scheduler.on_finished(first.id));
        assert!(!scheduler.on_finished(first.id));
        assert_eq!(scheduler.live_count(), 1);
        assert_eq!(scheduler.clock(), clock);
    }

    #[tokio::test]
    async fn test_completion_reported_by_device() {
        let backend = FakeBackend::new();
        let mut scheduler = open_scheduler(&backend);

        let token = scheduler.schedule(speech(2400)).unwrap();
        backend.output().finish(token.id);

        let finished = scheduler.next_finished().await;
        assert_eq!(finished, Some(token.id));
        assert!(scheduler.on_finished(token.id));
    }

    #[test]
    fn test_interrupt_stops_everything_and_resets_clock() {
        let backend = FakeBackend::new();
        let mut scheduler = open_scheduler(&backend);

        let ids: Vec<_> = (0..5).map(|_| scheduler.schedule(speech(24000)).unwrap().id).collect();
        backend.output().set_time(1.5);

        assert_eq!(scheduler.interrupt(), 5);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(scheduler.clock(), 1.5);

        let mut stopped = backend.output().stopped();
        stopped.sort();
        assert_eq!(stopped, ids);
        assert_eq!(backend.output().stop_calls(), 1, "all buffers are cut in one batch");

        // Next frame starts now, not at the stale 5.0s clock
        let next = scheduler.schedule(speech(2400)).unwrap();
        assert_eq!(next.start_time, 1.5);
    }

    #[test]
    fn test_interrupt_with_nothing_live() {
        let backend = FakeBackend::new();
        let mut scheduler = open_scheduler(&backend);
        backend.output().set_time(0.2);

        assert_eq!(scheduler.interrupt(), 0);
        assert_eq!(scheduler.clock(), 0.2);
        assert_eq!(backend.output().stop_calls(), 0);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let backend = FakeBackend::new();
        let mut scheduler = open_scheduler(&backend);
        scheduler.schedule(speech(2400)).unwrap();

        scheduler.shutdown();
        scheduler.shutdown();

        assert!(!scheduler.is_open());
        assert_eq!(scheduler.clock(), 0.0);
        assert_eq!(scheduler.live_count(), 0);
        assert_eq!(backend.output().close_count(), 1);
    }
}
