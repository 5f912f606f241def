//! # Voice Chat Widget
//!
//! Client side of a realtime voice conversation with a remote speech
//! assistant: captures the visitor's microphone, streams it to the service,
//! and plays the synthesized answer back with barge-in support.
//!
//! ## Module Layout:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **error**: widget error taxonomy and user-facing messages
//! - **state**: published widget status and session metrics
//! - **audio**: frames, codec, capture, playback
//! - **device**: cpal device selection behind the `AudioBackend` seam
//! - **websocket**: the Live API protocol behind the `LiveConnector` seam
//! - **session**: session state machine and event loop
//! - **widget**: command/status handle for hosts

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod session;
pub mod state;
pub mod websocket;
pub mod widget;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{WidgetError, WidgetResult};
pub use widget::{VoiceWidget, WidgetCommand};
