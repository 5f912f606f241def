//! # Error Handling
//!
//! This module defines the error taxonomy of the voice widget and how each
//! error is presented to the visitor.
//!
//! ## Error Categories:
//! - **DeviceUnavailable**: microphone or speaker cannot be opened (no retry)
//! - **ConnectionError**: the remote session failed (manual retry)
//! - **ConnectionClosed**: the remote session ended (manual retry)
//! - **MalformedFrame**: an audio payload violated the PCM16 layout (logged only)
//! - **AlreadyActive**: `connect()` called while a session is in flight
//! - **NotConnected**: audio sent while no session is open
//! - **ConfigError**: configuration file or environment problems
//!
//! Every variant carries a machine-readable code (`code()`) and a message
//! meant for the status line of the widget (`user_message()`).

use std::fmt;

/// Errors produced by the voice widget.
///
/// ## Usage Example:
/// ```rust
/// use voice_chat_widget::error::WidgetError;
///
/// let err = WidgetError::MalformedFrame("odd byte count".to_string());
/// assert_eq!(err.code(), "malformed_frame");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetError {
    /// Microphone or output device inaccessible (permission denied, no device)
    DeviceUnavailable(String),

    /// Remote session could not be established or failed mid-stream
    ConnectionError(String),

    /// Remote session ended, with the close reason if one was given
    ConnectionClosed(Option<String>),

    /// PCM payload does not match the declared layout
    MalformedFrame(String),

    /// A session is already connecting or open
    AlreadyActive,

    /// Operation requires an open session
    NotConnected,

    /// Configuration file or environment variable problems
    ConfigError(String),
}

impl WidgetError {
    /// Stable machine-readable error type, used in logs and the status payload.
    pub fn code(&self) -> &'static str {
        match self {
            WidgetError::DeviceUnavailable(_) => "device_unavailable",
            WidgetError::ConnectionError(_) => "connection_error",
            WidgetError::ConnectionClosed(_) => "connection_closed",
            WidgetError::MalformedFrame(_) => "malformed_frame",
            WidgetError::AlreadyActive => "already_active",
            WidgetError::NotConnected => "not_connected",
            WidgetError::ConfigError(_) => "config_error",
        }
    }

    /// Message shown to the visitor in the widget.
    ///
    /// The widget speaks French, so are its status lines.
    pub fn user_message(&self) -> &'static str {
        match self {
            WidgetError::DeviceUnavailable(_) => "Microphone inaccessible",
            WidgetError::ConnectionError(_) => "Erreur de connexion",
            WidgetError::ConnectionClosed(_) => "Connexion interrompue",
            WidgetError::MalformedFrame(_) => "Audio illisible",
            WidgetError::AlreadyActive => "Une discussion est déjà en cours",
            WidgetError::NotConnected => "Discussion non démarrée",
            WidgetError::ConfigError(_) => "Configuration invalide",
        }
    }

    /// Whether this error belongs on the status line.
    ///
    /// Codec violations are internal: they are logged and counted but a single
    /// unreadable chunk must not interrupt the conversation.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, WidgetError::MalformedFrame(_))
    }
}

impl fmt::Display for WidgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WidgetError::DeviceUnavailable(msg) => write!(f, "Audio device unavailable: {}", msg),
            WidgetError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            WidgetError::ConnectionClosed(Some(reason)) => write!(f, "Connection closed: {}", reason),
            WidgetError::ConnectionClosed(None) => write!(f, "Connection closed"),
            WidgetError::MalformedFrame(msg) => write!(f, "Malformed audio frame: {}", msg),
            WidgetError::AlreadyActive => write!(f, "A session is already active"),
            WidgetError::NotConnected => write!(f, "No open session"),
            WidgetError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for WidgetError {}

/// Invalid base64 in an inbound audio payload is a codec violation.
impl From<base64::DecodeError> for WidgetError {
    fn from(err: base64::DecodeError) -> Self {
        WidgetError::MalformedFrame(format!("invalid base64 payload: {}", err))
    }
}

/// JSON problems only happen on the wire, so they are connection errors.
impl From<serde_json::Error> for WidgetError {
    fn from(err: serde_json::Error) -> Self {
        WidgetError::ConnectionError(format!("invalid message: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for WidgetError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        WidgetError::ConnectionError(err.to_string())
    }
}

impl From<config::ConfigError> for WidgetError {
    fn from(err: config::ConfigError) -> Self {
        WidgetError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use the widget error type.
pub type WidgetResult<T> = Result<T, WidgetError>;
