//! # Widget Status and Session Metrics
//!
//! What the outside world can observe about a running widget.
//!
//! ## Status Publication:
//! The session manager is the only writer. Every change (connection state,
//! speaking indicator, error line) replaces the whole [`WidgetStatus`] in a
//! `tokio::sync::watch` channel, so any number of observers (a UI, the host
//! binary's log loop, tests) see the latest value without locking and without
//! being able to slow the audio path down.
//!
//! ## Metrics:
//! [`SessionMetrics`] are plain counters owned by the session manager's event
//! loop. They are reset when a session starts and logged when it ends.

use crate::error::WidgetError;
use crate::session::SessionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Error line shown in the widget.
///
/// ## Fields:
/// - `code`: stable machine identifier (`device_unavailable`, ...)
/// - `message`: the French text displayed to the visitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusError {
    pub code: &'static str,
    pub message: &'static str,
}

impl From<&WidgetError> for StatusError {
    fn from(err: &WidgetError) -> Self {
        Self {
            code: err.code(),
            message: err.user_message(),
        }
    }
}

/// Snapshot of everything the widget displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetStatus {
    /// Where the session is in its lifecycle
    pub connection: SessionState,

    /// Whether the assistant is currently talking (500ms heuristic)
    pub is_speaking: bool,

    /// Last failure, cleared when a new session starts
    pub error: Option<StatusError>,

    /// Identifier of the current or last session
    pub session_id: Option<Uuid>,

    /// When this snapshot was produced
    pub updated_at: DateTime<Utc>,
}

impl Default for WidgetStatus {
    fn default() -> Self {
        Self {
            connection: SessionState::Disconnected,
            is_speaking: false,
            error: None,
            session_id: None,
            updated_at: Utc::now(),
        }
    }
}

impl WidgetStatus {
    pub fn is_connected(&self) -> bool {
        self.connection == SessionState::Open
    }

    /// One-line rendering used by the host binary's logs.
    pub fn summary(&self) -> String {
        let mut line = self.connection.as_str().to_string();
        if self.is_speaking {
            line.push_str(", speaking");
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(", error: {} ({})", error.message, error.code));
        }
        line
    }
}

/// Counters for one session.
///
/// ## Why these metrics matter:
/// - **packets_dropped**: the outbound queue overflowed, the network is too slow
/// - **capture_frames**: microphone health; zero while open means a dead input
/// - **malformed_frames**: unreadable speech chunks that were skipped
/// - **interruptions**: how often the visitor barged in
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub capture_frames: u64,
    pub frames_scheduled: u64,
    pub seconds_scheduled: f64,
    pub interruptions: u64,
    pub malformed_frames: u64,
    pub connected_at: Option<DateTime<Utc>>,
}

impl SessionMetrics {
    /// Time since the session opened, zero if it never did.
    pub fn duration(&self) -> chrono::Duration {
        self.connected_at
            .map(|at| Utc::now() - at)
            .unwrap_or_else(chrono::Duration::zero)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_idle() {
        let status = WidgetStatus::default();
        assert_eq!(status.connection, SessionState::Disconnected);
        assert!(!status.is_connected());
        assert_eq!(status.summary(), "disconnected");
    }

    #[test]
    fn test_summary_includes_error_line() {
        let status = WidgetStatus {
            connection: SessionState::Disconnected,
            error: Some(StatusError::from(&WidgetError::ConnectionError("refused".into()))),
            ..WidgetStatus::default()
        };
        assert_eq!(status.summary(), "disconnected, error: Erreur de connexion (connection_error)");
    }

    #[test]
    fn test_status_serializes_for_ui() {
        let status = WidgetStatus {
            connection: SessionState::Open,
            is_speaking: true,
            ..WidgetStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["connection"], "open");
        assert_eq!(json["is_speaking"], true);
        assert!(json["error"].is_null());
    }

    #[test]
    fn test_duration_without_connection() {
        assert_eq!(SessionMetrics::default().duration(), chrono::Duration::zero());
    }
}
