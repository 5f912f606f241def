//! # Voice Widget Handle
//!
//! The surface a host embeds: commands go in, status comes out. The session
//! manager itself runs on its own task and is never shared.

use crate::config::AppConfig;
use crate::device::AudioBackend;
use crate::session::SessionManager;
use crate::state::WidgetStatus;
use crate::websocket::LiveConnector;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;

/// What the visitor can ask of the widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetCommand {
    /// Start a conversation (also the retry after an error)
    Connect,
    /// End the conversation
    Disconnect,
    /// The microphone button: disconnect when active, connect otherwise
    Toggle,
}

pub struct VoiceWidget {
    commands: mpsc::Sender<WidgetCommand>,
    status: watch::Receiver<WidgetStatus>,
    task: JoinHandle<()>,
}

impl VoiceWidget {
    /// Spawn the session event loop on the current runtime.
    pub fn launch(config: AppConfig, backend: Arc<dyn AudioBackend>, connector: Arc<dyn LiveConnector>) -> Self {
        let session = SessionManager::new(config, backend, connector);
        let status = session.subscribe();
        let (commands, rx) = mpsc::channel(16);
        let task = tokio::spawn(session.run(rx));

        Self { commands, status, task }
    }

    /// Send a command. Returns false once the event loop has stopped.
    pub async fn send(&self, command: WidgetCommand) -> bool {
        if self.commands.send(command).await.is_err() {
            warn!("Widget event loop is gone, {:?} ignored", command);
            return false;
        }
        true
    }

    pub async fn connect(&self) -> bool {
        self.send(WidgetCommand::Connect).await
    }

    pub async fn disconnect(&self) -> bool {
        self.send(WidgetCommand::Disconnect).await
    }

    pub async fn toggle(&self) -> bool {
        self.send(WidgetCommand::Toggle).await
    }

    /// A receiver that sees every status change.
    pub fn status(&self) -> watch::Receiver<WidgetStatus> {
        self.status.clone()
    }

    pub fn current_status(&self) -> WidgetStatus {
        self.status.borrow().clone()
    }

    /// Stop the event loop, closing any session, and wait for it.
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            warn!("Widget event loop ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use crate::testing::{FakeBackend, FakeConnector};

    #[tokio::test]
    async fn test_connect_and_shutdown() {
        let backend = FakeBackend::new();
        let connector = FakeConnector::new();
        let widget = VoiceWidget::launch(
            AppConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(connector.clone()),
        );
        let mut status = widget.status();

        assert!(widget.connect().await);
        status.wait_for(|s| s.is_connected()).await.unwrap();

        widget.shutdown().await;
        assert_eq!(status.borrow().connection, SessionState::Disconnected);
        assert_eq!(backend.microphone().stop_count(), 1);
    }

    #[tokio::test]
    async fn test_error_then_retry() {
        let backend = FakeBackend::new();
        let connector = FakeConnector::new();
        connector.refuse("quota exceeded");
        let widget = VoiceWidget::launch(
            AppConfig::default(),
            Arc::new(backend.clone()),
            Arc::new(connector.clone()),
        );
        let mut status = widget.status();

        widget.connect().await;
        let failed = status.wait_for(|s| s.error.is_some()).await.unwrap().clone();
        assert_eq!(failed.error.map(|e| e.message), Some("Erreur de connexion"));

        connector.accept();
        widget.connect().await;
        status.wait_for(|s| s.is_connected() && s.error.is_none()).await.unwrap();

        widget.shutdown().await;
    }
}
