//! # Live Session Transport
//!
//! Connects the widget to the remote realtime speech service over a websocket
//! and translates between its JSON protocol and widget events.
//!
//! ## Protocol:
//! 1. **Connect**: `wss://<endpoint>?key=<api key>`
//! 2. **Setup**: first client message names the model, the AUDIO response
//!    modality and the persona; the session is accepted once the server
//!    answers `setupComplete`
//! 3. **Media**: microphone packets are sent as `realtimeInput.mediaChunks`
//! 4. **Server content**: synthesized speech arrives as `inlineData` parts of
//!    a model turn, plus `interrupted` and `turnComplete` flags
//!
//! ## Message Format:
//! - **Client → Server**: JSON text frames
//! - **Server → Client**: JSON, as text or binary frames
//!
//! The rest of the widget never sees the socket: a [`LiveConnector`] yields a
//! [`TransportLink`] made of one bounded outbound channel and one inbound
//! event channel, serviced by a writer task and a reader task.

use crate::audio::codec::EncodedPacket;
use crate::error::{WidgetError, WidgetResult};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

/// Messages sent by the widget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedPacket>,
}

impl ClientMessage {
    pub fn setup(setup: &SessionSetup) -> Self {
        ClientMessage::Setup(SetupPayload {
            model: setup.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
        })
    }

    pub fn media(packet: EncodedPacket) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![packet],
        })
    }
}

/// Messages received from the service. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelTurn {
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPart {
    pub inline_data: Option<EncodedPacket>,
    pub text: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> WidgetResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Widget events carried by this message, in playback order.
    ///
    /// Audio parts come first; an interruption flag is reported after them so
    /// that any audio in the same message is flushed along with the rest.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(text) = part.text {
                    trace!("Model text part: {}", text);
                }
                if let Some(data) = part.inline_data {
                    events.push(ServerEvent::Audio(data));
                }
            }
        }
        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
        events
    }
}

/// What the transport reports to the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A chunk of synthesized speech
    Audio(EncodedPacket),
    /// The visitor barged in; stop speaking now
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// The remote closed the session, with its reason if any
    Closed(Option<String>),
    /// The transport failed
    Error(String),
}

/// What the session manager asks the transport to send.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Media(EncodedPacket),
    Close,
}

/// Per-session parameters sent in the setup message.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub system_instruction: String,
}

/// An established session: one way in, one way out.
pub struct TransportLink {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Opens remote sessions.
///
/// The returned future is `'static` so the session manager can hold it while
/// it keeps serving other events, and drop it to cancel a pending connect.
pub trait LiveConnector: Send + Sync {
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, WidgetResult<TransportLink>>;
}

/// Connector for the Gemini Live bidirectional streaming endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    endpoint: String,
    api_key: String,
    timeout: Duration,
    outbound_capacity: usize,
}

impl GeminiLiveConnector {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout,
            outbound_capacity: 32,
        }
    }

    pub fn from_config(config: &crate::config::AppConfig) -> Self {
        Self::new(&config.live.endpoint, &config.live.api_key, config.connect_timeout())
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

impl LiveConnector for GeminiLiveConnector {
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, WidgetResult<TransportLink>> {
        let this = self.clone();
        async move {
            if this.api_key.trim().is_empty() {
                return Err(WidgetError::ConnectionError("no API key configured".to_string()));
            }

            info!("Connecting to {} with model {}", this.endpoint, setup.model);
            let (write, read) = tokio::time::timeout(this.timeout, handshake(this.url(), &setup))
                .await
                .map_err(|_| WidgetError::ConnectionError(format!("no setup reply within {:?}", this.timeout)))??;
            info!("Live session accepted");

            let (outbound_tx, outbound_rx) = mpsc::channel(this.outbound_capacity);
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

            tokio::spawn(write_loop(write, outbound_rx));
            tokio::spawn(read_loop(read, inbound_tx));

            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        }
        .boxed()
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the socket, send the setup message and wait for its acknowledgement.
async fn handshake(url: String, setup: &SessionSetup) -> WidgetResult<(SplitSink<Socket, Message>, SplitStream<Socket>)> {
    let (socket, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut write, mut read) = socket.split();

    let setup_json = serde_json::to_string(&ClientMessage::setup(setup))?;
    write.send(Message::Text(setup_json)).await?;

    // Nothing but the acknowledgement is expected before the session opens
    while let Some(message) = read.next().await {
        let parsed = match message? {
            Message::Text(text) => ServerMessage::parse(&text)?,
            Message::Binary(bytes) => ServerMessage::parse(&String::from_utf8_lossy(&bytes))?,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                return Err(WidgetError::ConnectionError(format!("session refused: {}", reason)));
            }
            _ => continue,
        };
        if parsed.is_setup_complete() {
            return Ok((write, read));
        }
    }
    Err(WidgetError::ConnectionError("connection ended during setup".to_string()))
}

async fn write_loop<S>(mut write: S, mut outbound: mpsc::Receiver<OutboundMessage>)
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(message) = outbound.recv().await {
        match message {
            OutboundMessage::Media(packet) => {
                let json = match serde_json::to_string(&ClientMessage::media(packet)) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize media chunk: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Failed to send media chunk: {}", e);
                    break;
                }
            }
            OutboundMessage::Close => break,
        }
    }

    debug!("Closing websocket");
    let _ = write.send(Message::Close(None)).await;
    let _ = write.close().await;
}

async fn read_loop<S>(mut read: S, inbound: mpsc::UnboundedSender<ServerEvent>)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let closed = loop {
        let message = match read.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break ServerEvent::Error(e.to_string()),
            None => break ServerEvent::Closed(None),
        };

        let parsed = match message {
            Message::Text(text) => ServerMessage::parse(&text),
            Message::Binary(bytes) => ServerMessage::parse(&String::from_utf8_lossy(&bytes)),
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                break ServerEvent::Closed(reason);
            }
            _ => continue,
        };

        match parsed {
            Ok(message) => {
                if message.go_away.is_some() {
                    warn!("Server announced the session will end soon");
                }
                for event in message.into_events() {
                    if inbound.send(event).is_err() {
                        // Session manager is gone
                        return;
                    }
                }
            }
            Err(e) => warn!("Ignoring unreadable server message: {}", e),
        }
    };

    debug!("Websocket reader finished: {:?}", closed);
    let _ = inbound.send(closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::encode_pcm;

    #[test]
    fn test_setup_message_shape() {
        let setup = SessionSetup {
            model: "models/test".to_string(),
            system_instruction: "Sois concise.".to_string(),
        };
        let json = serde_json::to_value(ClientMessage::setup(&setup)).unwrap();

        assert_eq!(json["setup"]["model"], "models/test");
        assert_eq!(json["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(json["setup"]["systemInstruction"]["parts"][0]["text"], "Sois concise.");
    }

    #[test]
    fn test_media_message_shape() {
        let json = serde_json::to_value(ClientMessage::media(encode_pcm(&[0], 16000))).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAA=");
    }

    #[test]
    fn test_setup_complete_detection() {
        assert!(ServerMessage::parse(r#"{"setupComplete": {}}"#).unwrap().is_setup_complete());
        assert!(!ServerMessage::parse(r#"{"serverContent": {}}"#).unwrap().is_setup_complete());
    }

    #[test]
    fn test_audio_then_interruption_order() {
        let text = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "bonjour"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQA="}}
                ]},
                "interrupted": true
            }
        }"#;
        let events = ServerMessage::parse(text).unwrap().into_events();

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ServerEvent::Audio(p) if p.data == "AAA="));
        assert!(matches!(&events[1], ServerEvent::Audio(p) if p.data == "AQA="));
        assert_eq!(events[2], ServerEvent::Interrupted);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let message = ServerMessage::parse(r#"{"usageMetadata": {"totalTokenCount": 3}}"#).unwrap();
        assert!(message.into_events().is_empty());

        let events = ServerMessage::parse(r#"{"serverContent": {"turnComplete": true}}"#)
            .unwrap()
            .into_events();
        assert_eq!(events, vec![ServerEvent::TurnComplete]);
    }

    #[test]
    fn test_invalid_json_is_connection_error() {
        let err = ServerMessage::parse("{not json").unwrap_err();
        assert_eq!(err.code(), "connection_error");
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_fast() {
        let connector = GeminiLiveConnector::new("wss://localhost/unused", "", Duration::from_secs(1));
        let setup = SessionSetup {
            model: "models/test".to_string(),
            system_instruction: String::new(),
        };
        let err = connector.connect(setup).await.err().unwrap();
        assert_eq!(err.code(), "connection_error");
    }
}
