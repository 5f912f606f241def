//! # Configuration Management
//!
//! This module handles loading the widget configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` / `API_KEY` for the remote API key
//! 2. Environment variables (APP__LIVE__MODEL, APP__AUDIO__OUTPUT_DEVICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::frame::{CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Persona given to the remote assistant when a session opens.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "Tu es Léa, l'assistante virtuelle d'un designer web freelance. \
Tu es française, amicale et professionnelle. Ton rôle est d'aider les clients potentiels en répondant \
à leurs questions sur les services (Création site vitrine, E-commerce, Apps), les tarifs (Essentiel à \
partir de 1500€, Pro à 3500€, Premium sur devis) et le processus. Sois concise. Si un client veut un \
devis précis, invite-le à utiliser le formulaire de contact ou à écrire à hello@designer-web.fr.";

/// Main widget configuration that contains all settings.
///
/// ## Why separate config structs:
/// The remote session, the audio pipeline and the visual widget are tuned
/// independently, so each gets its own section in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub live: LiveConfig,
    pub audio: AudioSettings,
    pub widget: WidgetConfig,
}

/// Remote realtime session settings.
///
/// ## Fields:
/// - `endpoint`: websocket URL of the bidirectional streaming service
/// - `model`: model resource name requested in the setup message
/// - `api_key`: credential appended to the endpoint as `?key=`
/// - `system_instruction`: persona sent once per session
/// - `connect_timeout_secs`: how long to wait for the setup acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub system_instruction: String,
    pub connect_timeout_secs: u64,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `input_sample_rate`: rate of captured frames sent upstream (16 kHz)
/// - `output_sample_rate`: rate of synthesized speech frames (24 kHz)
/// - `capture_frame_samples`: samples per captured frame (4096)
/// - `outbound_queue_capacity`: packets held before the oldest is dropped
/// - `capture_channel_capacity`: frames buffered between device thread and session
/// - `input_device` / `output_device`: device names, default device when unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub capture_frame_samples: usize,
    pub outbound_queue_capacity: usize,
    pub capture_channel_capacity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
}

/// Visual widget settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WidgetConfig {
    /// How long the "is speaking" indicator stays lit after an audio chunk
    pub speaking_indicator_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                api_key: String::new(),
                system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
                connect_timeout_secs: 15,
            },
            audio: AudioSettings {
                input_sample_rate: CAPTURE_SAMPLE_RATE,      // What the remote expects from the microphone
                output_sample_rate: PLAYBACK_SAMPLE_RATE,    // What the remote synthesizes
                capture_frame_samples: CAPTURE_FRAME_SAMPLES, // ~256ms at 16kHz
                outbound_queue_capacity: 64,    // ~16s of microphone audio
                capture_channel_capacity: 16,
                input_device: None,
                output_device: None,
            },
            widget: WidgetConfig {
                speaking_indicator_ms: 500,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__LIVE__MODEL=models/other-model`: Override the model
    /// - `APP__AUDIO__OUTPUT_DEVICE=Speakers`: Pick an output device by name
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: Provide the credential
    ///
    /// A double underscore separates sections so that field names keep their
    /// own underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("__").separator("__"));

        // Conventional credential variables win over everything else
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        } else if let Ok(key) = env::var("API_KEY") {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The API key is not checked here: a widget without a key still starts
    /// and reports a connection error when the visitor tries to talk.
    pub fn validate(&self) -> Result<()> {
        if self.live.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Live endpoint cannot be empty"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.live.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_frame_samples == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.audio.outbound_queue_capacity == 0 || self.audio.capture_channel_capacity == 0 {
            return Err(anyhow::anyhow!("Queue capacities must be greater than 0"));
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.live.connect_timeout_secs)
    }

    pub fn speaking_indicator(&self) -> Duration {
        Duration::from_millis(self.widget.speaking_indicator_ms)
    }

    pub fn has_api_key(&self) -> bool {
        !self.live.api_key.trim().is_empty()
    }
}
