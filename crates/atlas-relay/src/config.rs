//! Relay configuration: built-in profiles, optional TOML file, CLI overrides.

use std::path::Path;
use std::time::Duration;

use atlas_live::{ApiKey, LiveSetup};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

const DIALOG_INSTRUCTION: &str =
    "Sen Dr. Atlas'sın. Türkçe konuşan, yardımsever bir psikoloji asistanısın.";

const CLASSIC_INSTRUCTION: &str = "\
Sen Dr. Atlas'sın. Empati yeteneği çok yüksek, profesyonel bir psikoloji asistanısın.
Kullanıcıyla sesli sohbet ediyorsun. Ses tonun sakinleştirici, güven verici ve doğal olmalı.
Kısa, öz ve karşılıklı sohbete uygun cevaplar ver.
Eğer kullanıcı üzgünse ses tonunu yumuşat, neşeliyse enerjik ol.";

/// Built-in model and persona presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Native-audio dialog model with a short instruction.
    #[default]
    Dialog,
    /// Flash experimental model with the full persona instruction.
    Classic,
}

impl Profile {
    pub fn model(self) -> &'static str {
        match self {
            Self::Dialog => "gemini-2.5-flash-native-audio-dialog",
            Self::Classic => "gemini-2.0-flash-exp",
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            Self::Dialog => DIALOG_INSTRUCTION,
            Self::Classic => CLASSIC_INSTRUCTION,
        }
    }

    pub fn port(self) -> u16 {
        match self {
            Self::Dialog => 10000,
            Self::Classic => 8000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Falls back to the profile's port when unset.
    pub port: Option<u16>,
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: None,
            path: "/ws/chat".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub profile: Profile,
    /// Overrides the profile's model.
    pub model: Option<String>,
    /// Overrides the profile's instruction.
    pub instruction: Option<String>,
    pub api_version: String,
    /// Environment variable holding the API key.
    pub credential_env: String,
    /// Overrides the Gemini Live origin.
    pub base_url: Option<String>,
    pub setup_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            model: None,
            instruction: None,
            api_version: "v1alpha".into(),
            credential_env: "GEMINI_API_KEY".into(),
            base_url: None,
            setup_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file. Missing fields use defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::ParseError(format!("failed to read {}: {e}", path.display()))
        })?;

        let config: RelayConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("failed to parse TOML: {e}")))?;

        config.validate()?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "server.path must start with '/', got {:?}",
                self.server.path
            )));
        }
        if self.model().trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream.model must not be empty".into(),
            ));
        }
        if self.upstream.api_version.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream.api_version must not be empty".into(),
            ));
        }
        if self.upstream.credential_env.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream.credential_env must not be empty".into(),
            ));
        }
        if self.upstream.setup_timeout_secs == 0 || self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be at least one second".into(),
            ));
        }
        Ok(())
    }

    pub fn model(&self) -> &str {
        self.upstream
            .model
            .as_deref()
            .unwrap_or_else(|| self.upstream.profile.model())
    }

    pub fn port(&self) -> u16 {
        self.server.port.unwrap_or_else(|| self.upstream.profile.port())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.port())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.setup_timeout_secs)
    }

    pub fn live_setup(&self) -> LiveSetup {
        let instruction = self
            .upstream
            .instruction
            .as_deref()
            .unwrap_or_else(|| self.upstream.profile.instruction());
        LiveSetup::new(self.model())
            .with_api_version(self.upstream.api_version.clone())
            .with_instruction(instruction)
    }

    /// Read the API key from the configured environment variable.
    pub fn credential(&self) -> Option<ApiKey> {
        std::env::var(&self.upstream.credential_env)
            .ok()
            .and_then(ApiKey::new)
    }
}
