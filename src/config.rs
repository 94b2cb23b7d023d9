//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables with the APP_ prefix
//! - The gateway's documented environment variables (WHISPER_MODEL,
//!   WHISPER_COMPUTE_TYPE, WHISPER_DEVICE, WHISPER_LANGUAGE, HOST, PORT)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Documented environment variables
//! 2. APP_-prefixed environment variables
//! 3. Configuration file
//! 4. Defaults
//!
//! Configuration is read once at process start; there is no runtime
//! mutation.

use crate::device::DevicePreference;
use crate::transcription::ComputeType;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub whisper: WhisperConfig,
}

/// Server bind settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech-recognition engine settings.
///
/// ## Fields:
/// - `model`: Whisper model identifier ("tiny", "base", "small", "medium",
///   "large", or a full HuggingFace repo id)
/// - `compute_type`: preferred numeric precision; when the engine rejects
///   it, the fixed fallback sequence is tried
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `language`: forced language code; unset means auto-detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperConfig {
    pub model: String,
    pub compute_type: String,
    pub device: String,
    pub language: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            whisper: WhisperConfig {
                model: "small".to_string(),
                compute_type: "int8_float16".to_string(),
                device: "auto".to_string(),
                language: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // The gateway's documented environment variables do not follow the
        // APP_ prefix convention; map them onto the config tree directly.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(model) = env::var("WHISPER_MODEL") {
            settings = settings.set_override("whisper.model", model)?;
        }
        if let Ok(compute_type) = env::var("WHISPER_COMPUTE_TYPE") {
            settings = settings.set_override("whisper.compute_type", compute_type)?;
        }
        if let Ok(device) = env::var("WHISPER_DEVICE") {
            settings = settings.set_override("whisper.device", device)?;
        }
        if let Ok(language) = env::var("WHISPER_LANGUAGE") {
            settings = settings.set_override("whisper.language", language)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration can actually be used before the server
    /// starts taking requests.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }
        if self.whisper.model.trim().is_empty() {
            return Err(anyhow!("Whisper model identifier cannot be empty"));
        }
        self.preferred_compute()?;
        self.device_preference()?;
        if let Some(language) = &self.whisper.language {
            if language.trim().is_empty() {
                return Err(anyhow!("WHISPER_LANGUAGE must not be blank when set"));
            }
        }
        Ok(())
    }

    /// Preferred precision mode, parsed.
    pub fn preferred_compute(&self) -> Result<ComputeType> {
        self.whisper.compute_type.parse()
    }

    /// Device preference, parsed.
    pub fn device_preference(&self) -> Result<DevicePreference> {
        self.whisper
            .device
            .parse()
            .map_err(|e: String| anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.whisper.model, "small");
        assert_eq!(config.whisper.compute_type, "int8_float16");
        assert_eq!(config.whisper.device, "auto");
        assert!(config.whisper.language.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_compute_type_parses() {
        let config = AppConfig::default();
        assert_eq!(
            config.preferred_compute().unwrap(),
            ComputeType::Int8Float16
        );
    }

    #[test]
    fn test_validation_rejects_port_zero() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_compute_type() {
        let mut config = AppConfig::default();
        config.whisper.compute_type = "bfloat16".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_device() {
        let mut config = AppConfig::default();
        config.whisper.device = "tpu".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_blank_language() {
        let mut config = AppConfig::default();
        config.whisper.language = Some("  ".to_string());
        assert!(config.validate().is_err());
        config.whisper.language = Some("fr".to_string());
        assert!(config.validate().is_ok());
    }
}
