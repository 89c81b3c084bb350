//! Configuration
//!
//! Loaded from a TOML file (every field optional), then `.env`, then
//! `GEOSHARE_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GeoError, RetryPolicy};
use crate::location::{Coordinates, ParticipantId};
use crate::relay::EchoPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "geoshare.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoshareConfig {
    pub relay: RelayConfig,
    pub participant: ParticipantConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    pub echo_policy: EchoPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            echo_policy: EchoPolicy::ExcludeSender,
        }
    }
}

/// How a participant produces its own samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Query the sensor once per explicit request
    Live {
        /// Fixed coordinates standing in for a device sensor; none means denied
        #[serde(default)]
        fixed: Option<Coordinates>,
    },
    /// Pseudo-random coordinates on a timer
    Synthetic { interval_ms: u64 },
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Live { fixed: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// Stable identity for this session
    pub id: ParticipantId,
    pub relay_url: String,
    pub source: SourceConfig,
    /// Drop peers silent for longer than this; never expire when unset
    pub stale_after_secs: Option<u64>,
    pub connect_attempts: u32,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            id: default_participant_id(),
            relay_url: "ws://127.0.0.1:3000/ws".to_string(),
            source: SourceConfig::default(),
            stale_after_secs: None,
            connect_attempts: 3,
        }
    }
}

impl ParticipantConfig {
    pub fn new(id: impl Into<ParticipantId>, relay_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_secs.map(Duration::from_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts.max(1),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// Directory for a daily-rolling log file
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// `<username>-<8 hex>`, stable once written to the config file.
pub fn default_participant_id() -> ParticipantId {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    ParticipantId::new(format!("{}-{}", whoami::username(), &suffix[..8]))
}

impl GeoshareConfig {
    /// Load `path` if it exists, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, GeoError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| GeoError::Config(format!("{}: {e}", path.display())))?;
            Self::from_toml(&text)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, GeoError> {
        toml::from_str(text).map_err(|e| GeoError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, GeoError> {
        toml::to_string_pretty(self).map_err(|e| GeoError::Config(e.to_string()))
    }

    /// Write a fresh config with a newly generated participant id.
    pub async fn init(path: &Path) -> Result<Self, GeoError> {
        let config = Self::default();
        let text = config.to_toml()?;
        tokio::fs::write(path, text)
            .await
            .map_err(|e| GeoError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), GeoError> {
        if let Some(port) = var("GEOSHARE_PORT") {
            self.relay.port = port
                .parse()
                .map_err(|_| GeoError::Config(format!("GEOSHARE_PORT={port} is not a port")))?;
        }
        if let Some(url) = var("GEOSHARE_RELAY_URL") {
            self.participant.relay_url = url;
        }
        if let Some(id) = var("GEOSHARE_PARTICIPANT_ID") {
            if id.is_empty() {
                return Err(GeoError::Config("GEOSHARE_PARTICIPANT_ID is empty".into()));
            }
            self.participant.id = ParticipantId::new(id);
        }
        if let Some(level) = var("GEOSHARE_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = GeoshareConfig::default();
        assert_eq!(config.relay.port, 3000);
        assert_eq!(config.relay.echo_policy, EchoPolicy::ExcludeSender);
        assert_eq!(config.participant.source, SourceConfig::Live { fixed: None });
        assert!(config.participant.stale_after().is_none());
        assert!(!config.participant.id.as_str().is_empty());
    }

    #[test]
    fn test_partial_toml() {
        let config = GeoshareConfig::from_toml(
            r#"
            [relay]
            port = 4100
            echo_policy = "include_sender"

            [participant]
            id = "alice"
            stale_after_secs = 30

            [participant.source]
            mode = "synthetic"
            interval_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.port, 4100);
        assert_eq!(config.relay.bind, "0.0.0.0");
        assert_eq!(config.relay.echo_policy, EchoPolicy::IncludeSender);
        assert_eq!(config.participant.id, ParticipantId::from("alice"));
        assert_eq!(config.participant.source, SourceConfig::Synthetic { interval_ms: 500 });
        assert_eq!(config.participant.stale_after(), Some(Duration::from_secs(30)));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_live_fixed_coordinates() {
        let config = GeoshareConfig::from_toml(
            r#"
            [participant.source]
            mode = "live"
            fixed = { lat = 48.85, lng = 2.35 }
            "#,
        )
        .unwrap();

        assert_eq!(
            config.participant.source,
            SourceConfig::Live {
                fixed: Some(Coordinates::new(48.85, 2.35))
            }
        );
    }

    #[test]
    fn test_toml_roundtrip_keeps_id() {
        let config = GeoshareConfig::default();
        let text = config.to_toml().unwrap();
        let reloaded = GeoshareConfig::from_toml(&text).unwrap();
        assert_eq!(reloaded.participant.id, config.participant.id);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GEOSHARE_PORT", "5000"),
            ("GEOSHARE_PARTICIPANT_ID", "bob"),
            ("GEOSHARE_RELAY_URL", "ws://relay:5000/ws"),
        ]
        .into_iter()
        .collect();

        let mut config = GeoshareConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.relay.port, 5000);
        assert_eq!(config.participant.id, ParticipantId::from("bob"));
        assert_eq!(config.participant.relay_url, "ws://relay:5000/ws");
    }

    #[test]
    fn test_bad_port_rejected() {
        let mut config = GeoshareConfig::default();
        let result = config.apply_env(|key| (key == "GEOSHARE_PORT").then(|| "http".to_string()));
        assert!(matches!(result, Err(GeoError::Config(_))));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(GeoshareConfig::from_toml("[relay\nport = ").is_err());
    }
}
