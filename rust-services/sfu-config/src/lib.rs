//! Configuration management for the SFU plugin
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional configuration file handed over by the host runtime, and
//! `SFU_`-prefixed environment variables using `__` for nesting, e.g.
//! `SFU_MEDIA__LOSS_THRESHOLD=0.2`.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

pub use sfu_logging::LogFormat;

/// Feedback-driven media control tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MediaControlConfig {
    /// Loss fraction (0.0 - 1.0) above which a receiver report opens a loss event
    pub loss_threshold: f32,
    /// Minimum spacing between keyframe requests sent to one source
    pub keyframe_min_interval_ms: u64,
    /// Starting point of every per-source bitrate estimate (bps)
    pub initial_bitrate_bps: u32,
    /// Lower bound for REMB values (bps)
    pub min_bitrate_bps: u32,
    /// Upper bound for REMB values (bps)
    pub max_bitrate_bps: u32,
    /// Relative change of the aggregate ceiling required before a new REMB is sent
    pub bitrate_hysteresis: f32,
}

impl Default for MediaControlConfig {
    fn default() -> Self {
        MediaControlConfig {
            loss_threshold: 0.10,
            keyframe_min_interval_ms: 1000,
            initial_bitrate_bps: 1_000_000,
            min_bitrate_bps: 64_000,
            max_bitrate_bps: 2_500_000,
            bitrate_hysteresis: 0.05,
        }
    }
}

/// Access control for signaling
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Require a valid signed token on `join`
    pub require_token: bool,
    /// Descriptor the token must additionally grant, if any
    pub descriptor: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Plugin configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub media: MediaControlConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl SfuConfig {
    /// Load configuration from an optional file plus the environment
    ///
    /// A missing file is not an error: hosts routinely pass a configuration
    /// directory that has no entry for this plugin.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config: SfuConfig = builder
            .add_source(
                Environment::with_prefix("SFU")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the media controller cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let media = &self.media;
        if !(media.loss_threshold > 0.0 && media.loss_threshold <= 1.0) {
            return Err(ConfigError::Message(format!(
                "media.loss_threshold must be in (0, 1], got {}",
                media.loss_threshold
            )));
        }
        if media.min_bitrate_bps > media.max_bitrate_bps {
            return Err(ConfigError::Message(format!(
                "media.min_bitrate_bps ({}) exceeds media.max_bitrate_bps ({})",
                media.min_bitrate_bps, media.max_bitrate_bps
            )));
        }
        if !(0.0..1.0).contains(&media.bitrate_hysteresis) {
            return Err(ConfigError::Message(format!(
                "media.bitrate_hysteresis must be in [0, 1), got {}",
                media.bitrate_hysteresis
            )));
        }
        Ok(())
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.logging.level.is_empty() {
            "info"
        } else {
            &self.logging.level
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_defaults() {
        let config = SfuConfig::default();
        assert_eq!(config.media.loss_threshold, 0.10);
        assert_eq!(config.media.keyframe_min_interval_ms, 1000);
        assert!(!config.auth.require_token);
        assert_eq!(config.log_level(), "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            [media]
            loss_threshold = 0.25
            max_bitrate_bps = 800000

            [auth]
            require_token = true
            descriptor = "room:lobby"

            [logging]
            level = "debug"
            format = "console"
            "#,
        );

        let config = SfuConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.media.loss_threshold, 0.25);
        assert_eq!(config.media.max_bitrate_bps, 800_000);
        // Untouched keys keep their defaults
        assert_eq!(config.media.min_bitrate_bps, 64_000);
        assert!(config.auth.require_token);
        assert_eq!(config.auth.descriptor.as_deref(), Some("room:lobby"));
        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.logging.format, LogFormat::Console);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SfuConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.media, MediaControlConfig::default());
    }

    #[test]
    fn test_invalid_bitrate_bounds_rejected() {
        let file = write_config(
            r#"
            [media]
            min_bitrate_bps = 900000
            max_bitrate_bps = 100000
            "#,
        );

        assert!(SfuConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_invalid_loss_threshold_rejected() {
        let mut config = SfuConfig::default();
        config.media.loss_threshold = 0.0;
        assert!(config.validate().is_err());

        config.media.loss_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
