//! Configuration Module
//!
//! Load order, later overrides earlier:
//! 1. Default values
//! 2. TOML file (`tracker.toml` in the platform config directory, or an explicit path)
//! 3. Environment variables (`CARE_TRACKER_*`)
//!
//! ```toml
//! [api]
//! base_url = "https://care.example.org"
//! upload_timeout_secs = 10
//! geocode_timeout_secs = 8
//! language = "zh-TW"
//!
//! [foreground.watch]
//! distance_filter_m = 5.0
//! interval_secs = 60
//!
//! [background]
//! interval_minutes = 15
//! network = "any"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::controller::ControllerOptions;
use crate::position::PositionOptions;
use crate::scheduler::BackgroundOptions;

/// Shortest periodic wake the mobile platforms will honor
pub const MIN_BACKGROUND_INTERVAL_MINUTES: u32 = 15;

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub upload_timeout_secs: u64,
    pub geocode_timeout_secs: u64,
    /// Language passed to the reverse geocoder
    pub language: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            upload_timeout_secs: 10,
            geocode_timeout_secs: 8,
            language: "zh-TW".to_string(),
        }
    }
}

impl ApiSettings {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn geocode_timeout(&self) -> Duration {
        Duration::from_secs(self.geocode_timeout_secs)
    }
}

/// Acquisition settings while the app is in the foreground
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForegroundSettings {
    #[serde(default = "PositionOptions::one_shot", deserialize_with = "one_shot_options")]
    pub one_shot: PositionOptions,

    #[serde(default = "PositionOptions::watch", deserialize_with = "watch_options")]
    pub watch: PositionOptions,
}

impl Default for ForegroundSettings {
    fn default() -> Self {
        Self {
            one_shot: PositionOptions::one_shot(),
            watch: PositionOptions::watch(),
        }
    }
}

/// Periodic wake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSettings {
    #[serde(flatten)]
    pub schedule: BackgroundOptions,

    /// Ask for the separate background-location grant at startup. Off by
    /// default so that refusing "allow all the time" keeps foreground tracking.
    #[serde(default)]
    pub require_permission: bool,

    /// One-shot options used inside a wake
    #[serde(default = "background_position", deserialize_with = "background_options")]
    pub position: PositionOptions,
}

fn background_position() -> PositionOptions {
    PositionOptions {
        maximum_age_secs: 0,
        ..PositionOptions::one_shot()
    }
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            schedule: BackgroundOptions::default(),
            require_permission: false,
            position: background_position(),
        }
    }
}

/// Position options as written in the file. Unset fields keep the
/// call site's own values.
#[derive(Debug, Default, Deserialize)]
struct PositionOverrides {
    high_accuracy: Option<bool>,
    timeout_secs: Option<u64>,
    maximum_age_secs: Option<u64>,
    distance_filter_m: Option<f64>,
    interval_secs: Option<u64>,
}

impl PositionOverrides {
    fn over(self, base: PositionOptions) -> PositionOptions {
        PositionOptions {
            high_accuracy: self.high_accuracy.unwrap_or(base.high_accuracy),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
            maximum_age_secs: self.maximum_age_secs.unwrap_or(base.maximum_age_secs),
            distance_filter_m: self.distance_filter_m.unwrap_or(base.distance_filter_m),
            interval_secs: self.interval_secs.or(base.interval_secs),
        }
    }
}

fn one_shot_options<'de, D: Deserializer<'de>>(d: D) -> Result<PositionOptions, D::Error> {
    PositionOverrides::deserialize(d).map(|o| o.over(PositionOptions::one_shot()))
}

fn watch_options<'de, D: Deserializer<'de>>(d: D) -> Result<PositionOptions, D::Error> {
    PositionOverrides::deserialize(d).map(|o| o.over(PositionOptions::watch()))
}

fn background_options<'de, D: Deserializer<'de>>(d: D) -> Result<PositionOptions, D::Error> {
    PositionOverrides::deserialize(d).map(|o| o.over(background_position()))
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Log directory; platform data directory when unset
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,hyper=warn,reqwest=warn".to_string(),
            directory: None,
        }
    }
}

/// Complete tracker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub foreground: ForegroundSettings,

    #[serde(default)]
    pub background: BackgroundSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrackerConfig {
    /// Load from file and environment on top of defaults, then validate
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading tracker config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Load, falling back to defaults on any error
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load tracker config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn save(&self, config_path: Option<PathBuf>) -> Result<(), ConfigError> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ConfigError::Invalid("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        info!(?path, "Tracker config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.api.base_url.trim();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!(
                "API base URL must start with http:// or https://, got: '{}'",
                url
            )));
        }

        if self.api.upload_timeout_secs == 0 || self.api.geocode_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request timeouts must be greater than 0".into()));
        }

        for (name, options) in [
            ("foreground.one_shot", &self.foreground.one_shot),
            ("foreground.watch", &self.foreground.watch),
            ("background.position", &self.background.position),
        ] {
            if options.timeout_secs == 0 {
                return Err(ConfigError::Invalid(format!("{name}.timeout_secs must be greater than 0")));
            }
            if options.distance_filter_m.is_nan() || options.distance_filter_m < 0.0 {
                return Err(ConfigError::Invalid(format!("{name}.distance_filter_m must not be negative")));
            }
        }

        if self.background.schedule.interval_minutes < MIN_BACKGROUND_INTERVAL_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "background.interval_minutes must be at least {}",
                MIN_BACKGROUND_INTERVAL_MINUTES
            )));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CARE_TRACKER_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }

        if let Ok(language) = std::env::var("CARE_TRACKER_LANGUAGE") {
            self.api.language = language;
        }

        if let Ok(minutes) = std::env::var("CARE_TRACKER_BACKGROUND_INTERVAL") {
            match minutes.parse::<u32>() {
                Ok(m) => self.background.schedule.interval_minutes = m,
                Err(_) => warn!(value = %minutes, "Ignoring invalid background interval"),
            }
        }

        if let Ok(meters) = std::env::var("CARE_TRACKER_DISTANCE_FILTER") {
            match meters.parse::<f64>() {
                Ok(m) => self.foreground.watch.distance_filter_m = m,
                Err(_) => warn!(value = %meters, "Ignoring invalid distance filter"),
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("CareTracker").join("tracker.toml"))
    }

    /// Options for a [`crate::controller::SyncController`]
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            require_background: self.background.require_permission,
            one_shot: self.foreground.one_shot.clone(),
            watch: self.foreground.watch.clone(),
            background: self.background.schedule.clone(),
            background_position: self.background.position.clone(),
            language: self.api.language.clone(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
