//! Runtime configuration loading: backend endpoint, credentials, analytics and device profile.

use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use rand::{Rng, distr::Alphanumeric, rng};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::{info, warn};

/// Default location on disk where the runtime looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/cardsync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "CARDSYNC_CONFIG_PATH";
/// Environment variable that overrides the configured application key.
const APPLICATION_KEY_ENV: &str = "CARDSYNC_APPLICATION_KEY";
/// Environment variable that overrides the configured server URL.
const SERVER_URL_ENV: &str = "CARDSYNC_SERVER_URL";
/// Endpoint used when nothing else is configured.
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3001/socket";

/// Device characteristics reported with analytics events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// User agent string sent with analytics.
    pub user_agent: String,
    /// Viewport width in CSS pixels.
    pub viewport_width: u32,
    /// Viewport height in CSS pixels.
    pub viewport_height: u32,
    /// Whether the device has a touch screen.
    pub touch: bool,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) cardsync-headless".into(),
            viewport_width: 1280,
            viewport_height: 800,
            touch: false,
        }
    }
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across components.
pub struct RuntimeConfig {
    /// WebSocket endpoint of the sync server.
    pub server_url: String,
    /// Key identifying the host application to the server.
    pub application_key: Option<String>,
    /// Whether analytics events are recorded.
    pub analytics_enabled: bool,
    /// Fixed session id; a fresh one is generated per runtime when absent.
    pub session_id: Option<String>,
    /// Directory for undelivered analytics. In-memory storage is used when absent.
    pub storage_dir: Option<PathBuf>,
    /// Device characteristics used for analytics.
    pub device: DeviceProfile,
    /// Page snapshot loaded by the headless binary.
    pub page_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            application_key: None,
            analytics_enabled: true,
            session_id: None,
            storage_dir: None,
            device: DeviceProfile::default(),
            page_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Load the configuration from disk and apply environment overrides, falling back to
    /// built-in defaults when the file is missing or invalid.
    pub fn load() -> Self {
        Self::load_from(&resolve_config_path()).with_overrides(|name| env::var(name).ok())
    }

    /// Load the configuration file at `path` without environment overrides.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        server_url = %config.server_url,
                        analytics = config.analytics_enabled,
                        "loaded runtime config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Apply the application key and server URL overrides found through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(APPLICATION_KEY_ENV).filter(|value| !value.is_empty()) {
            self.application_key = Some(key);
        }
        if let Some(url) = lookup(SERVER_URL_ENV).filter(|value| !value.is_empty()) {
            self.server_url = url;
        }
        self
    }

    /// Configured session id, or a freshly generated one.
    pub fn session_id_or_generate(&self, now: OffsetDateTime) -> String {
        self.session_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_session_id(now))
    }
}

/// Session identifier of the form `cardsync_<unix millis>_<9 random chars>`.
pub fn generate_session_id(now: OffsetDateTime) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    let suffix: String = rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("cardsync_{millis}_{suffix}")
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    server_url: Option<String>,
    application_key: Option<String>,
    analytics_enabled: Option<bool>,
    session_id: Option<String>,
    storage_dir: Option<PathBuf>,
    device: Option<RawDevice>,
    page_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
/// JSON representation of the device profile.
struct RawDevice {
    user_agent: Option<String>,
    viewport_width: Option<u32>,
    viewport_height: Option<u32>,
    touch: Option<bool>,
}

impl From<RawConfig> for RuntimeConfig {
    fn from(value: RawConfig) -> Self {
        let defaults = RuntimeConfig::default();
        Self {
            server_url: value.server_url.unwrap_or(defaults.server_url),
            application_key: value.application_key.filter(|key| !key.is_empty()),
            analytics_enabled: value.analytics_enabled.unwrap_or(defaults.analytics_enabled),
            session_id: value.session_id,
            storage_dir: value.storage_dir,
            device: value.device.map(Into::into).unwrap_or(defaults.device),
            page_path: value.page_path,
        }
    }
}

impl From<RawDevice> for DeviceProfile {
    fn from(value: RawDevice) -> Self {
        let defaults = DeviceProfile::default();
        Self {
            user_agent: value.user_agent.unwrap_or(defaults.user_agent),
            viewport_width: value.viewport_width.unwrap_or(defaults.viewport_width),
            viewport_height: value.viewport_height.unwrap_or(defaults.viewport_height),
            touch: value.touch.unwrap_or(defaults.touch),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
