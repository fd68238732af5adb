//! Configuration management
//!
//! Static configuration is layered with the `config` crate: built-in defaults,
//! then an optional `config.{toml,json,yaml}` file in the config directory, then
//! `HAB_`-prefixed environment variables (`HAB_CONNECTION__LOCAL_URL`, ...).
//!
//! The `connection` section becomes the runtime [`Settings`], held in a
//! [`SettingsStore`] so it can be replaced while the app runs.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::network::NetworkType;

/// Name of the per-user config directory
const APP_DIR_NAME: &str = "hab-connect";

/// Default timeout for requests made through a connection's HTTP clients
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: Settings,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Server endpoints, credentials and connection policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub local_url: String,
    pub remote_url: String,
    pub cloud_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// When the local URL may be used, depending on the active interface
    pub local_policy: LocalConnectionPolicy,
    /// Probe the local server during resolution and skip it when unreachable
    pub check_local_reachability: bool,
    pub timeout_ms: u64,
    /// Accept self-signed or otherwise untrusted server certificates
    pub accept_invalid_certs: bool,
    pub messages: Messages,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_url: String::new(),
            remote_url: String::new(),
            cloud_url: String::new(),
            username: None,
            password: None,
            local_policy: LocalConnectionPolicy::default(),
            check_local_reachability: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            accept_invalid_certs: false,
            messages: Messages::default(),
        }
    }
}

impl Settings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Gate for the local connection based on the active interface type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalConnectionPolicy {
    /// Local URL is used on every interface
    #[default]
    Any,
    /// Local URL is only used on Wi-Fi
    WifiOnly,
    /// Local URL is used on anything but cellular data
    NonCellular,
}

impl LocalConnectionPolicy {
    pub fn allows(self, network_type: NetworkType) -> bool {
        match self {
            LocalConnectionPolicy::Any => true,
            LocalConnectionPolicy::WifiOnly => network_type == NetworkType::Wifi,
            LocalConnectionPolicy::NonCellular => network_type != NetworkType::Cellular,
        }
    }
}

/// User-facing strings handed out with errors and notices
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Messages {
    pub network_not_available: String,
    pub no_usable_connection: String,
    /// `{}` is replaced by the recognized transcript
    pub voice_recognized_text: String,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            network_not_available: "Network is not available".to_string(),
            no_usable_connection: "Couldn't determine openHAB URL".to_string(),
            voice_recognized_text: "Recognized text: {}".to_string(),
        }
    }
}

impl Messages {
    pub fn recognized_text(&self, text: &str) -> String {
        self.voice_recognized_text.replace("{}", text)
    }
}

/// Desktop stand-in for OS connectivity callbacks
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface type reported while a route exists
    pub interface: NetworkType,
    /// Address a UDP socket is routed towards to detect connectivity
    pub probe_addr: String,
    pub poll_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: NetworkType::Other,
            probe_addr: "192.0.2.1:9".to_string(),
            poll_interval_secs: 5,
        }
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

// =============================================================================
// Runtime settings
// =============================================================================

/// Source of the current settings, read on every resolution pass
pub trait SettingsProvider: Send + Sync {
    fn settings(&self) -> Arc<Settings>;
}

/// Copy-on-write settings holder
///
/// Readers get an `Arc` of the current value; `replace` swaps in a new one.
pub struct SettingsStore {
    current: watch::Sender<Arc<Settings>>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        let (current, _) = watch::channel(Arc::new(settings));
        Self { current }
    }

    pub fn replace(&self, settings: Settings) {
        self.current.send_replace(Arc::new(settings));
    }

    /// Apply an in-place edit to a copy of the current settings
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) {
        self.current.send_modify(|current| edit(Arc::make_mut(current)));
    }

    /// Watch for replacements
    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.current.subscribe()
    }
}

impl SettingsProvider for SettingsStore {
    fn settings(&self) -> Arc<Settings> {
        self.current.borrow().clone()
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Get config directory (HAB_CONFIG_DIR or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HAB_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join(APP_DIR_NAME);
        }
    }

    // Fallback to current directory
    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    load_config_from(&get_config_dir())
}

/// Load configuration with `config_dir` as the location of the optional config file
pub fn load_config_from(config_dir: &Path) -> Result<Config> {
    let config = ::config::Config::builder()
        .set_default("connection.timeout_ms", DEFAULT_TIMEOUT_MS)?
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (HAB_CONNECTION__LOCAL_URL, etc.)
        .add_source(
            ::config::Environment::with_prefix("HAB")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = config.try_deserialize()?;
    tracing::debug!(
        local = !config.connection.local_url.is_empty(),
        remote = !config.connection.remote_url.is_empty(),
        cloud = !config.connection.cloud_url.is_empty(),
        "Connection settings loaded"
    );
    Ok(config)
}
