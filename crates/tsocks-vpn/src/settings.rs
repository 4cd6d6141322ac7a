//! Persisted Settings
//!
//! The key/value settings the control plane reads at every start attempt.
//! Field names are the persisted keys, so a settings file written by any
//! front end can be loaded directly:
//!
//! ```toml
//! mtu = "1500"
//! ipv4_enabled = true
//! ipv6_enabled = false
//! dns_v4 = "8.8.8.8"
//! excluded_ips = "192.168.1.0/24, 10.0.0.5"
//! app_filter_mode = "exclude"
//! selected_apps = ["com.example.browser"]
//! proxy_protocol = "SOCKS5"
//! proxy_server = "proxy.example.com"
//! proxy_port = "1080"
//! ```
//!
//! Storage itself belongs to the host application; [`SettingsSource`] is the
//! seam it plugs into.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Per-app selection mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppFilterMode {
    /// Only the selected apps are tunneled
    Include,
    /// Every app except the selected ones is tunneled
    #[default]
    Exclude,
}

/// How the `excluded_ips` list is applied to the interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Listed prefixes are installed as additional capture routes
    #[default]
    Capture,
    /// Listed prefixes are punched out of the default route
    Bypass,
}

/// Persisted VPN settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Interface MTU (integer string)
    #[serde(default = "default_mtu")]
    pub mtu: String,
    /// Configure the IPv4 side of the interface
    #[serde(default = "default_true")]
    pub ipv4_enabled: bool,
    /// Configure the IPv6 side of the interface
    #[serde(default)]
    pub ipv6_enabled: bool,
    /// IPv4 DNS resolver (empty = none)
    #[serde(default = "default_dns_v4")]
    pub dns_v4: String,
    /// IPv6 DNS resolver (empty = none)
    #[serde(default = "default_dns_v6")]
    pub dns_v6: String,
    /// Comma-separated route list
    #[serde(default)]
    pub excluded_ips: String,
    /// Per-app selection mode
    #[serde(default)]
    pub app_filter_mode: AppFilterMode,
    /// Selected package identifiers
    #[serde(default)]
    pub selected_apps: BTreeSet<String>,
    /// Proxy protocol name
    #[serde(default = "default_protocol")]
    pub proxy_protocol: String,
    /// Proxy server host
    #[serde(default)]
    pub proxy_server: String,
    /// Proxy server port (integer string)
    #[serde(default = "default_port")]
    pub proxy_port: String,
    #[serde(default)]
    pub proxy_username: String,
    #[serde(default)]
    pub proxy_password: String,
    /// Meaning of `excluded_ips`
    #[serde(default)]
    pub route_mode: RouteMode,
    /// Interface session label shown by the platform
    #[serde(default = "default_session_name")]
    pub session_name: String,
}

fn default_mtu() -> String {
    "1500".to_string()
}

fn default_true() -> bool {
    true
}

fn default_dns_v4() -> String {
    "8.8.8.8".to_string()
}

fn default_dns_v6() -> String {
    "2001:4860:4860::8888".to_string()
}

fn default_protocol() -> String {
    "SOCKS5".to_string()
}

fn default_port() -> String {
    "1080".to_string()
}

fn default_session_name() -> String {
    "TSocks VPN".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            ipv4_enabled: true,
            ipv6_enabled: false,
            dns_v4: default_dns_v4(),
            dns_v6: default_dns_v6(),
            excluded_ips: String::new(),
            app_filter_mode: AppFilterMode::default(),
            selected_apps: BTreeSet::new(),
            proxy_protocol: default_protocol(),
            proxy_server: String::new(),
            proxy_port: default_port(),
            proxy_username: String::new(),
            proxy_password: String::new(),
            route_mode: RouteMode::default(),
            session_name: default_session_name(),
        }
    }
}

impl Settings {
    /// Load from a file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::from_str_as(&content, format)
    }

    /// Parse settings text in the given format
    pub fn from_str_as(content: &str, format: ConfigFormat) -> Result<Self, SettingsError> {
        match format {
            ConfigFormat::Toml => Self::from_toml(content),
            ConfigFormat::Json => Self::from_json(content),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(content).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::Parse(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, SettingsError> {
        serde_json::to_string_pretty(self).map_err(|e| SettingsError::Parse(e.to_string()))
    }
}

/// Settings file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            _ => Err(SettingsError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Where the service reads its settings from at every start.
///
/// Implementations may block (disk, IPC); the service only calls
/// [`SettingsSource::load`] from its background context.
pub trait SettingsSource: Send + Sync {
    /// Read a fresh snapshot of the persisted settings
    fn load(&self) -> Result<Settings, SettingsError>;
}

/// In-memory settings store
#[derive(Debug, Default)]
pub struct MemorySettings {
    inner: RwLock<Settings>,
}

impl MemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Replace the stored settings
    pub fn set(&self, settings: Settings) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Edit the stored settings in place
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl SettingsSource for MemorySettings {
    fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.inner.read().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Settings re-read from a TOML or JSON file on every load
#[derive(Debug, Clone)]
pub struct FileSettings {
    path: PathBuf,
}

impl FileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsSource for FileSettings {
    fn load(&self) -> Result<Settings, SettingsError> {
        Settings::from_file(&self.path)
    }
}

/// Settings load errors
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported settings format: {0}")]
    UnsupportedFormat(String),
}
