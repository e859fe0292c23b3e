//! Configuration for the streaming server.

use std::net::SocketAddr;
use std::path::Path;

use droidcast_core::{EngineConfig, StreamSettings};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listener.
    pub network: NetworkConfig,
    /// Which device to stream at startup.
    pub device: DeviceConfig,
    /// Initial quality / width / fps.
    pub stream: StreamSettings,
    /// Capture engine tunables.
    pub engine: EngineConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the HTTP / WebSocket server binds to.
    pub bind: SocketAddr,
}

/// Device selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// adb serial to start streaming on launch. Empty waits for
    /// `POST /stream/start`.
    pub device_id: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8765)),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Parse TOML text, rejecting stream settings the engine would refuse.
    pub fn parse(text: &str) -> Result<Self, String> {
        let cfg: Self = toml::from_str(text).map_err(|e| e.to_string())?;
        StreamSettings::default()
            .apply(&droidcast_core::SettingsUpdate {
                quality: Some(cfg.stream.quality),
                max_width: Some(cfg.stream.max_width),
                fps: Some(cfg.stream.fps),
            })
            .map_err(|e| e.to_string())?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The device to auto-start, if any.
    pub fn startup_device(&self) -> Option<&str> {
        let id = self.device.device_id.trim();
        (!id.is_empty()).then_some(id)
    }
}

// ── Tests ────────────────────────────────────────────────────────
