//! Host configuration.
//!
//! Loaded from a TOML file. Every section has defaults, so an empty file
//! (or no file at all) yields a runnable localhost configuration.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use bus::ChannelKind;

/// Host configuration loaded from TOML.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// TCP listen address for framed client traffic.
    pub listen: ListenConfig,

    /// Event/workflow engine settings.
    pub flow: FlowConfig,

    /// Wire-frame validation settings.
    pub frame: FrameConfig,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Bus channels to create at startup.
    pub channel: Vec<ChannelConfig>,

    /// Topic routes binding channels to topics.
    pub route: Vec<RouteConfig>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ListenConfig {
    pub address: SocketAddr,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            address: "127.0.0.1:7680".parse().expect("valid default address"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FlowConfig {
    /// Flow instance name; also names the worker thread.
    pub name: String,

    /// Bounded event queue capacity. Publishes beyond this fail.
    pub queue_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            name: "edge-host".to_string(),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrameConfig {
    /// Maximum accepted frame payload in bytes.
    pub max_payload: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            max_payload: 4 * 1024 * 1024,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Default level filter when RUST_LOG is unset.
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
    /// Include the emitting module path.
    pub target: bool,
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            timestamps: true,
            target: false,
            thread_names: true,
        }
    }
}

/// Bus channel kind as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKindConfig {
    PointToPoint,
    PublishSubscribe,
    RequestResponse,
    Broadcast,
    Multicast,
}

impl From<ChannelKindConfig> for ChannelKind {
    fn from(kind: ChannelKindConfig) -> ChannelKind {
        match kind {
            ChannelKindConfig::PointToPoint => ChannelKind::PointToPoint,
            ChannelKindConfig::PublishSubscribe => ChannelKind::PublishSubscribe,
            ChannelKindConfig::RequestResponse => ChannelKind::RequestResponse,
            ChannelKindConfig::Broadcast => ChannelKind::Broadcast,
            ChannelKindConfig::Multicast => ChannelKind::Multicast,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub name: String,
    pub kind: ChannelKindConfig,
    /// Topic patterns to subscribe (pub-sub and multicast kinds only).
    #[serde(default)]
    pub subscribe: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub topic: String,
    pub channels: Vec<String>,
}
