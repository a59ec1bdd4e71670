//! Configuration for servers and channels.
//!
//! Every section has serde defaults, so a partial file (or none at all) is
//! valid. [`Config::load`] layers defaults, an optional YAML file and
//! `CALCWIRE_` environment variables, in that order. Nested keys use `__` in
//! variable names, e.g. `CALCWIRE_SERVER__MAX_CONCURRENT_CALLS=64`.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::writer::WriterConfig;

/// Default listen address for the server.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:50055";

/// Default maximum concurrent calls per connection.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// Default number of buffered inbound events per call. One full read of
/// minimal frames fits, so only a stalled consumer overflows.
pub const DEFAULT_CALL_BUFFER: usize = 8192;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CALCWIRE_";

/// Server-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address `calcwire serve` binds to.
    pub listen: String,
    /// Calls running at once on one connection; extra calls are refused
    /// with `ResourceExhausted`.
    pub max_concurrent_calls: usize,
    /// Unread requests buffered per call. A handler that falls further
    /// behind has its call failed with `ResourceExhausted`.
    pub call_buffer: usize,
    /// Largest accepted frame payload, in bytes.
    pub max_payload_size: u32,
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            call_buffer: DEFAULT_CALL_BUFFER,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

/// Caller-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Address the CLI connects to.
    pub endpoint: String,
    /// Unread responses buffered per call. A caller that falls further
    /// behind has its call cancelled with `ResourceExhausted`.
    pub call_buffer: usize,
    /// Largest accepted frame payload, in bytes.
    pub max_payload_size: u32,
    /// Deadline applied to calls that do not set one.
    pub default_deadline_ms: Option<u64>,
    pub writer: WriterConfig,
}

impl ChannelConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LISTEN.to_string(),
            call_buffer: DEFAULT_CALL_BUFFER,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            default_deadline_ms: None,
            writer: WriterConfig::default(),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ChannelConfig,
}

impl Config {
    /// Figment with every layer applied, for callers that merge more on top.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from defaults, `path` and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, DEFAULT_LISTEN);
        assert_eq!(config.server.max_concurrent_calls, DEFAULT_MAX_CONCURRENT_CALLS);
        assert_eq!(config.client.default_deadline(), None);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "server:\n  max_concurrent_calls: 8\nclient:\n  default_deadline_ms: 1500\n";
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();

        assert_eq!(config.server.max_concurrent_calls, 8);
        assert_eq!(config.server.call_buffer, DEFAULT_CALL_BUFFER);
        assert_eq!(config.client.default_deadline(), Some(Duration::from_millis(1500)));
        assert_eq!(config.client.writer, WriterConfig::default());
    }

    #[test]
    fn test_nested_writer_section() {
        let yaml = "server:\n  writer:\n    backpressure_timeout_ms: 250\n";
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();

        assert_eq!(
            config.server.writer.backpressure_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(
            config.server.writer.max_pending_frames,
            crate::writer::DEFAULT_MAX_PENDING_FRAMES
        );
    }
}
