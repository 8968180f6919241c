use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LapseConfig {
    pub redis: RedisConfig,
    /// When present, the clustered broker is used and `redis.url` is ignored.
    pub cluster: Option<ClusterConfig>,
    pub consumer: ConsumerConfig,
    pub events: EventsConfig,
}

/// Single-node Redis connection. The database index in the URL also selects
/// the keyevent channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

/// Redis Cluster entry points and credentials shared by every node.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub nodes: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Consumer configuration (default pull timeout).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Default wait per pull in milliseconds; `0` blocks indefinitely.
    pub pull_timeout_ms: u64,
}

/// Local dispatch-event channel configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl ConsumerConfig {
    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = LapseConfig::default();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/0");
        assert!(config.cluster.is_none());
        assert_eq!(config.consumer.pull_timeout_ms, 0);
        assert_eq!(config.events.channel_capacity, 1024);
    }

    #[test]
    fn toml_parsing_with_overrides() {
        let toml_str = r#"
            [redis]
            url = "redis://:dev-redis@10.0.0.5:6380/2"

            [consumer]
            pull_timeout_ms = 2500

            [events]
            channel_capacity = 16
        "#;
        let config: LapseConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.redis.url, "redis://:dev-redis@10.0.0.5:6380/2");
        assert_eq!(config.consumer.pull_timeout(), Duration::from_millis(2500));
        assert_eq!(config.events.channel_capacity, 16);
    }

    #[test]
    fn toml_parsing_empty_uses_defaults() {
        let config: LapseConfig = toml::from_str("").unwrap();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/0");
        assert_eq!(config.consumer.pull_timeout(), Duration::ZERO);
    }

    #[test]
    fn toml_parsing_cluster_section() {
        let toml_str = r#"
            [cluster]
            nodes = ["redis://10.0.0.1:7000", "redis://10.0.0.2:7000"]
            password = "secret"
        "#;
        let config: LapseConfig = toml::from_str(toml_str).unwrap();
        let cluster = config.cluster.unwrap();
        assert_eq!(cluster.nodes.len(), 2);
        assert_eq!(cluster.username, None);
        assert_eq!(cluster.password.as_deref(), Some("secret"));
        // Other sections keep their defaults
        assert_eq!(config.events.channel_capacity, 1024);
    }
}
