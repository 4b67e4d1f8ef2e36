//! Listen and liveness settings
//!
//! Both structs deserialize from JSON with every field optional, so a config
//! file only needs the values it changes. Durations are written in
//! milliseconds.

use crate::error::{Result, ServerError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Hard ceiling on concurrent peers, whatever `max_players` says.
pub const MAX_PLAYERS_UPPER_LIMIT: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenParameters {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub max_players: u32,
    pub max_channels: u8,
    /// Map loaded once hosting succeeds
    pub map: String,
}

impl ListenParameters {
    /// Peer ceiling handed to the transport.
    pub fn peer_limit(&self) -> usize {
        self.max_players.min(MAX_PLAYERS_UPPER_LIMIT) as usize
    }
}

impl Default for ListenParameters {
    fn default() -> Self {
        Self {
            name: "Netpulse Server".to_string(),
            host: "127.0.0.1".to_string(),
            port: 27015,
            max_players: 16,
            max_channels: 2,
            map: "lobby".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    #[serde(rename = "ping_interval_ms", with = "millis")]
    pub ping_interval: Duration,
    #[serde(rename = "client_timeout_ms", with = "millis")]
    pub client_timeout: Duration,
    /// Application-level ping/pong. When false the transport's own
    /// heartbeat is trusted and its round-trip figures are only logged.
    pub custom_heartbeat: bool,
    /// Grace period between sending `Terminate` and tearing the peer down
    #[serde(rename = "disconnect_flush_ms", with = "millis")]
    pub disconnect_flush: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(15),
            custom_heartbeat: true,
            disconnect_flush: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: ListenParameters,
    pub liveness: LivenessConfig,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| config_error(path, e))?;
        serde_json::from_str(&text).map_err(|e| config_error(path, e))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| config_error(Path::new("<inline>"), e))
    }
}

fn config_error(path: &Path, error: impl std::fmt::Display) -> ServerError {
    ServerError::Config {
        path: path.to_path_buf(),
        message: error.to_string(),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LivenessConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.client_timeout, Duration::from_secs(15));
        assert!(config.custom_heartbeat);

        let params = ListenParameters::default();
        assert_eq!(params.host, "127.0.0.1");
        assert_eq!(params.peer_limit(), 16);
    }

    #[test]
    fn test_peer_limit_is_capped() {
        let params = ListenParameters {
            max_players: 1000,
            ..Default::default()
        };
        assert_eq!(params.peer_limit(), 255);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json(
            r#"{ "listen": { "port": 30000, "map": "docks" }, "liveness": { "client_timeout_ms": 2500 } }"#,
        )
        .unwrap();

        assert_eq!(config.listen.port, 30000);
        assert_eq!(config.listen.map, "docks");
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.liveness.client_timeout, Duration::from_millis(2500));
        assert_eq!(config.liveness.ping_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_json_round_trip() {
        let config = ServerConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"ping_interval_ms\":5000"));
        assert_eq!(ServerConfig::from_json(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_json() {
        let result = ServerConfig::from_json("{ \"listen\": 5 }");
        assert!(matches!(result, Err(ServerError::Config { .. })));
    }

    #[test]
    fn test_missing_file() {
        let path = Path::new("/definitely/not/here/server.json");
        match ServerConfig::load(path) {
            Err(ServerError::Config { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected {:?}", other),
        }
    }
}
