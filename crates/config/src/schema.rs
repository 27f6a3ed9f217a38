//! Config schema types.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodegateConfig {
    pub gateway: GatewayConfig,
}

impl NodegateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.validate()
    }
}

/// Peer gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the listener binds to. Port 0 picks an ephemeral port.
    pub listen_address: String,

    /// Directory holding `nodes.json`. Defaults to `<data dir>/gateway`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_dir: Option<PathBuf>,

    /// Skip reconnecting to known nodes and periodic discovery.
    pub no_bootstrap: bool,

    /// Host advertised to peers instead of the local bind host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub announce_host: Option<String>,

    /// Upper bound on dialing plus the connection handshake.
    pub dial_timeout_secs: u64,

    /// How many known nodes a bootstrap pass dials at most.
    pub bootstrap_peers: usize,

    /// Period of the node discovery loop.
    pub discovery_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:9981".into(),
            persist_dir: None,
            no_bootstrap: false,
            announce_host: None,
            dial_timeout_secs: 15,
            bootstrap_peers: 8,
            discovery_interval_secs: 120,
        }
    }
}

impl GatewayConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    /// `persist_dir`, or `<data dir>/gateway` when unset.
    pub fn persist_dir_or_default(&self) -> PathBuf {
        self.persist_dir
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("gateway"))
    }

    /// Reject values no gateway can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::Empty {
                field: "gateway.listen_address",
            });
        }
        if self.dial_timeout_secs == 0 {
            return Err(ConfigError::Zero {
                field: "gateway.dial_timeout_secs",
            });
        }
        if self.discovery_interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "gateway.discovery_interval_secs",
            });
        }
        if let Some(host) = &self.announce_host
            && host.trim().is_empty()
        {
            return Err(ConfigError::Empty {
                field: "gateway.announce_host",
            });
        }
        Ok(())
    }
}

/// A configuration value no gateway can run with.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NodegateConfig::default();
        config.validate().unwrap();
        assert_eq!(config.gateway.dial_timeout(), Duration::from_secs(15));
        assert!(!config.gateway.no_bootstrap);
    }

    #[test]
    fn zero_dial_timeout_rejected() {
        let config = GatewayConfig {
            dial_timeout_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "gateway.dial_timeout_secs"
            })
        ));
    }

    #[test]
    fn blank_announce_host_rejected() {
        let config = GatewayConfig {
            announce_host: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Empty { .. })));
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let config: NodegateConfig =
            toml::from_str("[gateway]\nno_bootstrap = true\n").unwrap();
        assert!(config.gateway.no_bootstrap);
        assert_eq!(config.gateway.listen_address, "127.0.0.1:9981");
        assert_eq!(config.gateway.bootstrap_peers, 8);
    }

    #[test]
    fn explicit_persist_dir_wins() {
        let config = GatewayConfig {
            persist_dir: Some(PathBuf::from("/srv/node")),
            ..Default::default()
        };
        assert_eq!(config.persist_dir_or_default(), PathBuf::from("/srv/node"));
    }
}
