//! Configuration for the AMQP transport
//!
//! A config file names the candidate brokers and, optionally, the reconnect
//! cadence:
//!
//! ```toml
//! [transport]
//! connect_timeout_secs = 20
//! reconnect_initial_delay_secs = 2
//! reconnect_step_secs = 2
//! reconnect_max_delay_secs = 20
//! password_env = "RABBITMQ_PASSWORD"
//!
//! [[rabbitmq]]
//! host = "rabbit-a.internal"
//! user = "sensu"
//! vhost = "/sensu"
//! prefetch = 10
//!
//! [[rabbitmq]]
//! host = "rabbit-b.internal"
//! ```
//!
//! `rabbitmq` may also be a single table.

use crate::transport::amqp::{ConnectionOptions, ReconnectPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main transport configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub rabbitmq: BrokerList,
}

/// Reconnect cadence and credential lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_initial_delay")]
    pub reconnect_initial_delay_secs: u64,
    #[serde(default = "default_step")]
    pub reconnect_step_secs: u64,
    #[serde(default = "default_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Environment variable holding the broker password for every entry
    pub password_env: Option<String>,
}

fn default_connect_timeout() -> u64 {
    20
}

fn default_initial_delay() -> u64 {
    2
}

fn default_step() -> u64 {
    2
}

fn default_max_delay() -> u64 {
    20
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            reconnect_initial_delay_secs: default_initial_delay(),
            reconnect_step_secs: default_step(),
            reconnect_max_delay_secs: default_max_delay(),
            password_env: None,
        }
    }
}

/// One broker table or an array of them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BrokerList {
    Many(Vec<ConnectionOptions>),
    One(ConnectionOptions),
}

impl Default for BrokerList {
    fn default() -> Self {
        BrokerList::Many(Vec::new())
    }
}

impl BrokerList {
    pub fn as_slice(&self) -> &[ConnectionOptions] {
        match self {
            BrokerList::Many(brokers) => brokers,
            BrokerList::One(broker) => std::slice::from_ref(broker),
        }
    }

    fn iter_mut(&mut self) -> std::slice::IterMut<'_, ConnectionOptions> {
        match self {
            BrokerList::Many(brokers) => brokers.iter_mut(),
            BrokerList::One(broker) => std::slice::from_mut(broker).iter_mut(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TransportConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse, validate and resolve environment-provided credentials
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: TransportConfig = toml::from_str(content)?;
        config.validate()?;
        config.resolve_env_vars()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, broker) in self.rabbitmq.as_slice().iter().enumerate() {
            if broker.host.as_deref().is_some_and(|host| host.trim().is_empty()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "rabbitmq entry {index}: host must not be empty"
                )));
            }
            if broker.port == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "rabbitmq entry {index}: port must be between 1 and 65535"
                )));
            }
        }

        self.reconnect_policy()
            .validate()
            .map_err(ConfigError::InvalidConfig)
    }

    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        let Some(password_env) = self.transport.password_env.clone() else {
            return Ok(());
        };

        let password = std::env::var(&password_env)
            .map_err(|_| ConfigError::EnvVarNotFound(password_env.clone()))?;
        for broker in self.rabbitmq.iter_mut() {
            if broker.password.is_none() {
                broker.password = Some(password.clone());
            }
        }
        Ok(())
    }

    /// Candidate pool handed to `AmqpTransport::connect`
    pub fn brokers(&self) -> Vec<ConnectionOptions> {
        self.rabbitmq.as_slice().to_vec()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(self.transport.reconnect_initial_delay_secs),
            step: Duration::from_secs(self.transport.reconnect_step_secs),
            max_delay: Duration::from_secs(self.transport.reconnect_max_delay_secs),
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = TransportConfig::from_toml("").unwrap();

        assert!(config.brokers().is_empty());
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::default());
    }

    #[test]
    fn test_single_broker_table() {
        let config = TransportConfig::from_toml(
            r#"
[rabbitmq]
host = "10.0.0.5"
port = 5671
prefetch = 10
"#,
        )
        .unwrap();

        let brokers = config.brokers();
        assert_eq!(brokers.len(), 1);
        assert_eq!(brokers[0].host(), "10.0.0.5");
        assert_eq!(brokers[0].port(), 5671);
        assert_eq!(brokers[0].prefetch, Some(10));
        assert_eq!(brokers[0].user(), "guest");
    }

    #[test]
    fn test_broker_array() {
        let config = TransportConfig::from_toml(
            r#"
[[rabbitmq]]
host = "rabbit-a.internal"

[[rabbitmq]]
host = "rabbit-b.internal"
vhost = "/sensu"
"#,
        )
        .unwrap();

        let hosts: Vec<&str> = config.rabbitmq.as_slice().iter().map(|b| b.host()).collect();
        assert_eq!(hosts, vec!["rabbit-a.internal", "rabbit-b.internal"]);
        assert_eq!(config.rabbitmq.as_slice()[1].vhost(), "/sensu");
    }

    #[test]
    fn test_transport_section() {
        let config = TransportConfig::from_toml(
            r#"
[transport]
connect_timeout_secs = 5
reconnect_initial_delay_secs = 1
reconnect_step_secs = 3
reconnect_max_delay_secs = 30
"#,
        )
        .unwrap();

        let policy = config.reconnect_policy();
        assert_eq!(policy.connect_timeout, Duration::from_secs(5));
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.step, Duration::from_secs(3));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_zero_port() {
        let result = TransportConfig::from_toml("[rabbitmq]\nport = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_empty_host() {
        let result = TransportConfig::from_toml("[[rabbitmq]]\nhost = \"  \"\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_inverted_delays() {
        let result = TransportConfig::from_toml(
            "[transport]\nreconnect_initial_delay_secs = 30\nreconnect_max_delay_secs = 10\n",
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_password_env_var() {
        let result = TransportConfig::from_toml(
            "[transport]\npassword_env = \"AMQP_TRANSPORT_TEST_UNSET_PASSWORD\"\n",
        );
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(_))));
    }
}
