// Relay configuration.
//
// `RelayConfig` has a default for every field, so a JSON config file only
// needs the fields it changes. The binary layers command-line flags and
// environment variables on top (see `main.rs`). Validation happens once, at
// startup; a `ConfigError` there is fatal.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_STREAM_PORT: u16 = 40305;
pub const DEFAULT_DATAGRAM_PORT: u16 = 40306;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),

    #[error("{name} must be a positive number of seconds, got {value}")]
    InvalidDuration { name: &'static str, value: f64 },

    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Address both transports bind to.
    pub bind_address: String,
    pub stream_port: u16,
    pub datagram_port: u16,
    /// Datagram peers silent for longer than this are dropped.
    pub datagram_timeout_secs: f64,
    /// Keep the latest sync state for joining clients.
    pub keep_state: bool,
    /// How often the liveness sweep runs.
    pub sweep_interval_secs: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            stream_port: DEFAULT_STREAM_PORT,
            datagram_port: DEFAULT_DATAGRAM_PORT,
            datagram_timeout_secs: 10.0,
            keep_state: true,
            sweep_interval_secs: 1.0,
        }
    }
}

impl RelayConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;
        positive_secs("datagram_timeout_secs", self.datagram_timeout_secs)?;
        positive_secs("sweep_interval_secs", self.sweep_interval_secs)?;
        Ok(())
    }

    pub fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))
    }

    pub fn stream_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.stream_port))
    }

    pub fn datagram_addr(&self) -> Result<SocketAddr, ConfigError> {
        Ok(SocketAddr::new(self.bind_ip()?, self.datagram_port))
    }

    pub fn datagram_timeout(&self) -> Result<Duration, ConfigError> {
        positive_secs("datagram_timeout_secs", self.datagram_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        positive_secs("sweep_interval_secs", self.sweep_interval_secs)
    }
}

fn positive_secs(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { name, value })
    } else {
        Err(ConfigError::InvalidDuration { name, value })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let config = RelayConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.stream_addr().unwrap(),
            "0.0.0.0:40305".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            config.datagram_addr().unwrap(),
            "0.0.0.0:40306".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.datagram_timeout().unwrap(), Duration::from_secs(10));
        assert_eq!(config.sweep_interval().unwrap(), Duration::from_secs(1));
        assert!(config.keep_state);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"stream_port": 5000, "keep_state": false}}"#).unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.stream_port, 5000);
        assert!(!config.keep_state);
        assert_eq!(config.datagram_port, DEFAULT_DATAGRAM_PORT);
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[test]
    fn unknown_field_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tcp_prot": 1}}"#).unwrap();
        assert!(matches!(
            RelayConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RelayConfig::load(&dir.path().join("nope.json")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn rejects_bad_bind_address() {
        let config = RelayConfig {
            bind_address: "not-an-ip".into(),
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress(addr)) if addr == "not-an-ip"
        ));
    }

    #[test]
    fn rejects_non_positive_durations() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let config = RelayConfig {
                datagram_timeout_secs: bad,
                ..RelayConfig::default()
            };
            assert!(config.validate().is_err(), "accepted timeout {bad}");
        }
        let config = RelayConfig {
            sweep_interval_secs: 0.0,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDuration {
                name: "sweep_interval_secs",
                ..
            })
        ));
    }

    #[test]
    fn accepts_ipv6_and_fractional_seconds() {
        let config = RelayConfig {
            bind_address: "::1".into(),
            datagram_timeout_secs: 0.25,
            ..RelayConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(
            config.datagram_timeout().unwrap(),
            Duration::from_millis(250)
        );
    }
}
