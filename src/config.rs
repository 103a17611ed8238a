//! Configuration file support
//!
//! Loads configuration from ~/.config/probectl/config.toml

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connector::RetryPolicy;
use crate::protocol::{
    CONTROL_CONNECT_DELAY, DEFAULT_CONTROL_PORT, DEFAULT_DAEMON_PORT, MAX_CONNECT_ATTEMPTS,
    MAX_CONTROL_PORT, MAXIMUM_SERVER_WAIT_TIME,
};
use crate::sockopt::SocketConfig;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub control: ControlDefaults,

    #[serde(default)]
    pub ssl: SslConfig,

    #[serde(default)]
    pub sockets: SocketDefaults,

    /// Log file path (e.g., "~/.config/probectl/probectl.log", null to disable)
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// Ports and timing for control connections
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ControlDefaults {
    /// Port the control daemon listens on
    pub daemon_port: Option<u16>,

    /// First port a standalone test server listens on
    pub control_port: Option<u16>,

    /// Last port a standalone test server tries
    pub control_port_max: Option<u16>,

    /// Seconds a standalone test server waits for its control connection
    pub max_wait_secs: Option<u64>,

    pub connect_attempts: Option<u32>,

    /// Seconds between connect attempts
    pub connect_delay_secs: Option<u64>,
}

impl ControlDefaults {
    pub fn daemon_port(&self) -> u16 {
        self.daemon_port.unwrap_or(DEFAULT_DAEMON_PORT)
    }

    pub fn control_ports(&self) -> (u16, u16) {
        let first = self.control_port.unwrap_or(DEFAULT_CONTROL_PORT);
        let last = self.control_port_max.unwrap_or(MAX_CONTROL_PORT).max(first);
        (first, last)
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait_secs
            .map(Duration::from_secs)
            .unwrap_or(MAXIMUM_SERVER_WAIT_TIME)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_attempts.unwrap_or(MAX_CONNECT_ATTEMPTS),
            delay: self
                .connect_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(CONTROL_CONNECT_DELAY),
        }
    }
}

/// TLS material. All three paths are needed to enable TLS.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SslConfig {
    /// CA certificate that signs both ends
    pub cacert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Local socket settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SocketDefaults {
    pub source_v4: Option<Ipv4Addr>,
    pub source_v6: Option<Ipv6Addr>,

    /// Interface to bind sockets to
    pub device: Option<String>,

    pub dscp: Option<u8>,
    pub recv_buffer: Option<u32>,
    pub send_buffer: Option<u32>,
    pub mss: Option<u32>,

    #[serde(default)]
    pub disable_nagle: bool,
}

impl SocketDefaults {
    /// Socket configuration for control connections.
    ///
    /// With no source address configured both families listen on any
    /// address; otherwise only the configured families are used.
    pub fn socket_config(&self) -> SocketConfig {
        let mut config = SocketConfig::control();
        if self.source_v4.is_some() || self.source_v6.is_some() {
            config.source_v4 = self.source_v4.map(|ip| SocketAddrV4::new(ip, 0));
            config.source_v6 = self.source_v6.map(|ip| SocketAddrV6::new(ip, 0, 0, 0));
        }
        config.device = self.device.clone();
        config.dscp = self.dscp;
        config.recv_buffer = self.recv_buffer;
        config.send_buffer = self.send_buffer;
        config.mss = self.mss;
        config.disable_nagle = self.disable_nagle;
        config
    }
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("probectl")
            .join("config.toml")
    }
}
