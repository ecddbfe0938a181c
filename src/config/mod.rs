//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// SSH endpoint and credentials
    pub ssh: SshConfig,
    /// Local SOCKS5 proxy
    #[serde(default)]
    pub socks5: Socks5Config,
    /// Local HTTP proxy
    #[serde(default)]
    pub http: HttpConfig,
    /// Keep-alive probing of the SSH connection
    #[serde(default)]
    pub keep_alive: KeepAliveConfig,
    /// Base interval in seconds for reconnect backoff
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("failed to write config: {}", e)))
    }

    /// Remote SSH endpoint as `host:port`
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.ssh.host, self.ssh.port)
    }
}

/// SSH endpoint and credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host
    pub host: String,
    /// Remote SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user
    #[serde(default = "default_user")]
    pub user: String,
    /// Path to the private key file
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,
    /// Path to the known_hosts file used to verify the server host key
    #[serde(default = "default_known_hosts")]
    pub known_hosts: PathBuf,
}

/// Local SOCKS5 proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5Config {
    /// Enable the SOCKS5 listener
    pub enabled: bool,
    /// Local bind address
    pub listen: String,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "0.0.0.0:1081".to_string(),
        }
    }
}

/// Local HTTP proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Enable the HTTP listener
    pub enabled: bool,
    /// Local bind address
    pub listen: String,
    /// Route HTTP destinations through the SSH connection
    pub over_tunnel: bool,
    /// Require HTTP Basic proxy authentication
    pub basic_auth: bool,
    /// Basic auth username
    #[serde(default)]
    pub basic_user: String,
    /// Basic auth password
    #[serde(default)]
    pub basic_password: String,
    /// Only tunnel destinations whose host matches the domain filter
    pub domain_filter: bool,
    /// Newline-delimited domain suffix file, watched for changes
    pub domain_file: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:1082".to_string(),
            over_tunnel: false,
            basic_auth: false,
            basic_user: String::new(),
            basic_password: String::new(),
            domain_filter: false,
            domain_file: None,
        }
    }
}

/// Keep-alive probing configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// Seconds between probes; zero disables the monitor
    pub interval_secs: u64,
    /// Consecutive missed probes tolerated before the connection is
    /// declared dead; zero disables the monitor
    pub count_max: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            count_max: 3,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

fn default_retry_interval() -> u64 {
    3
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_private_key() -> PathBuf {
    home_dir().join(".ssh/id_rsa")
}

fn default_known_hosts() -> PathBuf {
    home_dir().join(".ssh/known_hosts")
}
