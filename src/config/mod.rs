//! Configuration module

mod settings;

pub use settings::{FileSettings, MemorySettings, SettingsStore};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Default per-port reachability timeout
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Relay endpoint and client behaviour
    pub client: Option<ClientConfig>,

    /// Reachability probe settings
    pub probe: ProbeConfig,

    /// Tunneling capability grant settings
    pub grant: GrantConfig,

    /// Native anonymity core process
    pub core: ProcessConfig,

    /// Packet-interception service process
    pub tunnel: ProcessConfig,

    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// A missing `client` section is allowed: the orchestrator simply
    /// refuses to start until one is present.
    pub fn validate(&self) -> Result<()> {
        if let Some(client) = &self.client {
            client.validate()?;
        }

        if self.probe.timeout_ms == 0 {
            return Err(Error::config("probe timeout-ms must be greater than zero"));
        }

        self.core.validate("core")?;
        self.tunnel.validate("tunnel")?;
        Ok(())
    }
}

/// Relay endpoint snapshot used for one start attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay host name or address
    #[serde(rename = "relay-host")]
    pub relay_host: String,

    /// Relay control port
    #[serde(rename = "relay-port")]
    pub relay_port: u16,

    /// Relay SOCKS port
    #[serde(rename = "socks-port")]
    pub socks_port: u16,

    /// Tear the session down when the relay connection errors
    #[serde(rename = "disconnect-on-error", default = "default_true")]
    pub disconnect_on_error: bool,
}

impl ClientConfig {
    pub fn new(relay_host: impl Into<String>, relay_port: u16, socks_port: u16) -> Self {
        ClientConfig {
            relay_host: relay_host.into(),
            relay_port,
            socks_port,
            disconnect_on_error: true,
        }
    }

    pub fn with_disconnect_on_error(mut self, enabled: bool) -> Self {
        self.disconnect_on_error = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_host.trim().is_empty() {
            return Err(Error::config("relay-host is empty"));
        }
        if self.relay_port == 0 {
            return Err(Error::config("relay-port must be non-zero"));
        }
        if self.socks_port == 0 {
            return Err(Error::config("socks-port must be non-zero"));
        }
        if self.relay_port == self.socks_port {
            return Err(Error::config(format!(
                "relay-port and socks-port are both {}",
                self.relay_port
            )));
        }
        Ok(())
    }

    /// Control endpoint as `host:port`
    pub fn control_address(&self) -> String {
        format!("{}:{}", self.relay_host, self.relay_port)
    }

    /// SOCKS endpoint as `host:port`
    pub fn socks_address(&self) -> String {
        format!("{}:{}", self.relay_host, self.socks_port)
    }
}

/// Reachability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Per-port connect timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

/// How the tunneling capability is granted on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GrantPolicy {
    /// The capability is already held
    #[default]
    Auto,
    /// Every request is declined
    Deny,
    /// Ask on the controlling terminal
    Prompt,
}

/// Grant configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GrantConfig {
    pub policy: GrantPolicy,
}

/// Child process configuration shared by the core and tunnel services
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Path to the executable
    pub executable: PathBuf,

    /// Extra arguments placed before the generated ones
    pub args: Vec<String>,

    /// Working directory
    #[serde(rename = "work-dir")]
    pub work_dir: Option<PathBuf>,

    /// How long the process must stay alive to count as started
    #[serde(rename = "startup-grace-ms")]
    pub startup_grace_ms: u64,

    /// How long to wait after SIGTERM before killing
    #[serde(rename = "stop-timeout-ms")]
    pub stop_timeout_ms: u64,
}

impl ProcessConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        ProcessConfig {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(Error::config(format!("{}.executable is empty", section)));
        }
        Ok(())
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        ProcessConfig {
            executable: PathBuf::new(),
            args: Vec::new(),
            work_dir: None,
            startup_grace_ms: 500,
            stop_timeout_ms: 5000,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
client:
  relay-host: 10.0.0.1
  relay-port: 9000
  socks-port: 9001
probe:
  timeout-ms: 1500
grant:
  policy: prompt
core:
  executable: /usr/local/bin/prifi-core
  args: ["--verbose"]
tunnel:
  executable: /usr/local/bin/prifi-tunnel
  stop-timeout-ms: 2000
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_str(SAMPLE).unwrap();
        let client = config.client.unwrap();
        assert_eq!(client.relay_host, "10.0.0.1");
        assert_eq!(client.relay_port, 9000);
        assert_eq!(client.socks_port, 9001);
        assert!(client.disconnect_on_error);
        assert_eq!(config.probe.timeout(), Duration::from_millis(1500));
        assert_eq!(config.grant.policy, GrantPolicy::Prompt);
        assert_eq!(config.core.args, vec!["--verbose".to_string()]);
        assert_eq!(config.core.stop_timeout_ms, 5000);
        assert_eq!(config.tunnel.stop_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.client.is_none());
        assert_eq!(config.probe.timeout_ms, DEFAULT_PROBE_TIMEOUT_MS);
        assert_eq!(config.grant.policy, GrantPolicy::Auto);
    }

    #[test]
    fn test_missing_executable_rejected() {
        let yaml = "client:\n  relay-host: relay\n  relay-port: 1\n  socks-port: 2\n";
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_client_validation() {
        assert!(ClientConfig::new("10.0.0.1", 9000, 9001).validate().is_ok());
        assert!(ClientConfig::new("  ", 9000, 9001).validate().is_err());
        assert!(ClientConfig::new("relay", 0, 9001).validate().is_err());
        assert!(ClientConfig::new("relay", 9000, 0).validate().is_err());
        assert!(ClientConfig::new("relay", 9000, 9000).validate().is_err());
    }

    #[test]
    fn test_addresses() {
        let client = ClientConfig::new("relay.example", 9000, 9001);
        assert_eq!(client.control_address(), "relay.example:9000");
        assert_eq!(client.socks_address(), "relay.example:9001");
    }
}
