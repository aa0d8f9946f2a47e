//! Configuration loading and validation

use anyhow::{bail, Context, Result};
use lanwatch_discovery::{
    ArpProbe, ArpProbeConfig, NeighborTable, RouterApi, RouterApiConfig, ScanBackend,
    SchedulerConfig, Subnet,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Chat front end; required unless running a single scan
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Time between scan starts in seconds
    #[serde(default = "default_interval")]
    pub scan_interval_secs: u64,
    /// Hard limit on one scan in seconds
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
    /// Directory holding the registry and scan history
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_interval(),
            scan_timeout_secs: default_scan_timeout(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_interval() -> u64 {
    60
}

fn default_scan_timeout() -> u64 {
    30
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Scan backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum ScannerConfig {
    Arp(ArpConfig),
    Router(RouterConfig),
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self::Arp(ArpConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArpConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_subnet")]
    pub subnet: Subnet,
    /// Reply wait per round in milliseconds
    #[serde(default = "default_arp_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            subnet: default_subnet(),
            timeout_ms: default_arp_timeout(),
            retries: default_retries(),
        }
    }
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_subnet() -> Subnet {
    Subnet::new(std::net::Ipv4Addr::new(192, 168, 1, 0), 24)
}

fn default_arp_timeout() -> u64 {
    2000
}

fn default_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Router host (optionally host:port) or https:// URL
    pub address: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Extra CA certificate (PEM) for self-issued router certificates
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub table: NeighborTable,
    /// Only report addresses inside these subnets
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_router_timeout")]
    pub timeout_ms: u64,
}

fn default_router_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot API token
    pub token: String,
    /// Chat that receives new-device alerts; always allowed
    pub admin_chat: i64,
    /// Additional chats allowed to talk to the bot
    #[serde(default)]
    pub allowed_chats: Vec<i64>,
    /// Long-polling timeout in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_poll_timeout() -> u64 {
    30
}

impl TelegramConfig {
    /// Admin chat followed by the other allowed chats, without duplicates
    pub fn chats(&self) -> Vec<i64> {
        let mut chats = vec![self.admin_chat];
        for chat in &self.allowed_chats {
            if !chats.contains(chat) {
                chats.push(*chat);
            }
        }
        chats
    }
}

impl Config {
    /// Convert to SchedulerConfig
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.daemon.scan_interval_secs),
            scan_timeout: Duration::from_secs(self.daemon.scan_timeout_secs),
        }
    }

    /// Reject values the scheduler or backends cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.daemon.scan_interval_secs == 0 {
            bail!("daemon.scan_interval_secs must be greater than zero");
        }
        if self.daemon.scan_timeout_secs == 0 {
            bail!("daemon.scan_timeout_secs must be greater than zero");
        }
        if self.daemon.scan_timeout_secs > self.daemon.scan_interval_secs {
            warn!(
                timeout = self.daemon.scan_timeout_secs,
                interval = self.daemon.scan_interval_secs,
                "Scan timeout exceeds the scan interval; slow scans will delay the schedule"
            );
        }
        if let Some(telegram) = &self.telegram {
            if telegram.token.trim().is_empty() {
                bail!("telegram.token is empty");
            }
        }
        Ok(())
    }

    /// Construct the configured scan backend
    pub fn build_backend(&self) -> Result<Arc<dyn ScanBackend>> {
        match &self.scanner {
            ScannerConfig::Arp(arp) => {
                let probe = ArpProbe::new(ArpProbeConfig {
                    interface: arp.interface.clone(),
                    subnet: arp.subnet,
                    timeout: Duration::from_millis(arp.timeout_ms),
                    retries: arp.retries,
                })?;
                if probe.max_duration() > Duration::from_secs(self.daemon.scan_timeout_secs) {
                    warn!(
                        max_probe_ms = probe.max_duration().as_millis() as u64,
                        "ARP probe can outlast the scan timeout; late replies will be lost"
                    );
                }
                Ok(Arc::new(probe))
            }
            ScannerConfig::Router(router) => {
                let api = RouterApi::new(RouterApiConfig {
                    address: router.address.clone(),
                    username: router.username.clone(),
                    password: router.password.clone(),
                    ca_cert: router.ca_cert.clone(),
                    table: router.table,
                    subnets: router.subnets.clone(),
                    timeout: Duration::from_millis(router.timeout_ms),
                })?;
                Ok(Arc::new(api))
            }
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };

    config.validate()?;
    Ok(config)
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        daemon: DaemonConfig::default(),
        scanner: ScannerConfig::default(),
        telegram: Some(TelegramConfig {
            token: "123456:replace-me".to_string(),
            admin_chat: 0,
            allowed_chats: Vec::new(),
            poll_timeout_secs: default_poll_timeout(),
        }),
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.daemon.scan_interval_secs, 60);
        assert!(config.telegram.is_none());
        match config.scanner {
            ScannerConfig::Arp(arp) => assert_eq!(arp.subnet.to_string(), "192.168.1.0/24"),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_router_backend_section() {
        let config: Config = toml::from_str(
            r#"
            [daemon]
            scan_interval_secs = 120

            [scanner]
            backend = "router"
            address = "192.168.88.1"
            username = "watch"
            password = "secret"
            table = "dhcp-leases"
            subnets = ["192.168.88.0/24", "10.10.0.0/16"]

            [telegram]
            token = "42:abc"
            admin_chat = 1001
            allowed_chats = [1001, 2002]
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.scan_timeout_secs, 30);
        match &config.scanner {
            ScannerConfig::Router(router) => {
                assert_eq!(router.table, NeighborTable::DhcpLeases);
                assert_eq!(router.subnets.len(), 2);
                assert_eq!(router.timeout_ms, 5000);
            }
            other => panic!("unexpected backend {:?}", other),
        }
        assert_eq!(config.telegram.unwrap().chats(), vec![1001, 2002]);
    }

    #[test]
    fn test_invalid_subnet_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [scanner]
            backend = "arp"
            subnet = "192.168.1.0/40"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let mut config = Config::default();
        config.daemon.scan_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lanwatch.toml");

        save_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();

        assert!(config.telegram.is_some());
        assert!(matches!(config.scanner, ScannerConfig::Arp(_)));
    }
}
