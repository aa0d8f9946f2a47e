//! Router neighbor/lease table polling over the RouterOS REST API
//!
//! The router is queried over HTTPS with certificate verification always
//! enabled. A private CA certificate can be supplied for routers that use a
//! self-issued certificate.

use async_trait::async_trait;
use lanwatch_core::Detection;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{ScanBackend, ScanError};
use crate::subnet::Subnet;

/// Attempts per scan before giving up
pub const MAX_ATTEMPTS: u32 = 3;

/// Pause before reconnecting after a failed attempt
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Which router table to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NeighborTable {
    /// ARP neighbor table (`/ip/arp`)
    #[default]
    Arp,
    /// DHCP server leases (`/ip/dhcp-server/lease`)
    DhcpLeases,
}

impl NeighborTable {
    fn path(&self) -> &'static str {
        match self {
            Self::Arp => "/rest/ip/arp",
            Self::DhcpLeases => "/rest/ip/dhcp-server/lease",
        }
    }
}

/// Router API configuration
#[derive(Debug, Clone)]
pub struct RouterApiConfig {
    /// Router host, optionally with port, or a full `https://` URL
    pub address: String,
    pub username: String,
    pub password: String,
    /// Extra CA certificate (PEM) to trust
    pub ca_cert: Option<PathBuf>,
    pub table: NeighborTable,
    /// Only report addresses inside these subnets (all when empty)
    pub subnets: Vec<Subnet>,
    /// Per-request timeout
    pub timeout: Duration,
}

/// One row of the ARP table or lease list.
///
/// RouterOS reports every value as a string.
#[derive(Debug, Clone, Deserialize)]
pub struct NeighborEntry {
    #[serde(rename = "mac-address")]
    pub mac_address: Option<String>,
    pub address: Option<String>,
    #[serde(rename = "active-address")]
    pub active_address: Option<String>,
    pub status: Option<String>,
}

/// Router-API scan backend
pub struct RouterApi {
    config: RouterApiConfig,
    base_url: String,
    client: Mutex<Option<reqwest::Client>>,
}

impl RouterApi {
    pub fn new(config: RouterApiConfig) -> Result<Self, ScanError> {
        let base_url = base_url(&config.address)?;
        Ok(Self {
            config,
            base_url,
            client: Mutex::new(None),
        })
    }

    fn connect(&self) -> Result<reqwest::Client, ScanError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .connect_timeout(self.config.timeout)
            .https_only(true);

        if let Some(path) = &self.config.ca_cert {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                ScanError::Config(format!("invalid CA certificate {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        builder
            .build()
            .map_err(|e| ScanError::Config(format!("failed to create HTTP client: {}", e)))
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Vec<NeighborEntry>, ScanError> {
        let url = format!("{}{}", self.base_url, self.config.table.path());
        debug!(url = %url, "Querying router");

        let response = client
            .get(&url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| ScanError::Transient(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ScanError::Transient(format!("router returned {}", status)));
        }
        if !status.is_success() {
            return Err(ScanError::Config(format!("router rejected request: {}", status)));
        }

        response
            .json::<Vec<NeighborEntry>>()
            .await
            .map_err(|e| ScanError::Transient(format!("invalid router response: {}", e)))
    }
}

#[async_trait]
impl ScanBackend for RouterApi {
    fn name(&self) -> &str {
        "router"
    }

    async fn scan(&self) -> Result<Vec<Detection>, ScanError> {
        let mut client_slot = self.client.lock().await;
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            let client = match client_slot.as_ref() {
                Some(client) => client.clone(),
                None => {
                    let client = self.connect()?;
                    info!(router = %self.base_url, "Connected to router API");
                    *client_slot = Some(client.clone());
                    client
                }
            };

            match self.fetch(&client).await {
                Ok(entries) => {
                    return Ok(entries_to_detections(
                        &entries,
                        self.config.table,
                        &self.config.subnets,
                    ))
                }
                Err(e) if e.is_transient() => {
                    warn!(attempt = attempt, error = %e, "Router query failed, reconnecting");
                    last_error = e.to_string();
                    *client_slot = None;
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(ScanError::Fatal {
            attempts: MAX_ATTEMPTS,
            last_error,
        })
    }
}

fn base_url(address: &str) -> Result<String, ScanError> {
    let address = address.trim().trim_end_matches('/');
    if address.is_empty() {
        return Err(ScanError::Config("router address is empty".to_string()));
    }
    if address.starts_with("http://") {
        return Err(ScanError::Config(
            "router API must be reached over https".to_string(),
        ));
    }
    if address.starts_with("https://") {
        Ok(address.to_string())
    } else {
        Ok(format!("https://{}", address))
    }
}

/// Turn table rows into detections, dropping incomplete rows, inactive
/// leases and addresses outside the allow-list
pub fn entries_to_detections(
    entries: &[NeighborEntry],
    table: NeighborTable,
    subnets: &[Subnet],
) -> Vec<Detection> {
    entries
        .iter()
        .filter_map(|entry| {
            let mac = entry.mac_address.as_deref().filter(|m| !m.is_empty())?;

            let address = match table {
                NeighborTable::Arp => entry.address.as_deref(),
                NeighborTable::DhcpLeases => {
                    if entry.status.as_deref().is_some_and(|s| s != "bound") {
                        return None;
                    }
                    entry.active_address.as_deref().or(entry.address.as_deref())
                }
            }
            .filter(|a| !a.is_empty())?;

            if !subnets.is_empty() {
                let ip: Ipv4Addr = address.parse().ok()?;
                if !subnets.iter().any(|s| s.contains(ip)) {
                    return None;
                }
            }

            Some(Detection::new(mac, address))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(json: &str) -> Vec<NeighborEntry> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_arp_rows_to_detections() {
        let rows = entries(
            r#"[
                {".id": "*1", "address": "192.168.88.10", "mac-address": "AA:BB:CC:DD:EE:FF", "interface": "bridge"},
                {".id": "*2", "address": "192.168.88.11", "interface": "bridge"},
                {".id": "*3", "address": "10.5.0.2", "mac-address": "11:22:33:44:55:66", "interface": "ether1"}
            ]"#,
        );

        let all = entries_to_detections(&rows, NeighborTable::Arp, &[]);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], Detection::new("AA:BB:CC:DD:EE:FF", "192.168.88.10"));

        let lan: Subnet = "192.168.88.0/24".parse().unwrap();
        let filtered = entries_to_detections(&rows, NeighborTable::Arp, &[lan]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].network_address, "192.168.88.10");
    }

    #[test]
    fn test_lease_rows_prefer_active_address_and_skip_waiting() {
        let rows = entries(
            r#"[
                {"address": "192.168.88.50", "active-address": "192.168.88.51", "mac-address": "AA:AA:AA:AA:AA:AA", "status": "bound"},
                {"address": "192.168.88.60", "mac-address": "BB:BB:BB:BB:BB:BB", "status": "waiting"}
            ]"#,
        );

        let detections = entries_to_detections(&rows, NeighborTable::DhcpLeases, &[]);
        assert_eq!(detections, vec![Detection::new("AA:AA:AA:AA:AA:AA", "192.168.88.51")]);
    }

    #[test]
    fn test_base_url_requires_https() {
        assert_eq!(base_url("192.168.88.1").unwrap(), "https://192.168.88.1");
        assert_eq!(
            base_url("https://router.lan:8443/").unwrap(),
            "https://router.lan:8443"
        );
        assert!(matches!(base_url("http://router.lan"), Err(ScanError::Config(_))));
        assert!(matches!(base_url(""), Err(ScanError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_router_fails_after_retries() {
        let api = RouterApi::new(RouterApiConfig {
            // Nothing listens on port 1, so every attempt is refused
            address: "127.0.0.1:1".to_string(),
            username: "admin".to_string(),
            password: "secret".to_string(),
            ca_cert: None,
            table: NeighborTable::Arp,
            subnets: Vec::new(),
            timeout: Duration::from_millis(200),
        })
        .unwrap();

        match api.scan().await {
            Err(ScanError::Fatal { attempts, .. }) => assert_eq!(attempts, MAX_ATTEMPTS),
            other => panic!("expected fatal error, got {:?}", other),
        }
    }
}
