//! Active ARP probing over a raw datalink channel
//!
//! Broadcasts an ARP who-has for every host address of the configured subnet
//! and collects the replies. Hosts that stay silent are asked again for a
//! bounded number of extra rounds. Requires CAP_NET_RAW (or root).

use async_trait::async_trait;
use lanwatch_core::Detection;
use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::backend::{ScanBackend, ScanError};
use crate::subnet::Subnet;

/// Ethernet header (14) + ARP payload for IPv4 over Ethernet (28)
pub const ARP_FRAME_LEN: usize = 42;

const ARP_PAYLOAD_LEN: usize = 28;

/// Largest subnet we are willing to sweep (/16)
const MAX_PROBE_HOSTS: u64 = 65_534;

/// How long a single blocking read waits before the deadline is re-checked
const READ_POLL: Duration = Duration::from_millis(50);

/// ARP probe configuration
#[derive(Debug, Clone)]
pub struct ArpProbeConfig {
    /// Interface to send on (e.g. "eth0")
    pub interface: String,
    /// Address range to probe
    pub subnet: Subnet,
    /// How long to wait for replies after each round of requests
    pub timeout: Duration,
    /// Extra rounds for hosts that did not answer
    pub retries: u32,
}

/// Active-probe scan backend
pub struct ArpProbe {
    config: ArpProbeConfig,
}

impl ArpProbe {
    pub fn new(config: ArpProbeConfig) -> Result<Self, ScanError> {
        if config.subnet.host_count() > MAX_PROBE_HOSTS {
            return Err(ScanError::Config(format!(
                "subnet {} is too large to probe (at most a /16)",
                config.subnet
            )));
        }
        if config.interface.is_empty() {
            return Err(ScanError::Config("no network interface configured".to_string()));
        }
        Ok(Self { config })
    }

    /// Upper bound on how long one scan can take
    pub fn max_duration(&self) -> Duration {
        self.config.timeout * (self.config.retries + 1)
    }
}

#[async_trait]
impl ScanBackend for ArpProbe {
    fn name(&self) -> &str {
        "arp"
    }

    async fn scan(&self) -> Result<Vec<Detection>, ScanError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || probe_blocking(&config))
            .await
            .map_err(|e| ScanError::Transient(format!("probe task failed: {}", e)))?
    }
}

/// Build an ARP who-has request broadcast frame
pub fn build_arp_request(
    source_mac: MacAddr,
    source_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> Option<[u8; ARP_FRAME_LEN]> {
    let mut frame = [0u8; ARP_FRAME_LEN];
    let mut arp_buf = [0u8; ARP_PAYLOAD_LEN];

    {
        let mut arp = MutableArpPacket::new(&mut arp_buf)?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(source_mac);
        arp.set_sender_proto_addr(source_ip);
        arp.set_target_hw_addr(MacAddr::zero());
        arp.set_target_proto_addr(target_ip);
    }

    {
        let mut ethernet = MutableEthernetPacket::new(&mut frame)?;
        ethernet.set_destination(MacAddr::broadcast());
        ethernet.set_source(source_mac);
        ethernet.set_ethertype(EtherTypes::Arp);
        ethernet.set_payload(&arp_buf);
    }

    Some(frame)
}

/// Extract `(sender mac, sender ip)` from an ARP reply frame
pub fn parse_arp_reply(frame: &[u8]) -> Option<(MacAddr, Ipv4Addr)> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }

    let arp = ArpPacket::new(ethernet.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }

    Some((arp.get_sender_hw_addr(), arp.get_sender_proto_addr()))
}

fn find_interface(name: &str) -> Result<NetworkInterface, ScanError> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| ScanError::Config(format!("network interface '{}' not found", name)))
}

fn interface_ipv4(iface: &NetworkInterface) -> Option<Ipv4Addr> {
    iface.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

fn probe_blocking(config: &ArpProbeConfig) -> Result<Vec<Detection>, ScanError> {
    let iface = find_interface(&config.interface)?;
    let source_mac = iface.mac.ok_or_else(|| {
        ScanError::Config(format!("interface '{}' has no hardware address", iface.name))
    })?;
    let source_ip = interface_ipv4(&iface).ok_or_else(|| {
        ScanError::Config(format!("interface '{}' has no IPv4 address", iface.name))
    })?;

    let channel_config = datalink::Config {
        read_timeout: Some(READ_POLL),
        ..Default::default()
    };
    let (mut tx, mut rx) = match datalink::channel(&iface, channel_config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => {
            return Err(ScanError::Config(format!(
                "interface '{}' does not provide an ethernet channel",
                iface.name
            )))
        }
        Err(e) => return Err(ScanError::Io(e)),
    };

    let targets: Vec<Ipv4Addr> = config
        .subnet
        .hosts()
        .into_iter()
        .filter(|ip| *ip != source_ip)
        .collect();
    let target_set: HashSet<Ipv4Addr> = targets.iter().copied().collect();

    debug!(
        interface = %iface.name,
        subnet = %config.subnet,
        hosts = targets.len(),
        "Starting ARP probe"
    );

    let mut answered: HashSet<Ipv4Addr> = HashSet::new();
    let mut seen_macs: HashSet<String> = HashSet::new();
    let mut detections = Vec::new();

    for round in 0..=config.retries {
        let pending: Vec<Ipv4Addr> = targets
            .iter()
            .copied()
            .filter(|ip| !answered.contains(ip))
            .collect();
        if pending.is_empty() {
            break;
        }

        trace!(round = round, pending = pending.len(), "Sending ARP requests");
        for target in pending {
            let Some(frame) = build_arp_request(source_mac, source_ip, target) else {
                continue;
            };
            if let Some(Err(e)) = tx.send_to(&frame, None) {
                warn!(ip = %target, error = %e, "Failed to send ARP request");
            }
        }

        let deadline = Instant::now() + config.timeout;
        while Instant::now() < deadline {
            match rx.next() {
                Ok(frame) => {
                    let Some((mac, ip)) = parse_arp_reply(frame) else {
                        continue;
                    };
                    if !target_set.contains(&ip) {
                        continue;
                    }
                    answered.insert(ip);
                    let mac = mac.to_string();
                    if seen_macs.insert(mac.clone()) {
                        trace!(mac = %mac, ip = %ip, "ARP reply");
                        detections.push(Detection::new(mac, ip.to_string()));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) => return Err(ScanError::Transient(format!("ARP receive failed: {}", e))),
            }
        }
    }

    debug!(found = detections.len(), "ARP probe complete");
    Ok(detections)
}
