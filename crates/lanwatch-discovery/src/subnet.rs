//! IPv4 subnet value type used for probe ranges and router allow-lists

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid subnet '{0}' (expected a.b.c.d/prefix)")]
pub struct SubnetParseError(String);

/// An IPv4 network in CIDR notation, e.g. `192.168.1.0/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Subnet {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix_len));
        Self { network, prefix_len }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address belongs to this subnet
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = mask(self.prefix_len);
        (u32::from(ip) & mask) == (u32::from(self.network) & mask)
    }

    /// Number of usable host addresses
    pub fn host_count(&self) -> u64 {
        match self.prefix_len {
            32 | 31 => 1 << (32 - self.prefix_len as u64),
            p => (1u64 << (32 - p as u64)) - 2,
        }
    }

    /// Host addresses, skipping the network and broadcast addresses
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let network = u32::from(self.network);
        let broadcast = network | !mask(self.prefix_len);

        if self.prefix_len >= 31 {
            return (network..=broadcast).map(Ipv4Addr::from).collect();
        }

        ((network + 1)..broadcast).map(Ipv4Addr::from).collect()
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len >= 32 {
        0xFFFFFFFF
    } else if prefix_len == 0 {
        0
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    }
}

impl FromStr for Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SubnetParseError(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse::<u8>().map_err(|_| err())?),
            None => (s.trim(), 32),
        };
        if prefix > 32 {
            return Err(err());
        }
        let addr = Ipv4Addr::from_str(addr).map_err(|_| err())?;
        Ok(Self::new(addr, prefix))
    }
}

impl TryFrom<String> for Subnet {
    type Error = SubnetParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}
