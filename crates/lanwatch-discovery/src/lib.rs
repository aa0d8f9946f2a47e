//! LAN Watch Discovery - Presence scanning for the local network
//!
//! This crate provides:
//! - A scan backend abstraction with two implementations: direct ARP
//!   probing of a subnet and polling a router's neighbor/lease table
//! - A fixed-interval scheduler that never overlaps scans
//! - The presence correlator that records results and raises first-seen alerts

pub mod arp;
pub mod backend;
pub mod correlator;
pub mod router;
pub mod scheduler;
pub mod subnet;

pub use arp::{ArpProbe, ArpProbeConfig};
pub use backend::{ScanBackend, ScanError};
pub use correlator::{
    Correlator, CycleSummary, NewDeviceCallback, NewDeviceEvent, PresenceEntry, PresenceReport,
    PresenceView, Registration,
};
pub use router::{NeighborTable, RouterApi, RouterApiConfig};
pub use scheduler::{CycleOutcome, ScanEvent, Scheduler, SchedulerConfig, SchedulerHandle};
pub use subnet::{Subnet, SubnetParseError};
