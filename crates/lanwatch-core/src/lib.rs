//! LAN Watch Core - Core types and persistence for presence tracking
//!
//! This crate provides the foundational types for the LAN Watch system:
//! - Hardware id normalization and validation
//! - Person, Device and ScanResult records
//! - Store traits for the device registry and scan history
//! - A JSON-file backed store implementation

pub mod device;
pub mod store;

pub use device::{Detection, Device, HardwareId, HardwareIdError, NewDevice, Person, ScanResult};
pub use store::{DeviceRegistry, JsonStore, ScanHistory, Store, StoreError};
