//! LAN Watch Daemon - scheduled presence scanning with a Telegram front end
//!
//! The binary wires the JSON store, the configured scan backend, the scan
//! scheduler and the operator conversation together.

pub mod config;
pub mod conversation;
pub mod state;
