//! Scan backend abstraction

use async_trait::async_trait;
use lanwatch_core::Detection;
use thiserror::Error;

/// Errors a scan backend can report for one scan
#[derive(Error, Debug)]
pub enum ScanError {
    /// Connection drop, timeout, or other condition worth retrying
    #[error("transient backend error: {0}")]
    Transient(String),
    /// Retries exhausted; the current cycle is abandoned
    #[error("scan failed after {attempts} attempts: {last_error}")]
    Fatal { attempts: u32, last_error: String },
    /// Backend is misconfigured (unknown interface, bad address, ...)
    #[error("backend configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Produces a snapshot of `(hardware id, network address)` pairs for the
/// monitored network.
///
/// Implementations must return (or fail) within a bounded time and handle
/// their own internal retries.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn scan(&self) -> Result<Vec<Detection>, ScanError>;
}
