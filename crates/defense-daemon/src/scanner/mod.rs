//! Narrow interface to the external malware-scanning engine.

use async_trait::async_trait;
use std::path::Path;

mod clamd;
pub mod fallback;

pub use clamd::ClamdProbe;

/// Outcome of scanning one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Infected { signature: String },
    /// The engine could not scan the file (permissions, vanished, ...).
    Error { reason: String },
}

#[async_trait]
pub trait ScannerProbe: Send + Sync {
    /// Liveness check. Never fails; anything other than a clean
    /// round trip counts as unavailable.
    async fn is_available(&self) -> bool;

    async fn scan_file(&self, path: &Path) -> ScanVerdict;

    /// Whether the primary liveness probe can be attempted at all. When it
    /// cannot, callers may look for other evidence that the engine exists.
    fn can_probe(&self) -> bool {
        true
    }
}
