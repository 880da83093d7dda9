use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::{clamd_socket_path, CLAMD_FALLBACK_SOCKETS};

/// Runtime settings for the daemon. Built from defaults plus command-line
/// and environment overrides; there is no settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub socket_path: PathBuf,
    pub clamd_socket: PathBuf,
    #[serde(default)]
    pub clamd_fallback_sockets: Vec<PathBuf>,
    pub probe_timeout_secs: u64,
    pub health_interval_secs: u64,
    /// Desired firewall state at startup.
    pub firewall_enabled: bool,
    pub quick_scan_paths: Vec<PathBuf>,
    pub full_scan_paths: Vec<PathBuf>,
    /// Look for other engine evidence when the configured socket is missing.
    pub fallback_probing: bool,
}

impl DaemonSettings {
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            clamd_socket: clamd_socket_path(),
            clamd_fallback_sockets: CLAMD_FALLBACK_SOCKETS.iter().map(PathBuf::from).collect(),
            probe_timeout_secs: 5,
            health_interval_secs: 60,
            firewall_enabled: true,
            quick_scan_paths: vec![PathBuf::from("/tmp"), PathBuf::from("/var/tmp")],
            full_scan_paths: vec![
                PathBuf::from("/home"),
                PathBuf::from("/tmp"),
                PathBuf::from("/var/tmp"),
            ],
            fallback_probing: true,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.socket_path.as_os_str().is_empty() {
            anyhow::bail!("control socket path must not be empty");
        }
        if self.quick_scan_paths.is_empty() {
            anyhow::bail!("at least one quick scan path is required");
        }
        if self.full_scan_paths.is_empty() {
            anyhow::bail!("at least one full scan path is required");
        }
        Ok(())
    }
}
