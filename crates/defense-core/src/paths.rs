use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "defense";
pub const APP_NAME: &str = "defensed";

/// System-wide control socket used when the daemon runs as root.
pub const SYSTEM_SOCKET_PATH: &str = "/run/defense/defensed.sock";

/// Default clamd socket.
pub const CLAMD_SOCKET_PATH: &str = "/var/run/clamav/clamd.sock";

/// Places clamd commonly puts its socket across distributions.
pub const CLAMD_FALLBACK_SOCKETS: &[&str] = &[
    "/var/run/clamav/clamd.sock",
    "/var/run/clamav/clamd.ctl",
    "/run/clamav/clamd.sock",
    "/tmp/clamd.socket",
];

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn control_socket_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("DEFENSE_SOCKET") {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    if running_as_root() {
        return Ok(PathBuf::from(SYSTEM_SOCKET_PATH));
    }
    Ok(data_dir()?.join("defensed.sock"))
}

pub fn clamd_socket_path() -> PathBuf {
    match std::env::var("DEFENSE_CLAMD_SOCKET") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(CLAMD_SOCKET_PATH),
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}
