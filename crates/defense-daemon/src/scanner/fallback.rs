//! Best-effort evidence that the scanning engine is installed and running,
//! used when its configured socket cannot be probed.
//!
//! Heuristic and racy by nature. Nothing here returns an error; absence of
//! evidence is simply `false`.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Substring matched against `/proc/<pid>/cmdline`.
pub const ENGINE_PROCESS_NAME: &str = "clamd";

pub fn engine_present(alternate_sockets: &[PathBuf]) -> bool {
    if let Some(path) = alternate_sockets.iter().find(|p| p.exists()) {
        debug!(path = %path.display(), "found engine socket at alternate location");
        return true;
    }
    if process_running(Path::new("/proc"), ENGINE_PROCESS_NAME) {
        debug!("found engine process");
        return true;
    }
    false
}

/// Scans a procfs-style tree for a numeric entry whose cmdline contains
/// `needle`.
pub fn process_running(proc_root: &Path, needle: &str) -> bool {
    let Ok(entries) = fs::read_dir(proc_root) else {
        return false;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| fs::read(entry.path().join("cmdline")).ok())
        .any(|cmdline| String::from_utf8_lossy(&cmdline).contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_evidence_is_false() {
        let dir = tempdir().unwrap();
        assert!(!process_running(&dir.path().join("no-proc"), "clamd"));
        // Depends on the host; only has to return.
        let _ = engine_present(&[dir.path().join("missing.sock")]);
    }

    #[test]
    fn alternate_socket_counts() {
        let dir = tempdir().unwrap();
        let sock = dir.path().join("clamd.ctl");
        std::fs::write(&sock, b"").unwrap();
        assert!(engine_present(&[dir.path().join("other"), sock]));
    }

    #[test]
    fn cmdline_match_in_fake_proc() {
        let dir = tempdir().unwrap();
        let pid = dir.path().join("4242");
        std::fs::create_dir(&pid).unwrap();
        std::fs::write(pid.join("cmdline"), b"/usr/sbin/clamd\0--foreground\0").unwrap();
        let not_pid = dir.path().join("self");
        std::fs::create_dir(&not_pid).unwrap();
        std::fs::write(not_pid.join("cmdline"), b"freshclam").unwrap();

        assert!(process_running(dir.path(), "clamd"));
        assert!(!process_running(dir.path(), "freshclam"));
    }
}
