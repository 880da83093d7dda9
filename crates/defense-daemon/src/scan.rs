//! Background scan jobs.
//!
//! A job walks its roots on a blocking thread and feeds regular files to the
//! engine one at a time. Unreadable entries are skipped. Jobs carry a
//! cancellation receiver that is checked between files; the daemon does not
//! currently cancel jobs, so a started scan runs to completion even across
//! shutdown.

use chrono::{DateTime, Local, Utc};
use defense_core::state::ProtectionState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::scanner::{ScanVerdict, ScannerProbe};
use crate::service_state::DaemonStatus;
use crate::state_manager::StateManager;

const PATH_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    Quick,
    Full,
}

impl ScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanKind::Quick => "quick",
            ScanKind::Full => "full",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRoots {
    pub quick: Vec<PathBuf>,
    pub full: Vec<PathBuf>,
}

impl ScanRoots {
    pub fn for_kind(&self, kind: ScanKind) -> &[PathBuf] {
        match kind {
            ScanKind::Quick => &self.quick,
            ScanKind::Full => &self.full,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanJob {
    pub job_id: String,
    pub kind: ScanKind,
    pub started_at: DateTime<Local>,
    pub files_scanned: u64,
    pub threats_found: u64,
}

impl ScanJob {
    pub fn new(kind: ScanKind) -> Self {
        Self::started_at(kind, Local::now())
    }

    /// Job ids are `<kind>-<YYYYMMDD-HHMMSS>` in local time.
    pub fn started_at(kind: ScanKind, started_at: DateTime<Local>) -> Self {
        Self {
            job_id: format!("{}-{}", kind.as_str(), started_at.format("%Y%m%d-%H%M%S")),
            kind,
            started_at,
            files_scanned: 0,
            threats_found: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    EngineUnavailable,
    Cancelled { files_scanned: u64, threats_found: u64 },
    Completed { files_scanned: u64, threats_found: u64 },
}

/// Everything a job needs to report back.
#[derive(Clone)]
pub struct ScanContext {
    pub state: Arc<StateManager>,
    pub status: Arc<DaemonStatus>,
    pub probe: Arc<dyn ScannerProbe>,
}

impl ScanJob {
    pub async fn run(
        mut self,
        roots: Vec<PathBuf>,
        ctx: ScanContext,
        cancel: watch::Receiver<bool>,
    ) -> ScanOutcome {
        info!(job_id = %self.job_id, kind = self.kind.as_str(), "starting scan");

        if !ctx.probe.is_available().await {
            error!(job_id = %self.job_id, "scanner engine not available, scan aborted");
            ctx.state.transition(ProtectionState::Warning);
            return ScanOutcome::EngineUnavailable;
        }

        let (tx, mut rx) = mpsc::channel::<PathBuf>(PATH_QUEUE_DEPTH);
        let walker = tokio::task::spawn_blocking(move || walk_roots(&roots, tx));

        let mut cancelled = false;
        while let Some(path) = rx.recv().await {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }
            match ctx.probe.scan_file(&path).await {
                ScanVerdict::Clean => self.files_scanned += 1,
                ScanVerdict::Infected { signature } => {
                    self.files_scanned += 1;
                    self.threats_found += 1;
                    warn!(path = %path.display(), threat = %signature, "threat detected");
                }
                ScanVerdict::Error { reason } => {
                    debug!(path = %path.display(), error = %reason, "scan error");
                }
            }
        }
        drop(rx);
        if let Err(err) = walker.await {
            error!(job_id = %self.job_id, error = %err, "scan walker failed");
        }

        if cancelled {
            info!(job_id = %self.job_id, files = self.files_scanned, "scan cancelled");
            ctx.state
                .transition_if(ProtectionState::Protected, |s| s == ProtectionState::Scanning);
            return ScanOutcome::Cancelled {
                files_scanned: self.files_scanned,
                threats_found: self.threats_found,
            };
        }

        ctx.status.record_scan(Utc::now());
        let result = if self.threats_found > 0 {
            ProtectionState::Alert
        } else {
            ProtectionState::Protected
        };
        ctx.state.transition(result);

        info!(
            job_id = %self.job_id,
            kind = self.kind.as_str(),
            files = self.files_scanned,
            threats = self.threats_found,
            elapsed_secs = (Local::now() - self.started_at).num_seconds(),
            "scan completed"
        );
        ScanOutcome::Completed {
            files_scanned: self.files_scanned,
            threats_found: self.threats_found,
        }
    }
}

/// Scans currently running, keyed by an internal handle since two jobs
/// started within the same second share a job id.
#[derive(Clone, Default)]
pub struct ScanRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, RunningScan>>>,
}

struct RunningScan {
    job_id: String,
    // Held so the job's receiver stays connected; nothing sends on it yet.
    _cancel: watch::Sender<bool>,
}

impl ScanRegistry {
    pub fn register(&self, job_id: &str) -> (Uuid, watch::Receiver<bool>) {
        let (cancel, rx) = watch::channel(false);
        let key = Uuid::new_v4();
        self.jobs.lock().insert(
            key,
            RunningScan {
                job_id: job_id.to_string(),
                _cancel: cancel,
            },
        );
        (key, rx)
    }

    pub fn finish(&self, key: Uuid) {
        self.jobs.lock().remove(&key);
    }

    /// Job ids still running, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .lock()
            .values()
            .map(|job| job.job_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Feeds every regular file under `roots` into `tx`. Stops early once the
/// receiver is gone.
fn walk_roots(roots: &[PathBuf], tx: mpsc::Sender<PathBuf>) {
    for root in roots {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(root = %root.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if tx.blocking_send(entry.into_path()).is_err() {
                return;
            }
        }
    }
}
