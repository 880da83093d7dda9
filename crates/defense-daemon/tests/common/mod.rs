#![allow(dead_code)]

use async_trait::async_trait;
use defense_daemon::firewall::AppliedFirewall;
use defense_daemon::scan::{ScanRegistry, ScanRoots};
use defense_daemon::scanner::{ScanVerdict, ScannerProbe};
use defense_daemon::server::{ControlServer, ServerContext};
use defense_daemon::service_state::DaemonStatus;
use defense_daemon::state_manager::StateManager;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process engine. Files named `eicar*` are infected. A gated probe
/// holds every file scan until `release` hands out permits.
pub struct MockProbe {
    pub available: AtomicBool,
    gate: Option<Semaphore>,
}

impl MockProbe {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            gate: None,
        })
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            gate: Some(Semaphore::new(0)),
        })
    }

    pub fn release(&self, files: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(files);
        }
    }
}

#[async_trait]
impl ScannerProbe for MockProbe {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn scan_file(&self, path: &Path) -> ScanVerdict {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let name = path.file_name().unwrap().to_string_lossy();
        if name.starts_with("eicar") {
            ScanVerdict::Infected {
                signature: "Eicar-Test-Signature".into(),
            }
        } else {
            ScanVerdict::Clean
        }
    }
}

pub struct TestServer {
    pub dir: TempDir,
    pub socket: PathBuf,
    pub scan_root: PathBuf,
    pub ctx: ServerContext,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    /// Binds a control server in a fresh temp dir. The scan root holds a
    /// single clean file.
    pub async fn start(probe: Arc<dyn ScannerProbe>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("defensed.sock");
        let scan_root = dir.path().join("scan");
        std::fs::create_dir(&scan_root).unwrap();
        std::fs::write(scan_root.join("sample.txt"), b"hello").unwrap();

        let ctx = ServerContext {
            state: Arc::new(StateManager::new()),
            probe,
            firewall: Arc::new(AppliedFirewall::new(true)),
            status: Arc::new(DaemonStatus::new(true)),
            roots: ScanRoots {
                quick: vec![scan_root.clone()],
                full: vec![scan_root.clone()],
            },
            scans: ScanRegistry::default(),
            health_wake: Arc::new(Notify::new()),
        };

        let server = ControlServer::bind(&socket).unwrap();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(server.serve(ctx.clone(), rx));

        Self {
            dir,
            socket,
            scan_root,
            ctx,
            shutdown,
            task,
        }
    }

    pub fn state(&self) -> Arc<StateManager> {
        self.ctx.state.clone()
    }

    pub async fn stop(self) -> TempDir {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(IO_TIMEOUT, self.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.dir
    }
}

/// Speaks raw NDJSON lines to the server.
pub struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    pub async fn connect(socket: &Path) -> Self {
        let stream = UnixStream::connect(socket).await.unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next raw line without its newline.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = tokio::time::timeout(IO_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "server closed the connection");
        line.trim_end().to_string()
    }

    pub async fn read_json(&mut self) -> Value {
        serde_json::from_str(&self.read_line().await).unwrap()
    }

    pub async fn request(&mut self, line: &str) -> Value {
        self.send_line(line).await;
        self.read_json().await
    }

    /// True when nothing arrives within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        let mut line = String::new();
        tokio::time::timeout(wait, self.reader.read_line(&mut line))
            .await
            .is_err()
    }
}

/// Polls `check` every 10ms for up to five seconds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
