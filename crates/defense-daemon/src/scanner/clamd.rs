use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use super::{ScanVerdict, ScannerProbe};

const PING: &[u8] = b"PING\n";
const PONG: &str = "PONG";

/// Talks to clamd over its local socket.
#[derive(Debug, Clone)]
pub struct ClamdProbe {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ClamdProbe {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends one command line and returns the first reply line, trimmed.
    async fn exchange(&self, command: &[u8]) -> anyhow::Result<String> {
        let stream = timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .map_err(|_| anyhow::anyhow!("connect timed out"))??;
        let (read_half, mut writer) = stream.into_split();
        writer.write_all(command).await?;
        writer.flush().await?;
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            anyhow::bail!("engine closed the connection");
        }
        Ok(line.trim_end().to_string())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let reply = timeout(self.timeout, self.exchange(PING))
            .await
            .map_err(|_| anyhow::anyhow!("ping timed out"))??;
        if reply != PONG {
            anyhow::bail!("unexpected ping reply: {reply}");
        }
        Ok(())
    }
}

#[async_trait]
impl ScannerProbe for ClamdProbe {
    async fn is_available(&self) -> bool {
        if !self.can_probe() {
            return false;
        }
        match self.ping().await {
            Ok(()) => true,
            Err(err) => {
                debug!(socket = %self.socket_path.display(), error = %err, "clamd ping failed");
                false
            }
        }
    }

    async fn scan_file(&self, path: &Path) -> ScanVerdict {
        let command = format!("SCAN {}\n", path.display());
        // Scans are not bounded by the probe timeout; large files take a while.
        match self.exchange(command.as_bytes()).await {
            Ok(reply) => parse_scan_reply(&reply),
            Err(err) => ScanVerdict::Error {
                reason: err.to_string(),
            },
        }
    }

    fn can_probe(&self) -> bool {
        !self.socket_path.as_os_str().is_empty() && self.socket_path.exists()
    }
}

/// Parses `<path>: OK`, `<path>: <signature> FOUND` or `<path>: <msg> ERROR`.
fn parse_scan_reply(reply: &str) -> ScanVerdict {
    let Some((_, status)) = reply.rsplit_once(": ") else {
        return ScanVerdict::Error {
            reason: format!("unrecognized reply: {reply}"),
        };
    };
    if status == "OK" {
        return ScanVerdict::Clean;
    }
    if let Some(signature) = status.strip_suffix(" FOUND") {
        return ScanVerdict::Infected {
            signature: signature.to_string(),
        };
    }
    ScanVerdict::Error {
        reason: status.trim_end_matches(" ERROR").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::net::UnixListener;

    /// Serves one reply per connection, chosen by the request line.
    fn fake_clamd(socket: &Path, reply: fn(&str) -> Option<String>) -> tokio::task::JoinHandle<()> {
        let listener = UnixListener::bind(socket).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (read_half, mut writer) = stream.into_split();
                    let mut reader = BufReader::new(read_half);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.is_err() {
                        return;
                    }
                    if let Some(out) = reply(line.trim_end()) {
                        let _ = writer.write_all(out.as_bytes()).await;
                    }
                });
            }
        })
    }

    #[test]
    fn scan_replies_parse() {
        assert_eq!(parse_scan_reply("/tmp/a: OK"), ScanVerdict::Clean);
        assert_eq!(
            parse_scan_reply("/tmp/eicar.com: Win.Test.EICAR_HDB-1 FOUND"),
            ScanVerdict::Infected {
                signature: "Win.Test.EICAR_HDB-1".to_string()
            }
        );
        assert_eq!(
            parse_scan_reply("/root/x: Access denied. ERROR"),
            ScanVerdict::Error {
                reason: "Access denied.".to_string()
            }
        );
        assert!(matches!(parse_scan_reply("garbage"), ScanVerdict::Error { .. }));
    }

    #[tokio::test]
    async fn pong_means_available() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("clamd.sock");
        let server = fake_clamd(&socket, |req| (req == "PING").then(|| "PONG\n".to_string()));

        let probe = ClamdProbe::new(&socket, Duration::from_secs(1));
        assert!(probe.can_probe());
        assert!(probe.is_available().await);
        server.abort();
    }

    #[tokio::test]
    async fn wrong_reply_means_unavailable() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("clamd.sock");
        let server = fake_clamd(&socket, |_| Some("PANG\n".to_string()));

        let probe = ClamdProbe::new(&socket, Duration::from_secs(1));
        assert!(!probe.is_available().await);
        server.abort();
    }

    #[tokio::test]
    async fn silent_engine_times_out() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("clamd.sock");
        // Accepts but never answers; held open by the listener task.
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let probe = ClamdProbe::new(&socket, Duration::from_millis(100));
        let started = std::time::Instant::now();
        assert!(!probe.is_available().await);
        assert!(started.elapsed() < Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn missing_socket_cannot_probe() {
        let dir = tempdir().unwrap();
        let probe = ClamdProbe::new(dir.path().join("absent.sock"), Duration::from_secs(1));
        assert!(!probe.can_probe());
        assert!(!probe.is_available().await);
    }

    #[tokio::test]
    async fn scan_file_reports_infection() {
        let dir = tempdir().unwrap();
        let socket = dir.path().join("clamd.sock");
        let server = fake_clamd(&socket, |req| {
            let path = req.strip_prefix("SCAN ")?;
            Some(format!("{path}: Eicar-Signature FOUND\n"))
        });

        let probe = ClamdProbe::new(&socket, Duration::from_secs(1));
        let verdict = probe.scan_file(Path::new("/tmp/sample.bin")).await;
        assert_eq!(
            verdict,
            ScanVerdict::Infected {
                signature: "Eicar-Signature".to_string()
            }
        );
        server.abort();
    }
}
