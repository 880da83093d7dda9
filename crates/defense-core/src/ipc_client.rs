use crate::ipc::{
    decode_response, write_frame, Command, FirewallStatusResponse, Request, Response,
    ScanResponse, StatusResponse,
};
use crate::state::{ProtectionState, StateChangeEvent};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("ipc connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("ipc i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by daemon")]
    Closed,
    #[error("malformed daemon reply: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("response id mismatch: expected {expected}, got {got}")]
    IdMismatch { expected: String, got: String },
}

impl ClientError {
    /// Errors that a fresh connection might fix. Daemon-reported failures
    /// and malformed replies are not retried.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Connect(_) | ClientError::Io(_) | ClientError::Closed
        )
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    // True from the write until the reply has been read. Still set when a
    // call was dropped mid-flight, leaving a reply nobody will claim.
    awaiting_reply: bool,
}

impl Connection {
    async fn open(socket_path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::Connect)?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
            awaiting_reply: false,
        })
    }

    async fn round_trip(&mut self, request: &Request) -> Result<Response, ClientError> {
        self.awaiting_reply = true;
        write_frame(&mut self.writer, request).await?;
        let response = self.read_response().await?.ok_or(ClientError::Closed)?;
        self.awaiting_reply = false;
        Ok(response)
    }

    async fn read_response(&mut self) -> Result<Option<Response>, ClientError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(decode_response(&line)?))
    }
}

/// Request/response client for the daemon's control socket.
///
/// Connects on first use and keeps the connection for later calls. A call
/// that fails with a connection-class error reconnects and retries once.
pub struct ControlClient {
    socket_path: PathBuf,
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            conn: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends `command` and returns the response payload, or the daemon's
    /// error as `ClientError::Daemon`.
    pub async fn call(&self, command: Command, params: Value) -> Result<Value, ClientError> {
        let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let request = Request::new(id, command).with_params(params);

        let mut slot = self.conn.lock().await;
        let response = match self.exchange(&mut slot, &request).await {
            Err(err) if err.is_connection_error() => {
                debug!(error = %err, command = %command, "control connection lost, retrying once");
                self.exchange(&mut slot, &request).await?
            }
            other => other?,
        };
        drop(slot);

        if !response.success {
            return Err(ClientError::Daemon(
                response.error.unwrap_or_else(|| "unspecified error".to_string()),
            ));
        }
        Ok(response.data.unwrap_or(Value::Null))
    }

    async fn exchange(
        &self,
        slot: &mut Option<Connection>,
        request: &Request,
    ) -> Result<Response, ClientError> {
        if slot.as_ref().is_some_and(|conn| conn.awaiting_reply) {
            debug!("dropping control connection with an unclaimed reply");
            *slot = None;
        }
        if slot.is_none() {
            *slot = Some(Connection::open(&self.socket_path).await?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(ClientError::Closed);
        };
        // Once the request is on the wire, any failure leaves the stream at
        // an unknown position, so the connection is not reused.
        let response = match conn.round_trip(request).await {
            Ok(response) => response,
            Err(err) => {
                *slot = None;
                return Err(err);
            }
        };
        if response.id != request.id {
            *slot = None;
            return Err(ClientError::IdMismatch {
                expected: request.id.clone(),
                got: response.id,
            });
        }
        Ok(response)
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.call(Command::Ping, Value::Null).await.map(|_| ())
    }

    pub async fn status(&self) -> Result<StatusResponse, ClientError> {
        let data = self.call(Command::Status, Value::Null).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn is_protected(&self) -> Result<bool, ClientError> {
        Ok(self.status().await?.state == ProtectionState::Protected)
    }

    pub async fn set_firewall_enabled(&self, enabled: bool) -> Result<(), ClientError> {
        let command = if enabled {
            Command::FirewallEnable
        } else {
            Command::FirewallDisable
        };
        self.call(command, Value::Null).await.map(|_| ())
    }

    pub async fn firewall_status(&self) -> Result<FirewallStatusResponse, ClientError> {
        let data = self.call(Command::FirewallStatus, Value::Null).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn start_quick_scan(&self) -> Result<ScanResponse, ClientError> {
        let data = self.call(Command::ScanQuick, Value::Null).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn start_full_scan(&self) -> Result<ScanResponse, ClientError> {
        let data = self.call(Command::ScanFull, Value::Null).await?;
        Ok(serde_json::from_value(data)?)
    }

    pub async fn pause(&self) -> Result<(), ClientError> {
        self.call(Command::Pause, Value::Null).await.map(|_| ())
    }

    pub async fn resume(&self) -> Result<(), ClientError> {
        self.call(Command::Resume, Value::Null).await.map(|_| ())
    }

    /// Opens a dedicated connection that only carries state-change events.
    /// When the returned stream ends the caller should fall back to polling
    /// `status`.
    pub async fn subscribe(&self) -> Result<EventStream, ClientError> {
        let mut conn = Connection::open(&self.socket_path).await?;
        let request = Request::new("subscribe", Command::Subscribe);
        let ack = conn.round_trip(&request).await?;
        if !ack.success {
            return Err(ClientError::Daemon(
                ack.error.unwrap_or_else(|| "subscribe rejected".to_string()),
            ));
        }
        Ok(EventStream { conn })
    }

    /// Drops the cached connection; the next call reconnects.
    pub async fn close(&self) {
        self.conn.lock().await.take();
    }
}

/// Push-event stream from a `subscribe` connection.
pub struct EventStream {
    conn: Connection,
}

impl EventStream {
    /// Next state change, or `None` once the daemon closes the stream.
    pub async fn next_event(&mut self) -> Result<Option<StateChangeEvent>, ClientError> {
        loop {
            let Some(response) = self.conn.read_response().await? else {
                return Ok(None);
            };
            if response.is_event() {
                return Ok(Some(response.data_as()?));
            }
            debug!(id = %response.id, "ignoring non-event frame on subscription");
        }
    }
}
