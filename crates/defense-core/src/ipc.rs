//! Control protocol spoken over the daemon's local socket.
//!
//! Framing is newline-delimited JSON in both directions: one `Request` per
//! line from the client, one `Response` per line from the daemon. Push events
//! for subscribers reuse the `Response` shape with `id == "event"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::state::{ProtectionState, StateChangeEvent};

/// Bumped on incompatible wire changes. Requests carrying `0` predate
/// versioning and are always accepted.
pub const PROTOCOL_VERSION: i64 = 1;

/// Correlation id used for pushed state-change events.
pub const EVENT_ID: &str = "event";

/// Error text returned for lines that are not a valid request.
pub const INVALID_JSON: &str = "invalid JSON";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ping,
    Status,
    FirewallEnable,
    FirewallDisable,
    FirewallStatus,
    ScanQuick,
    ScanFull,
    Pause,
    Resume,
    Subscribe,
}

impl Command {
    pub const ALL: [Command; 10] = [
        Command::Ping,
        Command::Status,
        Command::FirewallEnable,
        Command::FirewallDisable,
        Command::FirewallStatus,
        Command::ScanQuick,
        Command::ScanFull,
        Command::Pause,
        Command::Resume,
        Command::Subscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Status => "status",
            Command::FirewallEnable => "firewall_enable",
            Command::FirewallDisable => "firewall_disable",
            Command::FirewallStatus => "firewall_status",
            Command::ScanQuick => "scan_quick",
            Command::ScanFull => "scan_full",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Subscribe => "subscribe",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol version mismatch: client={client}, server={server}")]
pub struct VersionMismatch {
    pub client: i64,
    pub server: i64,
}

/// Client → daemon.
///
/// `cmd` stays a plain string on the wire so that unknown commands from newer
/// clients still decode and get a descriptive error instead of `invalid JSON`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "cmd", default)]
    pub command: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    /// Any integer decodes; `check_version` rejects the ones it does not speak.
    #[serde(default)]
    pub version: i64,
}

impl Request {
    pub fn new(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: id.into(),
            command: command.as_str().to_string(),
            params: Value::Null,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Version `0` means an unversioned caller and is accepted.
    pub fn check_version(&self) -> Result<(), VersionMismatch> {
        if self.version != 0 && self.version != PROTOCOL_VERSION {
            return Err(VersionMismatch {
                client: self.version,
                server: PROTOCOL_VERSION,
            });
        }
        Ok(())
    }

    pub fn parse_command(&self) -> Result<Command, UnknownCommand> {
        self.command.parse()
    }
}

/// Daemon → client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    #[serde(default)]
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok<T: Serialize>(id: impl Into<String>, data: T) -> Self {
        let id = id.into();
        match serde_json::to_value(data) {
            Ok(value) => Self {
                id,
                success: true,
                data: Some(value),
                error: None,
            },
            Err(err) => Self::error(id, format!("marshal error: {err}")),
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn event(event: StateChangeEvent) -> Self {
        Self::ok(EVENT_ID, event)
    }

    pub fn is_event(&self) -> bool {
        self.success && self.id == EVENT_ID
    }

    /// Decodes `data` into a typed payload.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }
}

/// Payload of `status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub state: ProtectionState,
    pub firewall_enabled: bool,
    pub last_scan: Option<DateTime<Utc>>,
    pub rules_updated: DateTime<Utc>,
}

/// Payload of `scan_quick` / `scan_full`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanResponse {
    pub job_id: String,
}

/// Payload of `firewall_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirewallStatusResponse {
    pub enabled: bool,
    pub desired: bool,
}

/// Serializes `value` as a single protocol line, trailing newline included.
pub fn encode_line<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> serde_json::Result<Request> {
    serde_json::from_str(line.trim_end())
}

pub fn decode_response(line: &str) -> serde_json::Result<Response> {
    serde_json::from_str(line.trim_end())
}

/// Writes one framed message and flushes.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode_line(value).map_err(std::io::Error::from)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}
