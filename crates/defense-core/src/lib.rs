//! Shared types for the protection daemon and its local clients.
//!
//! - `state`      the protection state enum and change events
//! - `ipc`        line-delimited JSON wire protocol
//! - `ipc_client` control client for local front ends
//! - `paths`      well-known socket locations
//! - `settings`   daemon runtime settings

pub mod ipc;
#[cfg(unix)]
pub mod ipc_client;
pub mod paths;
pub mod settings;
pub mod state;

pub use ipc::{Command, Request, Response, PROTOCOL_VERSION};
pub use settings::DaemonSettings;
pub use state::{ProtectionState, StateChangeEvent};
