//! Endpoint-protection daemon: protection state machine, health evaluation,
//! background scans and the local control server.

pub mod daemon;
pub mod firewall;
pub mod health;
pub mod scan;
pub mod scanner;
pub mod server;
pub mod service_state;
pub mod state_manager;
pub mod supervisor;

pub use daemon::Daemon;
pub use state_manager::StateManager;
