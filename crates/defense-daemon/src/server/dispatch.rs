use defense_core::ipc::{
    Command, FirewallStatusResponse, Request, Response, ScanResponse, StatusResponse,
};
use defense_core::state::ProtectionState;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::firewall::Firewall;
use crate::scan::{ScanContext, ScanJob, ScanKind, ScanRegistry, ScanRoots};
use crate::scanner::ScannerProbe;
use crate::service_state::DaemonStatus;
use crate::state_manager::StateManager;

/// Shared daemon components the control server acts on.
#[derive(Clone)]
pub struct ServerContext {
    pub state: Arc<StateManager>,
    pub probe: Arc<dyn ScannerProbe>,
    pub firewall: Arc<dyn Firewall>,
    pub status: Arc<DaemonStatus>,
    pub roots: ScanRoots,
    pub scans: ScanRegistry,
    /// Wakes the health loop for an out-of-cycle evaluation.
    pub health_wake: Arc<Notify>,
}

pub struct Dispatcher {
    ctx: ServerContext,
}

impl Dispatcher {
    pub fn new(ctx: ServerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Handles one decoded, version-checked request. `subscribe` is owned by
    /// the connection layer and is rejected here.
    pub fn dispatch(&self, request: &Request) -> Response {
        let id = request.id.as_str();
        let command = match request.parse_command() {
            Ok(command) => command,
            Err(err) => {
                warn!(cmd = %request.command, "unknown command");
                return Response::error(id, err.to_string());
            }
        };

        match command {
            Command::Ping => Response::ok(id, "pong"),
            Command::Status => Response::ok(
                id,
                StatusResponse {
                    state: self.ctx.state.current(),
                    firewall_enabled: self.ctx.firewall.live_enabled(),
                    last_scan: self.ctx.status.last_scan(),
                    rules_updated: self.ctx.status.rules_updated(),
                },
            ),
            Command::FirewallEnable => self.set_firewall(id, true),
            Command::FirewallDisable => self.set_firewall(id, false),
            Command::FirewallStatus => Response::ok(
                id,
                FirewallStatusResponse {
                    enabled: self.ctx.firewall.live_enabled(),
                    desired: self.ctx.status.firewall_desired(),
                },
            ),
            Command::ScanQuick => self.start_scan(id, ScanKind::Quick),
            Command::ScanFull => self.start_scan(id, ScanKind::Full),
            Command::Pause => {
                self.ctx.state.transition(ProtectionState::Paused);
                info!("protection paused by client");
                Response::ok(id, "protection paused")
            }
            Command::Resume => {
                self.ctx.state.transition(ProtectionState::Protected);
                info!("protection resumed by client");
                Response::ok(id, "protection resumed")
            }
            Command::Subscribe => Response::error(id, "subscribe requires its own connection"),
        }
    }

    fn set_firewall(&self, id: &str, enabled: bool) -> Response {
        self.ctx.status.set_firewall_desired(enabled);
        if let Err(err) = self.ctx.firewall.apply(enabled) {
            warn!(enabled, error = %err, "firewall apply failed");
        }
        info!(enabled, "firewall desired state changed");
        self.ctx.health_wake.notify_one();
        Response::ok(
            id,
            if enabled {
                "firewall enabled"
            } else {
                "firewall disabled"
            },
        )
    }

    fn start_scan(&self, id: &str, kind: ScanKind) -> Response {
        self.ctx.state.transition(ProtectionState::Scanning);

        let job = ScanJob::new(kind);
        let job_id = job.job_id.clone();
        let roots = self.ctx.roots.for_kind(kind).to_vec();
        let (key, cancel) = self.ctx.scans.register(&job_id);
        let scans = self.ctx.scans.clone();
        let scan_ctx = ScanContext {
            state: self.ctx.state.clone(),
            status: self.ctx.status.clone(),
            probe: self.ctx.probe.clone(),
        };
        tokio::spawn(async move {
            job.run(roots, scan_ctx, cancel).await;
            scans.finish(key);
        });

        Response::ok(id, ScanResponse { job_id })
    }
}
