use anyhow::Result;
use defense_core::settings::DaemonSettings;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::firewall::{AppliedFirewall, Firewall};
use crate::health::{spawn_health_loop, HealthEvaluator};
use crate::scan::{ScanRegistry, ScanRoots};
use crate::scanner::{ClamdProbe, ScannerProbe};
use crate::server::{ControlServer, ServerContext};
use crate::service_state::DaemonStatus;
use crate::state_manager::StateManager;
use crate::supervisor;

/// The assembled daemon: one state manager shared by the health loop, the
/// control server and every scan job.
pub struct Daemon {
    settings: DaemonSettings,
    state: Arc<StateManager>,
    probe: Arc<dyn ScannerProbe>,
    firewall: Arc<dyn Firewall>,
    status: Arc<DaemonStatus>,
}

impl Daemon {
    pub fn new(settings: DaemonSettings) -> Self {
        let probe = Arc::new(ClamdProbe::new(
            settings.clamd_socket.clone(),
            settings.probe_timeout(),
        ));
        let firewall = Arc::new(AppliedFirewall::new(settings.firewall_enabled));
        let status = Arc::new(DaemonStatus::new(settings.firewall_enabled));
        Self {
            settings,
            state: Arc::new(StateManager::new()),
            probe,
            firewall,
            status,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ScannerProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = firewall;
        self
    }

    pub fn state(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    /// Runs until `shutdown` becomes true or its sender is dropped. Fails
    /// only when the settings are invalid or the control socket cannot be
    /// bound.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.settings.validate()?;
        let server = ControlServer::bind(&self.settings.socket_path)?;

        let fallback = if self.settings.fallback_probing {
            self.settings.clamd_fallback_sockets.clone()
        } else {
            Vec::new()
        };
        let evaluator = HealthEvaluator::new(
            self.state.clone(),
            self.probe.clone(),
            self.firewall.clone(),
            self.status.clone(),
        )
        .with_fallback(fallback);
        let (health_task, health) =
            spawn_health_loop(Arc::new(evaluator), self.settings.health_interval());

        let scans = ScanRegistry::default();
        let ctx = ServerContext {
            state: self.state.clone(),
            probe: self.probe.clone(),
            firewall: self.firewall.clone(),
            status: self.status.clone(),
            roots: ScanRoots {
                quick: self.settings.quick_scan_paths.clone(),
                full: self.settings.full_scan_paths.clone(),
            },
            scans: scans.clone(),
            health_wake: health.wake.clone(),
        };
        let server_task = tokio::spawn(server.serve(ctx, shutdown.clone()));

        supervisor::notify_ready();
        info!(
            socket = %self.settings.socket_path.display(),
            engine = %self.settings.clamd_socket.display(),
            "daemon started"
        );

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        supervisor::notify_stopping();
        info!("daemon stopping");
        health.shutdown();
        if let Err(err) = health_task.await {
            warn!(error = %err, "health loop task failed");
        }
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "control server stopped with error"),
            Err(err) => warn!(error = %err, "control server task failed"),
        }

        let running = scans.in_flight();
        if !running.is_empty() {
            warn!(count = running.len(), jobs = ?running, "scans still running at shutdown");
        }
        info!(state = %self.state.current(), "daemon stopped");
        Ok(())
    }
}
