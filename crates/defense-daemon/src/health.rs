//! Periodic health evaluation.
//!
//! Recomputes the protection state from live signals: scanner reachability
//! and whether the firewall is filtering when it should be. A missed probe
//! just yields `warning` until the next tick; there is no retry or backoff.

use defense_core::state::ProtectionState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::firewall::Firewall;
use crate::scanner::{fallback, ScannerProbe};
use crate::service_state::DaemonStatus;
use crate::state_manager::StateManager;

pub struct HealthEvaluator {
    state: Arc<StateManager>,
    probe: Arc<dyn ScannerProbe>,
    firewall: Arc<dyn Firewall>,
    status: Arc<DaemonStatus>,
    /// Alternate engine sockets consulted when the probe cannot run.
    /// Empty disables fallback probing.
    fallback_sockets: Vec<PathBuf>,
}

impl HealthEvaluator {
    pub fn new(
        state: Arc<StateManager>,
        probe: Arc<dyn ScannerProbe>,
        firewall: Arc<dyn Firewall>,
        status: Arc<DaemonStatus>,
    ) -> Self {
        Self {
            state,
            probe,
            firewall,
            status,
            fallback_sockets: Vec::new(),
        }
    }

    pub fn with_fallback(mut self, sockets: Vec<PathBuf>) -> Self {
        self.fallback_sockets = sockets;
        self
    }

    /// Runs one evaluation. Returns the state it targeted, or `None` when
    /// the current state is sticky and evaluation was skipped.
    pub async fn evaluate(&self) -> Option<ProtectionState> {
        let current = self.state.current();
        if current.is_sticky() {
            debug!(state = %current, "health check skipped");
            return None;
        }

        let target = if !self.scanner_available().await {
            warn!("scanner engine not available");
            ProtectionState::Warning
        } else if self.status.firewall_desired() && !self.firewall.live_enabled() {
            warn!("firewall disabled but should be enabled");
            ProtectionState::Warning
        } else {
            ProtectionState::Protected
        };

        // A scan or pause may have started while the probe was in flight.
        if self.state.current() != target
            && self
                .state
                .transition_if(target, |s| !s.is_sticky())
                .is_none()
        {
            return None;
        }
        if current == ProtectionState::Starting {
            info!(state = %target, "daemon ready");
        }
        Some(target)
    }

    async fn scanner_available(&self) -> bool {
        if self.probe.can_probe() || self.fallback_sockets.is_empty() {
            return self.probe.is_available().await;
        }
        let sockets = self.fallback_sockets.clone();
        tokio::task::spawn_blocking(move || fallback::engine_present(&sockets))
            .await
            .unwrap_or(false)
    }
}

/// Handle for the running health loop.
pub struct HealthLoopHandle {
    /// Wakes the loop for an immediate evaluation.
    pub wake: Arc<Notify>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl HealthLoopHandle {
    pub fn evaluate_now(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Spawns the evaluation loop: once immediately, then every `interval`, or
/// sooner when woken.
pub fn spawn_health_loop(
    evaluator: Arc<HealthEvaluator>,
    interval: Duration,
) -> (JoinHandle<()>, HealthLoopHandle) {
    let wake = Arc::new(Notify::new());
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let wake_rx = wake.clone();

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "health loop started");
        evaluator.evaluate().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake_rx.notified() => {
                    debug!("health loop woken early");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("health loop shutting down");
                        return;
                    }
                }
            }

            if *shutdown_rx.borrow() {
                return;
            }
            evaluator.evaluate().await;
        }
    });

    (handle, HealthLoopHandle { wake, shutdown_tx })
}
