use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Mutable runtime facts reported by `status`, shared between the control
/// server, the scan jobs and the health evaluator.
#[derive(Debug)]
pub struct DaemonStatus {
    inner: Mutex<StatusFields>,
}

#[derive(Debug, Clone)]
struct StatusFields {
    firewall_desired: bool,
    last_scan: Option<DateTime<Utc>>,
    rules_updated: DateTime<Utc>,
}

impl DaemonStatus {
    pub fn new(firewall_desired: bool) -> Self {
        Self {
            inner: Mutex::new(StatusFields {
                firewall_desired,
                last_scan: None,
                // Signatures are assumed current when the daemon starts.
                rules_updated: Utc::now(),
            }),
        }
    }

    pub fn firewall_desired(&self) -> bool {
        self.inner.lock().firewall_desired
    }

    pub fn set_firewall_desired(&self, enabled: bool) {
        self.inner.lock().firewall_desired = enabled;
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_scan
    }

    pub fn record_scan(&self, at: DateTime<Utc>) {
        self.inner.lock().last_scan = Some(at);
    }

    pub fn rules_updated(&self) -> DateTime<Utc> {
        self.inner.lock().rules_updated
    }
}
