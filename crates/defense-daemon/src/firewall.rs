//! Seam to the host firewall subsystem. The rule engine itself lives
//! elsewhere; the daemon only asks whether filtering is live and requests
//! that it be switched on or off.

use parking_lot::Mutex;

pub trait Firewall: Send + Sync {
    /// Whether the firewall is actually filtering right now.
    fn live_enabled(&self) -> bool;

    fn apply(&self, enabled: bool) -> anyhow::Result<()>;
}

/// Reports whatever was last applied through it.
#[derive(Debug)]
pub struct AppliedFirewall {
    enabled: Mutex<bool>,
}

impl AppliedFirewall {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Mutex::new(enabled),
        }
    }
}

impl Firewall for AppliedFirewall {
    fn live_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    fn apply(&self, enabled: bool) -> anyhow::Result<()> {
        *self.enabled.lock() = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applied_value_is_reported() {
        let fw = AppliedFirewall::new(false);
        assert!(!fw.live_enabled());
        fw.apply(true).unwrap();
        assert!(fw.live_enabled());
    }
}
