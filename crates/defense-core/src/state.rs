use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall protection posture of the host.
///
/// `Starting` is only ever the initial value. `Scanning` and `Paused` are
/// left alone by the health evaluator; only an explicit command or a finished
/// scan moves the machine out of them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionState {
    #[default]
    Starting,
    Protected,
    Warning,
    Alert,
    Scanning,
    Paused,
}

impl ProtectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtectionState::Starting => "starting",
            ProtectionState::Protected => "protected",
            ProtectionState::Warning => "warning",
            ProtectionState::Alert => "alert",
            ProtectionState::Scanning => "scanning",
            ProtectionState::Paused => "paused",
        }
    }

    /// True for states the periodic evaluator must not overwrite.
    pub fn is_sticky(&self) -> bool {
        matches!(self, ProtectionState::Scanning | ProtectionState::Paused)
    }
}

impl fmt::Display for ProtectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One accepted transition. `old` and `new` always differ.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChangeEvent {
    pub old: ProtectionState,
    pub new: ProtectionState,
}
