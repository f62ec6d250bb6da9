pub mod relay;
pub mod supervisor;

pub use supervisor::TunnelSupervisor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Running => "running",
            TunnelStatus::Stopping => "stopping",
            TunnelStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Runtime state of one forward rule, derived purely from the in-memory
/// state machine; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelState {
    pub status: TunnelStatus,
    pub error: Option<String>,
    /// Pending automatic reconnect attempt; set only while status = error.
    pub reconnect_at: Option<DateTime<Utc>>,
}
