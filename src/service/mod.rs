pub mod command;
pub mod controller;
pub mod manager;

pub use controller::{ServiceLifecycleController, ServiceLogs, StartOutcome, StatusProbe};
pub use manager::ServiceManager;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Starting,
    Stopping,
    Error,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Health of a service's optional local port-forward, tracked independently
/// of the process itself: a service can be running with forwarding disabled
/// or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardState {
    None,
    Ok,
    Error,
}

/// Last observed runtime state of one service. In-memory only.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRuntimeState {
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub forward_state: ForwardState,
    pub forward_error: Option<String>,
}

impl ServiceRuntimeState {
    /// Whether two states describe the same observation. `updated_at` is a
    /// timestamp, not part of the observation, so it is ignored.
    pub fn same_observation(&self, other: &Self) -> bool {
        self.status == other.status
            && self.pid == other.pid
            && self.error == other.error
            && self.forward_state == other.forward_state
            && self.forward_error == other.forward_error
    }
}
