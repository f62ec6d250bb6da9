//! Observable event surface shared by the service and tunnel controllers.
//!
//! One event is emitted per actual state transition, never per poll. The
//! serialized field names are a stable contract with the UI collaborator.

use crate::service::{ForwardState, ServiceStatus};
use crate::tunnel::TunnelStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusChange {
    pub host_id: String,
    pub service_id: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_state: Option<ForwardState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusChange {
    pub host_id: String,
    pub forward_id: String,
    pub status: TunnelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusEvent {
    Service(ServiceStatusChange),
    Tunnel(TunnelStatusChange),
}

/// Fan-out publisher for status transitions.
///
/// Subscribers attach with [`subscribe`](StatusBroadcaster::subscribe) and
/// detach by dropping the receiver; neither affects emission to anyone else.
/// There is no missed-event buffering beyond the channel capacity: a
/// subscriber that lags past it observes a `Lagged` marker, not a stall.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: StatusEvent) {
        // A send with no subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
