use crate::config::{ConnectionDescriptor, ServiceDescriptor};
use crate::error::Result;
use crate::events::{ServiceStatusChange, StatusBroadcaster, StatusEvent};
use crate::service::controller::{ServiceLifecycleController, ServiceLogs, StartOutcome, StatusProbe};
use crate::service::{ForwardState, ServiceRuntimeState, ServiceStatus};
use crate::ssh::exec::CommandRunner;
use crate::tunnel::{TunnelStatus, TunnelSupervisor};
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// UI-facing orchestration over [`ServiceLifecycleController`]: transition
/// bookkeeping (`starting`/`stopping` before the call, `error` on failure),
/// the last-broadcast-status table, and the independent forward-state
/// computation.
///
/// Failures are never retried here; the refresh loop on the UI side decides
/// whether to call again.
pub struct ServiceManager<R> {
    controller: ServiceLifecycleController<R>,
    tunnels: TunnelSupervisor,
    events: StatusBroadcaster,
    last: RwLock<HashMap<(String, String), ServiceRuntimeState>>,
}

impl<R: CommandRunner> ServiceManager<R> {
    pub fn new(runner: R, tunnels: TunnelSupervisor, events: StatusBroadcaster) -> Self {
        Self {
            controller: ServiceLifecycleController::new(runner),
            tunnels,
            events,
            last: RwLock::new(HashMap::new()),
        }
    }

    /// Start a service. On success the captured pid and log path are returned
    /// for the persistence collaborator to write back; the service stays
    /// `starting` until a refresh confirms it.
    pub async fn start_service(
        &self,
        host_id: &str,
        conn: &ConnectionDescriptor,
        host_name: &str,
        service: &ServiceDescriptor,
    ) -> Result<StartOutcome> {
        let forward = self.forward_health(service).await;
        self.publish(
            host_id,
            &service.id,
            self.compose(ServiceStatus::Starting, None, None, &forward),
        )
        .await;

        match self.controller.start(conn, host_name, service).await {
            Ok(outcome) => {
                self.publish(
                    host_id,
                    &service.id,
                    self.compose(ServiceStatus::Starting, Some(outcome.pid), None, &forward),
                )
                .await;
                Ok(outcome)
            }
            Err(e) => {
                self.publish(
                    host_id,
                    &service.id,
                    self.compose(ServiceStatus::Error, None, Some(e.to_string()), &forward),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Stop a service by signalling its recorded pid's process group.
    pub async fn stop_service(
        &self,
        host_id: &str,
        conn: &ConnectionDescriptor,
        service: &ServiceDescriptor,
    ) -> Result<()> {
        let forward = self.forward_health(service).await;
        self.publish(
            host_id,
            &service.id,
            self.compose(ServiceStatus::Stopping, service.pid, None, &forward),
        )
        .await;

        match self.controller.stop(conn, service.pid).await {
            Ok(()) => {
                self.publish(
                    host_id,
                    &service.id,
                    self.compose(ServiceStatus::Stopped, None, None, &forward),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.publish(
                    host_id,
                    &service.id,
                    self.compose(ServiceStatus::Error, service.pid, Some(e.to_string()), &forward),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Recompute a service's status from remote ground truth and broadcast
    /// it if the observation changed.
    ///
    /// A listener found on the exposed port is authoritative, including when
    /// its pid differs from the recorded one (a supervisor respawned the
    /// process); the returned state carries the discovered pid for the
    /// persistence layer to adopt.
    pub async fn refresh_service(
        &self,
        host_id: &str,
        conn: &ConnectionDescriptor,
        service: &ServiceDescriptor,
    ) -> Result<ServiceRuntimeState> {
        let forward = self.forward_health(service).await;

        let probe = match self.controller.status(conn, service).await {
            Ok(probe) => probe,
            Err(e) => {
                // Transient diagnostic (permission or network trouble),
                // distinct from "process is gone".
                let state =
                    self.compose(ServiceStatus::Error, service.pid, Some(e.to_string()), &forward);
                self.publish(host_id, &service.id, state).await;
                return Err(e);
            }
        };

        let last_status = {
            let last = self.last.read().await;
            last.get(&(host_id.to_string(), service.id.clone()))
                .map(|s| s.status)
        };

        let (status, pid) = match probe {
            StatusProbe::Listening { pid } => (ServiceStatus::Running, Some(pid)),
            StatusProbe::Alive { pid } => {
                // Starting window: the process is alive but has not bound its
                // port yet; stay `starting` until the port probe confirms.
                if last_status == Some(ServiceStatus::Starting) && service.exposed_port != 0 {
                    (ServiceStatus::Starting, Some(pid))
                } else {
                    (ServiceStatus::Running, Some(pid))
                }
            }
            StatusProbe::Stopped => (ServiceStatus::Stopped, None),
        };

        let state = self.compose(status, pid, None, &forward);
        self.publish(host_id, &service.id, state.clone()).await;
        Ok(state)
    }

    /// Fetch the merged log tail.
    pub async fn service_logs(
        &self,
        conn: &ConnectionDescriptor,
        service: &ServiceDescriptor,
    ) -> Result<ServiceLogs> {
        self.controller.logs(conn, service).await
    }

    /// React to a deleted service: drop its runtime entry.
    pub async fn remove_service(&self, host_id: &str, service_id: &str) {
        let removed = self
            .last
            .write()
            .await
            .remove(&(host_id.to_string(), service_id.to_string()));
        if removed.is_some() {
            info!(service = service_id, "Removed service runtime state");
        }
    }

    /// Last broadcast state, if any.
    pub async fn state(&self, host_id: &str, service_id: &str) -> Option<ServiceRuntimeState> {
        self.last
            .read()
            .await
            .get(&(host_id.to_string(), service_id.to_string()))
            .cloned()
    }

    /// Forwarding health, tracked independently of process health. `none`
    /// whenever no forward port is configured, regardless of process status.
    async fn forward_health(&self, service: &ServiceDescriptor) -> (ForwardState, Option<String>) {
        if service.forward_local_port.is_none() {
            return (ForwardState::None, None);
        }
        match self.tunnels.state(&service.id).await {
            Some(state) if state.status == TunnelStatus::Running => (ForwardState::Ok, None),
            Some(state) if state.status == TunnelStatus::Error => {
                (ForwardState::Error, state.error)
            }
            _ => (ForwardState::None, None),
        }
    }

    fn compose(
        &self,
        status: ServiceStatus,
        pid: Option<u32>,
        error: Option<String>,
        forward: &(ForwardState, Option<String>),
    ) -> ServiceRuntimeState {
        ServiceRuntimeState {
            status,
            pid,
            error,
            updated_at: Utc::now(),
            forward_state: forward.0,
            forward_error: forward.1.clone(),
        }
    }

    /// Broadcast `state` only when the observation actually changed.
    async fn publish(&self, host_id: &str, service_id: &str, state: ServiceRuntimeState) {
        let key = (host_id.to_string(), service_id.to_string());
        let mut last = self.last.write().await;
        if let Some(prev) = last.get(&key) {
            if prev.same_observation(&state) {
                return;
            }
        }
        debug!(
            service = service_id,
            status = %state.status,
            "Service state changed"
        );
        self.events.emit(StatusEvent::Service(ServiceStatusChange {
            host_id: host_id.to_string(),
            service_id: service_id.to_string(),
            status: state.status,
            pid: state.pid,
            error: state.error.clone(),
            updated_at: Some(state.updated_at),
            forward_state: Some(state.forward_state),
            forward_error: state.forward_error.clone(),
        }));
        last.insert(key, state);
    }
}
