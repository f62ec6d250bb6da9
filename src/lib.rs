//! Manage long-running processes and SSH local port-forwards on remote hosts
//! from a single control point.
//!
//! The crate is the orchestration core behind a UI: controllers accept
//! start/stop/refresh commands, talk to remote hosts over SSH (optionally
//! through one jump hop), and publish discrete state-change events that the
//! UI subscribes to. Persistence of the configuration records and all
//! rendering are external collaborators.
//!
//! - [`ssh::TransportFactory`] — authenticated sessions, jump-chained as
//!   configured.
//! - [`ssh::RemoteCommandRunner`] — one-shot remote commands with captured
//!   output and a hard timeout.
//! - [`service::ServiceManager`] / [`service::ServiceLifecycleController`] —
//!   remote process lifecycle: detached start, process-group stop, port/pid
//!   status probing, merged-log retrieval.
//! - [`tunnel::TunnelSupervisor`] — per-rule tunnel state machine with local
//!   listeners relaying concurrent connections and fixed-delay reconnect.
//! - [`events::StatusBroadcaster`] — fan-out of `ServiceStatusChange` /
//!   `TunnelStatusChange` events.

pub mod config;
pub mod error;
pub mod events;
pub mod service;
pub mod ssh;
pub mod tunnel;

pub use config::{AuthMethod, ConnectionDescriptor, ForwardRule, ServiceDescriptor};
pub use error::{GangwayError, Result};
pub use events::{ServiceStatusChange, StatusBroadcaster, StatusEvent, TunnelStatusChange};
pub use service::{
    ForwardState, ServiceLifecycleController, ServiceManager, ServiceRuntimeState, ServiceStatus,
};
pub use ssh::{CommandOutput, CommandRunner, RemoteCommandRunner, SessionPurpose, TransportFactory};
pub use tunnel::{TunnelState, TunnelStatus, TunnelSupervisor};
