//! Configuration records supplied by the persistence collaborator.
//!
//! These are read-only inputs to the core: creating, editing and deleting
//! them is the configuration layer's job. The core only reacts to
//! start/stop/refresh/delete signals referencing them by id.

use serde::{Deserialize, Serialize};

/// How to reach and authenticate against one SSH endpoint.
///
/// Supplied fresh on every connection attempt; never cached by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    /// At most one jump hop is honored; a jump descriptor nested inside a
    /// jump descriptor is ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump: Option<Box<ConnectionDescriptor>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuthMethod {
    Key {
        /// Inline PEM material or a filesystem path (tilde-expanded).
        #[serde(rename = "privateKey")]
        private_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    Password { password: String },
}

/// One configured local-port-to-remote-host:port relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRule {
    /// Stable id, unique within the owning host.
    pub id: String,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub auto_start: bool,
}

impl ForwardRule {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// One managed remote process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub id: String,
    pub name: String,
    pub start_command: String,
    /// Port the service is expected to listen on remotely; 0 when the
    /// service exposes no port.
    pub exposed_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_local_port: Option<u16>,
    /// Last captured pid. A hint only: authoritative liveness comes from
    /// probing the exposed port, then `kill -0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Merged stdout/stderr log file on the remote host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl ServiceDescriptor {
    /// The forward rule implied by `forward_local_port`, registered under the
    /// service's own id so forwarding health can be looked up independently
    /// of process health.
    pub fn forward_rule(&self) -> Option<ForwardRule> {
        let local_port = self.forward_local_port?;
        Some(ForwardRule {
            id: self.id.clone(),
            local_host: "127.0.0.1".to_string(),
            local_port,
            remote_host: "127.0.0.1".to_string(),
            remote_port: self.exposed_port,
            auto_start: false,
        })
    }
}
