//! Local listener and per-connection relaying for one active tunnel.

use crate::error::{GangwayError, Result};
use crate::ssh::transport::SshSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// How often a running tunnel probes its SSH session for silent death.
const SESSION_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Message reported when an established session drops out from under a
/// running tunnel.
pub(crate) const SESSION_CLOSED_MSG: &str = "SSH connection closed unexpectedly.";

/// Classify a local bind failure for `addr`.
pub(crate) fn classify_bind_error(addr: &str, err: std::io::Error) -> GangwayError {
    match err.kind() {
        std::io::ErrorKind::AddrInUse => GangwayError::BindInUse {
            addr: addr.to_string(),
        },
        std::io::ErrorKind::PermissionDenied => GangwayError::BindPermission {
            addr: addr.to_string(),
        },
        _ => GangwayError::Bind {
            addr: addr.to_string(),
            reason: err.to_string(),
        },
    }
}

/// Bind `addr`, mapping failures to the classified bind errors.
pub(crate) async fn bind_local(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| classify_bind_error(addr, e))
}

/// Accept loop for one running tunnel.
///
/// Runs until the explicit shutdown signal fires (returns `None`), the local
/// listener errors, or the SSH session dies (returns the failure message).
/// Each accepted client connection is relayed by an independent task; a
/// failure there destroys only that connection.
pub(crate) async fn serve(
    session: Arc<SshSession>,
    listener: TcpListener,
    remote_host: String,
    remote_port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Option<String> {
    let mut probe = tokio::time::interval(SESSION_PROBE_INTERVAL);

    let failure = loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let session = session.clone();
                        let remote_host = remote_host.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                relay_connection(session, stream, &remote_host, remote_port).await
                            {
                                debug!("Relayed connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        break Some(format!("local listener failed: {e}"));
                    }
                }
            }

            _ = probe.tick() => {
                if session.is_closed() {
                    break Some(SESSION_CLOSED_MSG.to_string());
                }
            }

            _ = &mut shutdown_rx => {
                debug!("Tunnel shutting down");
                break None;
            }
        }
    };

    drop(listener);
    session.disconnect().await;
    failure
}

/// Relay one client connection over a fresh forward-out channel.
async fn relay_connection(
    session: Arc<SshSession>,
    mut stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
) -> Result<()> {
    let channel = session.open_forward_channel(remote_host, remote_port).await?;
    let mut channel_stream = channel.into_stream();

    let (from_client, from_remote) = copy_bidirectional(&mut stream, &mut channel_stream)
        .await
        .map_err(|e| GangwayError::Protocol(format!("relay failed: {e}")))?;
    debug!(
        "Relayed connection closed ({} bytes out, {} bytes in)",
        from_client, from_remote
    );
    Ok(())
}
