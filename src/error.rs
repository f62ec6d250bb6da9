use crate::ssh::exec::CommandOutput;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GangwayError {
    #[error("SSH authentication failed for {user}@{host}: {reason}")]
    Auth {
        host: String,
        user: String,
        reason: String,
    },

    #[error("SSH connection to {host}:{port} failed: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Local address {addr} is already in use")]
    BindInUse { addr: String },

    #[error("Permission denied binding local address {addr}")]
    BindPermission { addr: String },

    #[error("Failed to bind local address {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Remote command setup failed: {0}")]
    RemoteExec(String),

    #[error("Remote command exited with status {}: {}", output.exit_code, output.stderr.trim())]
    CommandFailed { output: CommandOutput },

    #[error("Remote command timed out after {seconds}s")]
    CommandTimeout { seconds: u64, output: CommandOutput },

    #[error("No such process: {0}")]
    ProcessNotFound(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("PID is empty; cannot stop service.")]
    MissingPid,
}

pub type Result<T> = std::result::Result<T, GangwayError>;
