use crate::config::ConnectionDescriptor;
use crate::error::{GangwayError, Result};
use crate::ssh::transport::{SessionPurpose, TransportFactory};
use async_trait::async_trait;
use russh::ChannelMsg;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Hard wall-clock limit for one remote command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One-shot remote command execution.
///
/// The service layer is generic over this trait so its shell-command logic
/// can be exercised against a scripted mock.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` on the host described by `target`.
    ///
    /// `Ok` means the command ran and exited 0. A nonzero exit comes back as
    /// [`GangwayError::CommandFailed`] with the captured streams attached; a
    /// blown wall clock as [`GangwayError::CommandTimeout`] with whatever
    /// partial output was collected.
    async fn exec(&self, target: &ConnectionDescriptor, command: &str) -> Result<CommandOutput>;
}

/// Runs commands over a freshly established SSH session per call.
///
/// No session pooling: each invocation authenticates, opens one command
/// channel, and tears the session down again.
#[derive(Clone)]
pub struct RemoteCommandRunner {
    factory: TransportFactory,
    timeout: Duration,
}

impl RemoteCommandRunner {
    pub fn new(factory: TransportFactory) -> Self {
        Self {
            factory,
            timeout: COMMAND_TIMEOUT,
        }
    }
}

#[async_trait]
impl CommandRunner for RemoteCommandRunner {
    async fn exec(&self, target: &ConnectionDescriptor, command: &str) -> Result<CommandOutput> {
        let session = self.factory.connect(target, SessionPurpose::Exec).await?;

        let mut channel = session.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| GangwayError::RemoteExec(format!("failed to exec command: {e}")))?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut exit_code: Option<u32> = None;

        let collected = timeout(self.timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    None => break,
                    // Eof and ExitStatus can arrive in either order; keep
                    // draining until the channel fully closes.
                    _ => {}
                }
            }
        })
        .await;

        session.disconnect().await;

        let mut output = CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.unwrap_or(0),
        };

        match collected {
            Ok(()) => {
                debug!(
                    exit_code = output.exit_code,
                    "Remote command finished: {}", command
                );
                if output.success() {
                    Ok(output)
                } else {
                    Err(GangwayError::CommandFailed { output })
                }
            }
            Err(_) => {
                let seconds = self.timeout.as_secs();
                if !output.stderr.is_empty() && !output.stderr.ends_with('\n') {
                    output.stderr.push('\n');
                }
                output.stderr.push_str(&format!("[timeout after {seconds}s]"));
                Err(GangwayError::CommandTimeout { seconds, output })
            }
        }
    }
}
