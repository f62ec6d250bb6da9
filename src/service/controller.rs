use crate::config::{ConnectionDescriptor, ServiceDescriptor};
use crate::error::{GangwayError, Result};
use crate::service::command;
use crate::ssh::exec::CommandRunner;
use tracing::{debug, info};

/// What a successful start hands back for the persistence layer to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub pid: u32,
    pub log_path: String,
}

/// Ground-truth observation from a status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusProbe {
    /// A process is listening on the exposed port; its pid is authoritative,
    /// which correctly tracks processes respawned under a supervisor with a
    /// new pid.
    Listening { pid: u32 },
    /// The recorded pid is alive, but the exposed port gave no confirmation.
    Alive { pid: u32 },
    Stopped,
}

/// Merged log content. stderr is always empty: both streams share one remote
/// file, so everything comes back as the stdout half in true emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceLogs {
    pub stdout: String,
    pub stderr: String,
}

/// Remote process lifecycle: start, stop-by-process-group, status probing and
/// log retrieval. Stateless — every answer is recomputed from remote ground
/// truth; transition bookkeeping is the manager's job.
pub struct ServiceLifecycleController<R> {
    runner: R,
}

impl<R: CommandRunner> ServiceLifecycleController<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Start the service detached and capture its pid.
    ///
    /// Returns as soon as the pid is captured; it never waits for the process
    /// to bind its port. Port-based confirmation happens later, via refresh.
    pub async fn start(
        &self,
        conn: &ConnectionDescriptor,
        host_name: &str,
        service: &ServiceDescriptor,
    ) -> Result<StartOutcome> {
        let log_path = command::merged_log_path(host_name, &service.name);
        let cmd = command::start_command(&service.start_command, &log_path);

        let output = self.runner.exec(conn, &cmd).await?;

        let pid = command::parse_start_pid(&output.stdout).ok_or_else(|| {
            GangwayError::Protocol(format!(
                "could not parse service pid from start output (stdout: {:?}, stderr: {:?})",
                output.stdout.trim(),
                output.stderr.trim()
            ))
        })?;

        info!(service = %service.name, pid, log = %log_path, "Service started");
        Ok(StartOutcome { pid, log_path })
    }

    /// SIGTERM the process group of `pid`, falling back to the pid itself.
    pub async fn stop(&self, conn: &ConnectionDescriptor, pid: Option<u32>) -> Result<()> {
        let pid = pid.ok_or(GangwayError::MissingPid)?;

        match self.runner.exec(conn, &command::stop_command(pid)).await {
            Ok(_) => {
                info!(pid, "Service process group signalled");
                Ok(())
            }
            Err(GangwayError::CommandFailed { output }) => {
                if command::is_no_such_process(&output.stderr) {
                    Err(GangwayError::ProcessNotFound(pid))
                } else {
                    Err(GangwayError::RemoteExec(format!(
                        "failed to signal pid {pid}: {}",
                        output.stderr.trim()
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Probe remote ground truth: exposed port first, recorded pid second.
    pub async fn status(
        &self,
        conn: &ConnectionDescriptor,
        service: &ServiceDescriptor,
    ) -> Result<StatusProbe> {
        if service.exposed_port != 0 {
            match self.runner.exec(conn, command::listeners_command()).await {
                Ok(output) => {
                    if let Some(pid) = command::find_listener_pid(&output.stdout, service.exposed_port)
                    {
                        return Ok(StatusProbe::Listening { pid });
                    }
                }
                // Scan tooling missing or unusable: inconclusive, fall back
                // to the pid probe.
                Err(GangwayError::CommandFailed { output }) => {
                    debug!(
                        service = %service.name,
                        "Port scan unavailable: {}",
                        output.stderr.trim()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let Some(pid) = service.pid else {
            return Ok(StatusProbe::Stopped);
        };

        match self.runner.exec(conn, &command::liveness_command(pid)).await {
            Ok(_) => Ok(StatusProbe::Alive { pid }),
            Err(GangwayError::CommandFailed { output })
                if command::is_no_such_process(&output.stderr) =>
            {
                // The normal "stopped" signal, not an error condition.
                Ok(StatusProbe::Stopped)
            }
            Err(GangwayError::CommandFailed { output }) => Err(GangwayError::RemoteExec(format!(
                "liveness probe for pid {pid} failed: {}",
                output.stderr.trim()
            ))),
            Err(e) => Err(e),
        }
    }

    /// Tail the merged log. Before any start (no log path or no pid) this is
    /// empty output, not an error.
    pub async fn logs(
        &self,
        conn: &ConnectionDescriptor,
        service: &ServiceDescriptor,
    ) -> Result<ServiceLogs> {
        let (Some(log_path), Some(_pid)) = (&service.log_path, service.pid) else {
            return Ok(ServiceLogs::default());
        };

        let output = self
            .runner
            .exec(conn, &command::tail_command(log_path, command::LOG_TAIL_LINES))
            .await?;

        Ok(ServiceLogs {
            stdout: output.stdout,
            stderr: String::new(),
        })
    }
}
