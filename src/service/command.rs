//! Shell command construction and output parsing for remote service control.
//!
//! Everything here is pure string work so the exact commands sent over SSH
//! can be asserted in tests.

/// Directory on the remote host holding merged service logs.
pub const LOG_DIR: &str = "/tmp/gangway-logs";

/// Trailing lines returned by a log fetch.
pub const LOG_TAIL_LINES: usize = 200;

/// Marker prefixing the echoed pid of a freshly started service.
pub const PID_SENTINEL: &str = "GANGWAY_PID=";

/// Single-quote `s` for safe embedding in a shell command line.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Deterministic merged-log path for a service on a host.
pub fn merged_log_path(host_name: &str, service_name: &str) -> String {
    format!("{LOG_DIR}/{}_{}.log", sanitize(host_name), sanitize(service_name))
}

/// Build the one-shot start command: ensure the log directory, truncate the
/// merged log, detach the user's command into a new session (so it survives
/// the SSH session ending) with stdout and stderr sharing one file in
/// emission order, and echo the backgrounded pid behind the sentinel.
pub fn start_command(user_command: &str, log_path: &str) -> String {
    format!(
        "mkdir -p {dir} && : > {log}; setsid sh -c {cmd} >> {log} 2>&1 < /dev/null & echo \"{sentinel}$!\"",
        dir = shell_quote(LOG_DIR),
        log = shell_quote(log_path),
        cmd = shell_quote(user_command),
        sentinel = PID_SENTINEL,
    )
}

/// Extract the pid echoed by [`start_command`] from captured stdout.
pub fn parse_start_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(PID_SENTINEL))
        .and_then(|pid| pid.trim().parse().ok())
}

/// SIGTERM the whole process group of `pid`; fall back to the pid itself
/// when group resolution yields nothing.
pub fn stop_command(pid: u32) -> String {
    format!(
        "pgid=$(ps -o pgid= -p {pid} 2>/dev/null | tr -d ' '); \
         if [ -n \"$pgid\" ]; then kill -TERM -- \"-$pgid\"; else kill -TERM {pid}; fi"
    )
}

/// Liveness probe: exit 0 when the process exists, "No such process" on
/// stderr when it is gone.
pub fn liveness_command(pid: u32) -> String {
    format!("kill -0 {pid}")
}

/// List listening TCP sockets with owning pids. `ss` first, `netstat` as the
/// fallback for hosts without iproute2.
pub fn listeners_command() -> &'static str {
    "ss -ltnp 2>/dev/null || netstat -ltnp 2>/dev/null"
}

/// Tail the merged log. `|| true` keeps a missing file from reading as a
/// command failure.
pub fn tail_command(log_path: &str, lines: usize) -> String {
    format!("tail -n {lines} {} 2>/dev/null || true", shell_quote(log_path))
}

pub fn is_no_such_process(stderr: &str) -> bool {
    stderr.to_lowercase().contains("no such process")
}

fn parse_port(token: &str) -> Option<u16> {
    // 0.0.0.0:22, [::]:80, :::8080, *:22
    let idx = token.rfind(':')?;
    token[idx + 1..].parse().ok()
}

fn extract_pid(line: &str) -> Option<u32> {
    // ss format: users:(("sshd",pid=1234,fd=3))
    if let Some(start) = line.find("pid=") {
        let rest = &line[start + 4..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if end > 0 {
            return rest[..end].parse().ok();
        }
    }

    // netstat format: 1234/sshd
    for part in line.split_whitespace().rev() {
        if let Some((pid, _name)) = part.split_once('/') {
            if let Ok(pid) = pid.parse() {
                return Some(pid);
            }
        }
    }

    None
}

/// Find the pid listening on `port` in `ss -ltnp` or `netstat -ltnp` output.
///
/// Returns `None` when no listener is found or the pid column is unreadable
/// (e.g. the socket belongs to another user); callers treat that as an
/// inconclusive probe.
pub fn find_listener_pid(output: &str, port: u16) -> Option<u32> {
    for line in output.lines() {
        if !line.contains("LISTEN") {
            continue;
        }
        // Local address is column 3 in both formats:
        //   ss:      State Recv-Q Send-Q Local:Port Peer:Port Process
        //   netstat: Proto Recv-Q Send-Q Local      Foreign   State PID/Prog
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(local) = parts.get(3) else { continue };
        if parse_port(local) != Some(port) {
            continue;
        }
        if let Some(pid) = extract_pid(line) {
            return Some(pid);
        }
    }
    None
}
