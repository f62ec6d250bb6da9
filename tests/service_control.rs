//! Service lifecycle tests against a scripted command runner.
//!
//! The mock captures every command line sent over the (pretend) SSH session
//! and plays back queued responses, so the exact remote shell behavior is
//! asserted without a live host.

use async_trait::async_trait;
use gangway::service::{ServiceLifecycleController, StatusProbe};
use gangway::{
    AuthMethod, CommandOutput, CommandRunner, ConnectionDescriptor, ForwardRule, ForwardState,
    GangwayError, ServiceDescriptor, ServiceManager, ServiceStatus, StatusBroadcaster,
    StatusEvent, TransportFactory, TunnelSupervisor,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

#[derive(Clone, Default)]
struct MockRunner {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    calls: Mutex<Vec<String>>,
    responses: Mutex<VecDeque<gangway::Result<CommandOutput>>>,
}

impl MockRunner {
    fn scripted(responses: Vec<gangway::Result<CommandOutput>>) -> Self {
        let mock = Self::default();
        *mock.inner.responses.lock().unwrap() = responses.into();
        mock
    }

    fn push(&self, response: gangway::Result<CommandOutput>) {
        self.inner.responses.lock().unwrap().push_back(response);
    }

    fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn exec(
        &self,
        _target: &ConnectionDescriptor,
        command: &str,
    ) -> gangway::Result<CommandOutput> {
        self.inner.calls.lock().unwrap().push(command.to_string());
        self.inner
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }
}

fn ok(stdout: &str) -> gangway::Result<CommandOutput> {
    Ok(CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    })
}

fn failed(exit_code: u32, stderr: &str) -> gangway::Result<CommandOutput> {
    Err(GangwayError::CommandFailed {
        output: CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code,
        },
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn conn() -> ConnectionDescriptor {
    init_tracing();
    ConnectionDescriptor {
        host: "db.internal".to_string(),
        port: 22,
        username: "ops".to_string(),
        auth: AuthMethod::Password {
            password: "pw".to_string(),
        },
        jump: None,
    }
}

fn service(pid: Option<u32>, exposed_port: u16) -> ServiceDescriptor {
    ServiceDescriptor {
        id: "svc-1".to_string(),
        name: "api".to_string(),
        start_command: "./run.sh".to_string(),
        exposed_port,
        forward_local_port: None,
        pid,
        log_path: pid.map(|_| "/tmp/gangway-logs/db_internal_api.log".to_string()),
    }
}

fn ss_with(port: u16, pid: u32) -> String {
    format!(
        "State   Recv-Q  Send-Q  Local Address:Port   Peer Address:Port Process\n\
         LISTEN  0       128     0.0.0.0:{port}            0.0.0.0:*         users:((\"api\",pid={pid},fd=5))\n"
    )
}

async fn recv_service(
    rx: &mut broadcast::Receiver<StatusEvent>,
) -> gangway::ServiceStatusChange {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for service event")
            .expect("event channel closed");
        if let StatusEvent::Service(change) = event {
            return change;
        }
    }
}

fn manager(runner: MockRunner) -> (ServiceManager<MockRunner>, broadcast::Receiver<StatusEvent>) {
    let events = StatusBroadcaster::new();
    let rx = events.subscribe();
    let tunnels = TunnelSupervisor::new(TransportFactory::new(), events.clone());
    (ServiceManager::new(runner, tunnels, events), rx)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_captures_pid_and_log_path_without_waiting() {
    let runner = MockRunner::scripted(vec![ok("GANGWAY_PID=4242\n")]);
    let controller = ServiceLifecycleController::new(runner.clone());

    let outcome = controller
        .start(&conn(), "db.internal", &service(None, 8080))
        .await
        .unwrap();
    assert_eq!(outcome.pid, 4242);
    assert_eq!(outcome.log_path, "/tmp/gangway-logs/db_internal_api.log");

    let calls = runner.calls();
    assert_eq!(calls.len(), 1, "start is a single command, no warm-up polling");
    assert!(calls[0].contains("setsid sh -c './run.sh'"));
    assert!(calls[0].contains(">> '/tmp/gangway-logs/db_internal_api.log' 2>&1"));
    assert!(calls[0].contains("GANGWAY_PID=$!"));
}

#[tokio::test]
async fn start_without_sentinel_fails_with_captured_streams() {
    let runner = MockRunner::scripted(vec![ok("mkdir: whatever\n")]);
    let controller = ServiceLifecycleController::new(runner);

    let err = controller
        .start(&conn(), "db.internal", &service(None, 8080))
        .await
        .unwrap_err();
    assert!(matches!(err, GangwayError::Protocol(_)));
    assert!(err.to_string().contains("mkdir: whatever"));
}

#[tokio::test]
async fn stop_without_pid_fails_immediately() {
    let runner = MockRunner::default();
    let controller = ServiceLifecycleController::new(runner.clone());

    let err = controller.stop(&conn(), None).await.unwrap_err();
    assert_eq!(err.to_string(), "PID is empty; cannot stop service.");
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn stop_signals_process_group_with_pid_fallback() {
    let runner = MockRunner::scripted(vec![ok("")]);
    let controller = ServiceLifecycleController::new(runner.clone());

    controller.stop(&conn(), Some(1234)).await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("ps -o pgid= -p 1234"));
    assert!(calls[0].contains("kill -TERM -- \"-$pgid\""));
    assert!(calls[0].contains("else kill -TERM 1234"));
}

#[tokio::test]
async fn stop_failure_reports_remote_stderr() {
    let runner = MockRunner::scripted(vec![failed(1, "kill: permission denied")]);
    let controller = ServiceLifecycleController::new(runner);

    let err = controller.stop(&conn(), Some(1234)).await.unwrap_err();
    assert!(err.to_string().contains("permission denied"), "{err}");
}

#[tokio::test]
async fn status_listener_pid_is_authoritative() {
    let runner = MockRunner::scripted(vec![ok(&ss_with(8080, 5678))]);
    let controller = ServiceLifecycleController::new(runner.clone());

    let probe = controller
        .status(&conn(), &service(Some(1111), 8080))
        .await
        .unwrap();
    assert_eq!(probe, StatusProbe::Listening { pid: 5678 });
    // The port probe settled it; no liveness check follows.
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn status_falls_back_to_liveness_probe() {
    let runner = MockRunner::scripted(vec![ok(&ss_with(9999, 42)), ok("")]);
    let controller = ServiceLifecycleController::new(runner.clone());

    let probe = controller
        .status(&conn(), &service(Some(1111), 8080))
        .await
        .unwrap();
    assert_eq!(probe, StatusProbe::Alive { pid: 1111 });
    assert_eq!(runner.calls()[1], "kill -0 1111");
}

#[tokio::test]
async fn status_without_listener_or_pid_is_stopped() {
    let runner = MockRunner::scripted(vec![ok(&ss_with(9999, 42))]);
    let controller = ServiceLifecycleController::new(runner.clone());

    let probe = controller
        .status(&conn(), &service(None, 8080))
        .await
        .unwrap();
    assert_eq!(probe, StatusProbe::Stopped);
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn no_such_process_means_stopped_not_error() {
    let runner = MockRunner::scripted(vec![
        ok(&ss_with(9999, 42)),
        failed(1, "kill: (1111) - No such process"),
    ]);
    let controller = ServiceLifecycleController::new(runner);

    let probe = controller
        .status(&conn(), &service(Some(1111), 8080))
        .await
        .unwrap();
    assert_eq!(probe, StatusProbe::Stopped);
}

#[tokio::test]
async fn other_liveness_failures_are_errors() {
    let runner = MockRunner::scripted(vec![
        ok(&ss_with(9999, 42)),
        failed(1, "kill: permission denied"),
    ]);
    let controller = ServiceLifecycleController::new(runner);

    let err = controller
        .status(&conn(), &service(Some(1111), 8080))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("permission denied"));
}

#[tokio::test]
async fn logs_before_any_start_are_empty() {
    let runner = MockRunner::default();
    let controller = ServiceLifecycleController::new(runner.clone());

    let logs = controller
        .logs(&conn(), &service(None, 8080))
        .await
        .unwrap();
    assert_eq!(logs.stdout, "");
    assert_eq!(logs.stderr, "");
    assert!(runner.calls().is_empty(), "no remote command issued");
}

#[tokio::test]
async fn logs_tail_the_merged_file_as_stdout() {
    let runner = MockRunner::scripted(vec![ok("line1\nerr-line2\nline3\n")]);
    let controller = ServiceLifecycleController::new(runner.clone());

    let logs = controller
        .logs(&conn(), &service(Some(4242), 8080))
        .await
        .unwrap();
    // Merged stream: everything is the stdout half, in emission order.
    assert_eq!(logs.stdout, "line1\nerr-line2\nline3\n");
    assert_eq!(logs.stderr, "");
    assert!(runner.calls()[0].starts_with("tail -n 200 "));
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refresh_adopts_pid_discovered_on_the_exposed_port() {
    let runner = MockRunner::scripted(vec![ok(&ss_with(8080, 5678))]);
    let (manager, mut rx) = manager(runner);

    let state = manager
        .refresh_service("host-1", &conn(), &service(Some(1111), 8080))
        .await
        .unwrap();
    assert_eq!(state.status, ServiceStatus::Running);
    assert_eq!(state.pid, Some(5678), "stored pid replaced by discovered pid");

    let event = recv_service(&mut rx).await;
    assert_eq!(event.status, ServiceStatus::Running);
    assert_eq!(event.pid, Some(5678));
    assert!(event.updated_at.is_some());
}

#[tokio::test]
async fn refresh_emits_only_on_actual_transitions() {
    let runner = MockRunner::scripted(vec![ok(&ss_with(8080, 5678)), ok(&ss_with(8080, 5678))]);
    let (manager, mut rx) = manager(runner);
    let svc = service(Some(1111), 8080);

    manager.refresh_service("host-1", &conn(), &svc).await.unwrap();
    let event = recv_service(&mut rx).await;
    assert_eq!(event.status, ServiceStatus::Running);

    // Same observation again: no event.
    manager.refresh_service("host-1", &conn(), &svc).await.unwrap();
    assert!(matches!(
        rx.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn service_without_port_runs_as_soon_as_its_pid_is_alive() {
    let runner = MockRunner::scripted(vec![ok("GANGWAY_PID=4242\n"), ok("")]);
    let (manager, mut rx) = manager(runner.clone());

    // `sleep 5`-style service: no exposed port, start succeeds immediately.
    let svc = ServiceDescriptor {
        start_command: "sleep 5".to_string(),
        ..service(None, 0)
    };
    let outcome = manager
        .start_service("host-1", &conn(), "db.internal", &svc)
        .await
        .unwrap();
    assert_eq!(outcome.pid, 4242);

    assert_eq!(recv_service(&mut rx).await.status, ServiceStatus::Starting);
    let armed = recv_service(&mut rx).await;
    assert_eq!(armed.status, ServiceStatus::Starting);
    assert_eq!(armed.pid, Some(4242));

    // Refresh: no port to probe, pid alive -> running right away.
    let refreshed = ServiceDescriptor {
        pid: Some(4242),
        log_path: Some(outcome.log_path),
        ..svc
    };
    let state = manager
        .refresh_service("host-1", &conn(), &refreshed)
        .await
        .unwrap();
    assert_eq!(state.status, ServiceStatus::Running);
    assert_eq!(runner.calls()[1], "kill -0 4242");
}

#[tokio::test]
async fn starting_window_holds_until_the_port_is_bound() {
    let runner = MockRunner::scripted(vec![ok("GANGWAY_PID=7\n")]);
    let (manager, mut rx) = manager(runner.clone());
    let svc = service(None, 8080);

    manager
        .start_service("host-1", &conn(), "db.internal", &svc)
        .await
        .unwrap();
    assert_eq!(recv_service(&mut rx).await.status, ServiceStatus::Starting);
    assert_eq!(recv_service(&mut rx).await.status, ServiceStatus::Starting);

    let started = ServiceDescriptor {
        pid: Some(7),
        ..svc
    };

    // Process alive but the exposed port is not bound yet: still starting.
    runner.push(ok(&ss_with(9999, 42)));
    runner.push(ok(""));
    let state = manager
        .refresh_service("host-1", &conn(), &started)
        .await
        .unwrap();
    assert_eq!(state.status, ServiceStatus::Starting);

    // Port bound now: running.
    runner.push(ok(&ss_with(8080, 7)));
    let state = manager
        .refresh_service("host-1", &conn(), &started)
        .await
        .unwrap();
    assert_eq!(state.status, ServiceStatus::Running);
    let event = recv_service(&mut rx).await;
    assert_eq!(event.status, ServiceStatus::Running);
    assert_eq!(event.pid, Some(7));
}

#[tokio::test]
async fn stop_service_walks_stopping_then_stopped() {
    let runner = MockRunner::scripted(vec![ok("")]);
    let (manager, mut rx) = manager(runner);

    manager
        .stop_service("host-1", &conn(), &service(Some(4242), 8080))
        .await
        .unwrap();

    assert_eq!(recv_service(&mut rx).await.status, ServiceStatus::Stopping);
    let stopped = recv_service(&mut rx).await;
    assert_eq!(stopped.status, ServiceStatus::Stopped);
    assert_eq!(stopped.pid, None);
}

#[tokio::test]
async fn stop_service_without_pid_surfaces_the_error() {
    let runner = MockRunner::default();
    let (manager, mut rx) = manager(runner);

    let err = manager
        .stop_service("host-1", &conn(), &service(None, 8080))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "PID is empty; cannot stop service.");

    assert_eq!(recv_service(&mut rx).await.status, ServiceStatus::Stopping);
    let errored = recv_service(&mut rx).await;
    assert_eq!(errored.status, ServiceStatus::Error);
    assert!(errored.error.unwrap().contains("PID is empty"));
}

#[tokio::test]
async fn forward_state_is_none_without_a_forward_port() {
    let runner = MockRunner::scripted(vec![ok(&ss_with(8080, 5678))]);
    let (manager, _rx) = manager(runner);

    let state = manager
        .refresh_service("host-1", &conn(), &service(Some(5678), 8080))
        .await
        .unwrap();
    assert_eq!(state.forward_state, ForwardState::None);
    assert!(state.forward_error.is_none());
}

#[tokio::test]
async fn forward_failure_is_tracked_independently_of_process_health() {
    // Occupy the local forward port so the tunnel lands in error.
    let guard = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = guard.local_addr().unwrap().port();

    let events = StatusBroadcaster::new();
    let tunnels = TunnelSupervisor::with_reconnect_delay(
        TransportFactory::new(),
        events.clone(),
        Duration::from_secs(60),
    );
    let runner = MockRunner::default();
    let manager = ServiceManager::new(runner, tunnels.clone(), events);

    let svc = ServiceDescriptor {
        forward_local_port: Some(local_port),
        ..service(None, 0)
    };
    let rule: ForwardRule = svc.forward_rule().unwrap();
    let _ = tunnels.start("host-1", &conn(), &rule).await;

    // Process side: nothing to probe (no port, no pid) -> stopped. Forward
    // side carries its own failure.
    let state = manager.refresh_service("host-1", &conn(), &svc).await.unwrap();
    assert_eq!(state.status, ServiceStatus::Stopped);
    assert_eq!(state.forward_state, ForwardState::Error);
    assert!(state.forward_error.unwrap().contains("already in use"));

    tunnels.stop(&rule.id).await;
}
