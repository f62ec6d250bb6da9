//! Per-rule tunnel state machine with automatic reconnect.
//!
//! `stopped → starting → running → stopping → stopped`; `starting` and
//! `running` may fall to `error`, which schedules exactly one reconnect
//! attempt after a fixed delay unless the rule is stopped first.

use crate::config::{ConnectionDescriptor, ForwardRule};
use crate::error::Result;
use crate::events::{StatusBroadcaster, StatusEvent, TunnelStatusChange};
use crate::ssh::transport::{SessionPurpose, TransportFactory};
use crate::tunnel::relay;
use crate::tunnel::{TunnelState, TunnelStatus};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fixed delay before an automatic reconnect attempt. Not exponential, no
/// jitter.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Runtime record for one forward rule. Created lazily on first start,
/// removed when the rule is deleted.
struct RuleRuntime {
    host_id: String,
    /// Most recently supplied configuration, used on the next connect
    /// attempt even when it arrives while the rule is active.
    connection: ConnectionDescriptor,
    rule: ForwardRule,
    status: TunnelStatus,
    error: Option<String>,
    reconnect_at: Option<DateTime<Utc>>,
    /// Attempt generation. Every start/stop bumps it; in-flight work
    /// re-checks it before acting on completion, so a connect that finishes
    /// after a stop is discarded rather than promoted to running.
    epoch: u64,
    shutdown_tx: Option<oneshot::Sender<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl RuleRuntime {
    fn new(host_id: &str, connection: &ConnectionDescriptor, rule: &ForwardRule) -> Self {
        Self {
            host_id: host_id.to_string(),
            connection: connection.clone(),
            rule: rule.clone(),
            status: TunnelStatus::Stopped,
            error: None,
            reconnect_at: None,
            epoch: 0,
            shutdown_tx: None,
            reconnect_timer: None,
        }
    }

    fn state(&self) -> TunnelState {
        TunnelState {
            status: self.status,
            error: self.error.clone(),
            reconnect_at: self.reconnect_at,
        }
    }
}

struct Inner {
    factory: TransportFactory,
    events: StatusBroadcaster,
    reconnect_delay: Duration,
    rules: RwLock<HashMap<String, RuleRuntime>>,
}

/// Transition a rule and broadcast the change. Emits only on an actual
/// transition, never per call.
fn transition(
    inner: &Inner,
    entry: &mut RuleRuntime,
    status: TunnelStatus,
    error: Option<String>,
    reconnect_at: Option<DateTime<Utc>>,
) {
    if entry.status == status && entry.error == error && entry.reconnect_at == reconnect_at {
        return;
    }
    entry.status = status;
    entry.error = error;
    entry.reconnect_at = reconnect_at;
    inner.events.emit(StatusEvent::Tunnel(TunnelStatusChange {
        host_id: entry.host_id.clone(),
        forward_id: entry.rule.id.clone(),
        status: entry.status,
        error: entry.error.clone(),
        reconnect_at: entry.reconnect_at,
    }));
}

/// Keeps one live `{listener, session}` pair per forward rule and supervises
/// it through failures.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    pub fn new(factory: TransportFactory, events: StatusBroadcaster) -> Self {
        Self::with_reconnect_delay(factory, events, RECONNECT_DELAY)
    }

    pub fn with_reconnect_delay(
        factory: TransportFactory,
        events: StatusBroadcaster,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                events,
                reconnect_delay,
                rules: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Start (or re-arm) the tunnel for `rule`.
    ///
    /// The latest configuration is always stored. A rule that is already
    /// running or mid-start keeps its live attempt and returns immediately;
    /// a pending reconnect timer is cancelled and the attempt retried now
    /// with the new parameters. Start failures transition the rule to
    /// `error`, schedule the reconnect, and are also returned to the caller.
    pub async fn start(
        &self,
        host_id: &str,
        connection: &ConnectionDescriptor,
        rule: &ForwardRule,
    ) -> Result<()> {
        let rule_id = rule.id.clone();
        let epoch = {
            let mut rules = self.inner.rules.write().await;
            let entry = rules
                .entry(rule_id.clone())
                .or_insert_with(|| RuleRuntime::new(host_id, connection, rule));
            entry.host_id = host_id.to_string();
            entry.connection = connection.clone();
            entry.rule = rule.clone();

            match entry.status {
                TunnelStatus::Running | TunnelStatus::Starting => {
                    debug!(rule = %rule_id, "Tunnel already active; stored latest configuration");
                    return Ok(());
                }
                TunnelStatus::Stopped | TunnelStatus::Stopping | TunnelStatus::Error => {}
            }

            if let Some(timer) = entry.reconnect_timer.take() {
                timer.abort();
            }
            entry.epoch += 1;
            transition(&self.inner, entry, TunnelStatus::Starting, None, None);
            entry.epoch
        };

        Self::attempt(self.inner.clone(), rule_id, epoch).await
    }

    /// Explicit stop: cancels any pending reconnect, closes the listener and
    /// session, and settles on `stopped`. Unknown rules are ignored.
    pub async fn stop(&self, rule_id: &str) {
        let mut rules = self.inner.rules.write().await;
        let Some(entry) = rules.get_mut(rule_id) else {
            debug!(rule = rule_id, "Stop for unknown tunnel rule ignored");
            return;
        };

        if let Some(timer) = entry.reconnect_timer.take() {
            timer.abort();
        }
        entry.epoch += 1;

        if entry.status == TunnelStatus::Stopped {
            entry.error = None;
            entry.reconnect_at = None;
            return;
        }

        info!(rule = rule_id, "Stopping tunnel");
        transition(&self.inner, entry, TunnelStatus::Stopping, None, None);
        if let Some(tx) = entry.shutdown_tx.take() {
            let _ = tx.send(());
        }
        transition(&self.inner, entry, TunnelStatus::Stopped, None, None);
    }

    /// React to a deleted rule: stop it and drop its runtime entry.
    pub async fn remove(&self, rule_id: &str) {
        self.stop(rule_id).await;
        self.inner.rules.write().await.remove(rule_id);
    }

    pub async fn state(&self, rule_id: &str) -> Option<TunnelState> {
        self.inner.rules.read().await.get(rule_id).map(RuleRuntime::state)
    }

    /// Ids of rules currently relaying.
    pub async fn active_rules(&self) -> Vec<String> {
        self.inner
            .rules
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.status == TunnelStatus::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Reconcile a host's configured rules: tunnels whose rule was deleted
    /// are torn down, rules flagged auto-start are brought up. Individual
    /// start failures are logged (and retried by the state machine); they do
    /// not abort the sync.
    pub async fn sync_rules(
        &self,
        host_id: &str,
        connection: &ConnectionDescriptor,
        rules: &[ForwardRule],
    ) {
        let known: HashSet<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        let stale: Vec<String> = {
            let map = self.inner.rules.read().await;
            map.iter()
                .filter(|(id, e)| e.host_id == host_id && !known.contains(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in stale {
            info!(rule = %id, "Removing tunnel for deleted rule");
            self.remove(&id).await;
        }

        for rule in rules.iter().filter(|r| r.auto_start) {
            if let Err(e) = self.start(host_id, connection, rule).await {
                error!(rule = %rule.id, "Failed to start tunnel: {}", e);
            }
        }
    }

    /// Stop every tunnel. Runtime entries stay; rules can be started again.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.inner.rules.read().await.keys().cloned().collect();
        info!("Shutting down {} tunnel(s)", ids.len());
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// One start attempt: bind pre-check, session establishment, listener.
    /// Each stage fails distinctly; any failure is recorded via [`fail`] and
    /// returned.
    async fn attempt(inner: Arc<Inner>, rule_id: String, epoch: u64) -> Result<()> {
        let (connection, rule) = {
            let rules = inner.rules.read().await;
            match rules.get(&rule_id) {
                Some(entry) if entry.epoch == epoch => {
                    (entry.connection.clone(), entry.rule.clone())
                }
                // Superseded before the attempt began.
                _ => return Ok(()),
            }
        };
        let addr = rule.local_addr();

        // Stage 1: can the local address be bound at all? Released
        // immediately; the real listener comes after the session is up.
        if let Err(e) = relay::bind_local(&addr).await {
            Self::fail(&inner, &rule_id, epoch, e.to_string()).await;
            return Err(e);
        }

        // Stage 2: the SSH session, jump-chained as configured.
        let session = match inner
            .factory
            .connect(&connection, SessionPurpose::Tunnel)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                Self::fail(&inner, &rule_id, epoch, e.to_string()).await;
                return Err(e);
            }
        };

        // Stage 3: the listener, for real this time.
        let listener = match relay::bind_local(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                session.disconnect().await;
                Self::fail(&inner, &rule_id, epoch, e.to_string()).await;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let committed = {
            let mut rules = inner.rules.write().await;
            match rules.get_mut(&rule_id) {
                Some(entry) if entry.epoch == epoch => {
                    entry.shutdown_tx = Some(shutdown_tx);
                    transition(&inner, entry, TunnelStatus::Running, None, None);
                    true
                }
                _ => false,
            }
        };
        if !committed {
            // Stopped (or restarted) while connecting: never promote.
            drop(listener);
            session.disconnect().await;
            return Ok(());
        }

        info!(
            "Forwarding {} -> {}:{} for rule {}",
            addr, rule.remote_host, rule.remote_port, rule_id
        );

        let serve_inner = inner.clone();
        let serve_rule_id = rule_id.clone();
        tokio::spawn(async move {
            let failure = relay::serve(
                Arc::new(session),
                listener,
                rule.remote_host.clone(),
                rule.remote_port,
                shutdown_rx,
            )
            .await;
            if let Some(message) = failure {
                Self::fail(&serve_inner, &serve_rule_id, epoch, message).await;
            }
        });

        Ok(())
    }

    /// Record a failure for the attempt identified by `epoch` and schedule
    /// the single pending reconnect, superseding any earlier timer. Stale
    /// epochs (the rule was stopped or restarted meanwhile) are discarded.
    async fn fail(inner: &Arc<Inner>, rule_id: &str, epoch: u64, message: String) {
        let mut rules = inner.rules.write().await;
        let Some(entry) = rules.get_mut(rule_id) else {
            return;
        };
        if entry.epoch != epoch {
            return;
        }

        if let Some(tx) = entry.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(timer) = entry.reconnect_timer.take() {
            timer.abort();
        }

        let delay = inner.reconnect_delay;
        let reconnect_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        warn!(rule = rule_id, "Tunnel failed: {}", message);
        transition(
            inner,
            entry,
            TunnelStatus::Error,
            Some(message),
            Some(reconnect_at),
        );

        let timer_inner = inner.clone();
        let timer_rule_id = rule_id.to_string();
        entry.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::retry(timer_inner, timer_rule_id, epoch).await;
        }));
    }

    /// Fired by the reconnect timer: re-enter `starting` with the latest
    /// stored configuration.
    ///
    /// Returns a boxed future to break the recursive `attempt → fail →
    /// retry → attempt` cycle; without it the compiler cannot resolve the
    /// `Send`-ness of the mutually referential opaque future types.
    fn retry(
        inner: Arc<Inner>,
        rule_id: String,
        epoch: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let next_epoch = {
                let mut rules = inner.rules.write().await;
                let Some(entry) = rules.get_mut(&rule_id) else {
                    return;
                };
                if entry.epoch != epoch || entry.status != TunnelStatus::Error {
                    return;
                }
                entry.reconnect_timer = None;
                entry.epoch += 1;
                transition(&inner, entry, TunnelStatus::Starting, None, None);
                entry.epoch
            };

            debug!(rule = %rule_id, "Attempting tunnel reconnect");
            // A failed retry records its own error and schedules the next timer.
            let _ = Self::attempt(inner, rule_id, next_epoch).await;
        })
    }
}
