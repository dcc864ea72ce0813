use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::k8s::{AppResources, ClusterApi, Outcome};
use crate::message::Message;

/// Lifecycle of one unidle run. A terminal status stays readable until the
/// next run claims the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

/// How traffic is routed away from the idling proxy. Which one applies
/// depends on the mechanism that idled the app in the first place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectStrategy {
    /// Remove the host's rule from the shared unidler Ingress.
    UnidlerIngressRule,
    /// Re-point the app's Service from the ExternalName alias back to
    /// cluster-local selection.
    ServiceExternalName,
}

impl RedirectStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ingress" => Some(RedirectStrategy::UnidlerIngressRule),
            "service" => Some(RedirectStrategy::ServiceExternalName),
            _ => None,
        }
    }
}

/// In-flight runs, keyed by host. Claiming a host is atomic, so concurrent
/// requests for the same host start exactly one mutation sequence.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, RunStatus>>>,
}

impl RunRegistry {
    /// Claims `host` for a new run. Returns `None` if one is in flight; a
    /// finished run's entry is replaced.
    fn begin(&self, host: &str) -> Option<RunGuard> {
        let mut runs = self.runs.lock().expect("run registry lock poisoned");
        if runs.get(host).is_some_and(|s| !s.is_terminal()) {
            return None;
        }
        runs.insert(host.to_string(), RunStatus::Pending);
        Some(RunGuard {
            registry: self.clone(),
            host: host.to_string(),
            armed: true,
        })
    }

    pub fn status(&self, host: &str) -> Option<RunStatus> {
        self.runs
            .lock()
            .expect("run registry lock poisoned")
            .get(host)
            .copied()
    }

    fn set(&self, host: &str, status: RunStatus) {
        if let Some(entry) = self
            .runs
            .lock()
            .expect("run registry lock poisoned")
            .get_mut(host)
        {
            *entry = status;
        }
    }

    fn remove(&self, host: &str) {
        self.runs
            .lock()
            .expect("run registry lock poisoned")
            .remove(host);
    }
}

/// Releases the host claim when the run ends, on any path out of the task.
struct RunGuard {
    registry: RunRegistry,
    host: String,
    armed: bool,
}

impl RunGuard {
    /// Records the terminal status, releasing the claim: a terminal entry is
    /// claimable by the next `begin` while staying readable until then.
    fn complete(mut self, status: RunStatus) {
        self.registry.set(&self.host, status);
        self.armed = false;
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        // Only reached without `complete` if the run task died mid-flight.
        if self.armed {
            self.registry.remove(&self.host);
        }
    }
}

/// Drives the ordered, fail-fast, idempotent unidle steps for one host and
/// projects progress onto the broker.
pub struct Unidler {
    cluster: Arc<dyn ClusterApi>,
    broker: Broker,
    registry: RunRegistry,
    ingress_class: String,
    strategy: RedirectStrategy,
    wait_timeout: Duration,
}

impl Unidler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        broker: Broker,
        ingress_class: &str,
        strategy: RedirectStrategy,
        wait_timeout: Duration,
    ) -> Self {
        Unidler {
            cluster,
            broker,
            registry: RunRegistry::default(),
            ingress_class: ingress_class.to_string(),
            strategy,
            wait_timeout,
        }
    }

    /// Starts a run for `host` unless one is already in flight. Returns true
    /// if a new run was spawned; false means the caller joins the existing
    /// run as an observer through the broker.
    pub fn spawn(self: &Arc<Self>, host: &str) -> bool {
        let Some(guard) = self.registry.begin(host) else {
            debug!(host, "unidle already in flight, observing");
            return false;
        };

        let this = Arc::clone(self);
        let host = host.to_string();
        tokio::spawn(async move {
            this.run(&host, guard).await;
        });
        true
    }

    /// Status of the latest run for `host`: in-flight, or the terminal
    /// status of the last finished run.
    pub fn status(&self, host: &str) -> Option<RunStatus> {
        self.registry.status(host)
    }

    /// Runs the workflow to completion. Not client-cancelable: once started,
    /// the run finishes even if the triggering connection drops, and a later
    /// connection for the same host rejoins the group.
    async fn run(&self, host: &str, guard: RunGuard) {
        info!(host, "unidling");
        self.registry.set(host, RunStatus::Running);

        let result = self.execute(host).await;

        // Release the claim before the terminal message so a subscriber that
        // arrives after the group is retired can trigger a fresh (no-op) run.
        guard.complete(if result.is_ok() {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        });

        match result {
            Ok(()) => {
                info!(host, "unidled");
                self.broker.publish(Message::success(host, "Ready"));
            }
            Err(err) => {
                error!(host, error = %err, "unidle failed");
                self.broker.publish(Message::error(host, err.user_message()));
            }
        }
    }

    async fn execute(&self, host: &str) -> Result<()> {
        let app = self.cluster.resolve_app(host).await?;
        self.progress(host, "App found");

        let replicas = self.restore_count(&app);
        let outcome = self.cluster.set_replicas(&app, replicas).await?;
        self.log_outcome(host, "restore replicas", outcome);
        self.progress(host, "Replicas restored");

        self.cluster.wait_ready(&app, self.wait_timeout).await?;
        self.progress(host, "Deployment ready");

        let outcome = self
            .cluster
            .set_ingress_class(&app, &self.ingress_class)
            .await?;
        self.log_outcome(host, "enable ingress", outcome);
        self.progress(host, "Ingress enabled");

        let outcome = match self.strategy {
            RedirectStrategy::UnidlerIngressRule => self.cluster.remove_host_rule(host).await?,
            RedirectStrategy::ServiceExternalName => self.cluster.redirect_service(&app).await?,
        };
        self.log_outcome(host, "redirect traffic", outcome);
        self.progress(host, "Traffic redirected");

        let outcome = self.cluster.clear_idle_metadata(&app).await?;
        self.log_outcome(host, "clear idle metadata", outcome);
        self.progress(host, "Idle metadata removed");

        Ok(())
    }

    /// The replica count stashed when the app was idled. Missing or
    /// unparseable metadata falls back to 1 with a warning, never an error.
    fn restore_count(&self, app: &AppResources) -> i32 {
        let Some(raw) = &app.restore_count else {
            debug!(host = %app.host, "no restore count stored, defaulting to 1");
            return 1;
        };
        match parse_restore_count(raw) {
            Ok(n) => n,
            Err(err) => {
                warn!(host = %app.host, error = %err, "defaulting restore count to 1");
                1
            }
        }
    }

    fn progress(&self, host: &str, phrase: &str) {
        self.broker.publish(Message::progress(host, phrase));
    }

    fn log_outcome(&self, host: &str, step: &str, outcome: Outcome) {
        match outcome {
            Outcome::Applied => info!(host, step, "applied"),
            Outcome::AlreadyConverged => info!(host, step, "already converged, nothing to do"),
        }
    }
}

fn parse_restore_count(raw: &str) -> Result<i32> {
    let n: i32 = raw
        .parse()
        .map_err(|_| Error::MalformedState(format!("restore count '{raw}' is not a number")))?;
    if n < 1 {
        return Err(Error::MalformedState(format!(
            "restore count {n} is not positive"
        )));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Subscriber;
    use crate::message::{EVENT_ERROR, EVENT_SUCCESS};
    use crate::test_helpers::{MockCluster, WaitReadyBehavior};
    use tokio::time::{timeout, Duration};

    const HOST: &str = "app.example.com";

    fn unidler(cluster: Arc<MockCluster>, broker: Broker) -> Arc<Unidler> {
        Arc::new(Unidler::new(
            cluster,
            broker,
            "nginx",
            RedirectStrategy::UnidlerIngressRule,
            Duration::from_secs(5),
        ))
    }

    /// Drains messages until the terminal one, returning the whole sequence.
    async fn drain(sub: &mut Subscriber) -> Vec<Message> {
        let mut messages = Vec::new();
        loop {
            let msg = timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("timed out waiting for message")
                .expect("stream closed before terminal message");
            let terminal = msg.is_terminal();
            messages.push(msg);
            if terminal {
                return messages;
            }
        }
    }

    #[test]
    fn test_parse_restore_count() {
        assert_eq!(parse_restore_count("3").unwrap(), 3);
        assert!(parse_restore_count("").is_err());
        assert!(parse_restore_count("2018-11-26T17:27:34;2").is_err());
        assert!(parse_restore_count("0").is_err());
        assert!(parse_restore_count("-1").is_err());
    }

    #[tokio::test]
    async fn test_full_run_restores_idled_app() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("3")));
        let broker = Broker::new();
        let mut sub = broker.subscribe(HOST).await;

        assert!(unidler(cluster.clone(), broker).spawn(HOST));
        let messages = drain(&mut sub).await;

        let data: Vec<&str> = messages.iter().map(|m| m.data.as_str()).collect();
        assert_eq!(
            data,
            vec![
                "App found",
                "Replicas restored",
                "Deployment ready",
                "Ingress enabled",
                "Traffic redirected",
                "Idle metadata removed",
                "Ready",
            ]
        );
        assert!(messages[..6].iter().all(|m| !m.is_terminal()));
        assert_eq!(messages[6].event.as_deref(), Some(EVENT_SUCCESS));

        let app = cluster.app(HOST);
        assert_eq!(app.replicas, 3);
        assert_eq!(app.ingress_class.as_deref(), Some("nginx"));
        assert!(!app.unidler_rule);
        assert!(!app.idled);
        assert_eq!(cluster.calls().set_replicas, 1);
    }

    #[tokio::test]
    async fn test_missing_restore_count_defaults_to_one() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, None));
        let broker = Broker::new();
        let mut sub = broker.subscribe(HOST).await;

        assert!(unidler(cluster.clone(), broker).spawn(HOST));
        let messages = drain(&mut sub).await;

        assert_eq!(messages.last().unwrap().event.as_deref(), Some(EVENT_SUCCESS));
        assert_eq!(cluster.app(HOST).replicas, 1);
    }

    #[tokio::test]
    async fn test_malformed_restore_count_defaults_to_one() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("2018-11-26T17:27:34;2")));
        let broker = Broker::new();
        let mut sub = broker.subscribe(HOST).await;

        assert!(unidler(cluster.clone(), broker).spawn(HOST));
        let messages = drain(&mut sub).await;

        assert_eq!(messages.last().unwrap().event.as_deref(), Some(EVENT_SUCCESS));
        assert_eq!(cluster.app(HOST).replicas, 1);
    }

    #[tokio::test]
    async fn test_unknown_host_fails_with_sanitized_message() {
        let cluster = Arc::new(MockCluster::default());
        let broker = Broker::new();
        let mut sub = broker.subscribe("nosuch.example.com").await;

        assert!(unidler(cluster, broker).spawn("nosuch.example.com"));
        let messages = drain(&mut sub).await;

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event.as_deref(), Some(EVENT_ERROR));
        assert_eq!(messages[0].data, "app not found");
    }

    #[tokio::test]
    async fn test_failed_step_skips_later_steps() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("1")));
        cluster.fail_set_replicas();
        let broker = Broker::new();
        let mut sub = broker.subscribe(HOST).await;

        assert!(unidler(cluster.clone(), broker).spawn(HOST));
        let messages = drain(&mut sub).await;

        let last = messages.last().unwrap();
        assert_eq!(last.event.as_deref(), Some(EVENT_ERROR));
        // Internal kube detail stays server-side.
        assert!(!last.data.contains("simulated"));

        let calls = cluster.calls();
        assert_eq!(calls.wait_ready, 0);
        assert_eq!(calls.set_ingress_class, 0);
        assert_eq!(calls.remove_host_rule, 0);
        assert_eq!(calls.clear_idle_metadata, 0);
    }

    #[tokio::test]
    async fn test_readiness_timeout_fails_run() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("1")));
        cluster.set_wait_ready(WaitReadyBehavior::Timeout);
        let broker = Broker::new();
        let mut sub = broker.subscribe(HOST).await;

        assert!(unidler(cluster.clone(), broker).spawn(HOST));
        let messages = drain(&mut sub).await;

        let last = messages.last().unwrap();
        assert_eq!(last.event.as_deref(), Some(EVENT_ERROR));
        assert_eq!(last.data, "timed out waiting for the app to start");

        let calls = cluster.calls();
        assert_eq!(calls.set_ingress_class, 0);
        assert_eq!(calls.clear_idle_metadata, 0);
    }

    #[tokio::test]
    async fn test_rerun_on_restored_app_is_all_noops() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("2")));
        let broker = Broker::new();
        let unidler = unidler(cluster.clone(), broker.clone());

        let mut sub = broker.subscribe(HOST).await;
        assert!(unidler.spawn(HOST));
        drain(&mut sub).await;

        // Second run against the already-restored app: converges with no
        // further mutation and still ends in success.
        let mut sub = broker.subscribe(HOST).await;
        assert!(unidler.spawn(HOST));
        let messages = drain(&mut sub).await;

        assert_eq!(messages.last().unwrap().event.as_deref(), Some(EVENT_SUCCESS));
        assert_eq!(cluster.calls().mutations_applied, 4);
        assert_eq!(cluster.app(HOST).replicas, 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_start_one_run() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("1")));
        cluster.set_wait_ready(WaitReadyBehavior::Block);
        let broker = Broker::new();
        let unidler = unidler(cluster.clone(), broker.clone());

        let mut first = broker.subscribe(HOST).await;
        assert!(unidler.spawn(HOST));
        assert!(unidler.status(HOST).is_some());
        let mut second = broker.subscribe(HOST).await;
        assert!(!unidler.spawn(HOST));

        cluster.release_wait_ready();
        let a = drain(&mut first).await;
        let b = drain(&mut second).await;

        assert_eq!(a.last().unwrap().event.as_deref(), Some(EVENT_SUCCESS));
        assert_eq!(b.last().unwrap().event.as_deref(), Some(EVENT_SUCCESS));
        assert_eq!(cluster.calls().set_replicas, 1);
        assert_eq!(unidler.status(HOST), Some(RunStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_terminal_status_outlives_the_run() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("1")));
        let broker = Broker::new();
        let unidler = unidler(cluster, broker.clone());

        let mut sub = broker.subscribe(HOST).await;
        assert!(unidler.spawn(HOST));
        drain(&mut sub).await;

        // The terminal message is published after the claim is released, so
        // the status is already readable here and does not block a new run.
        assert_eq!(unidler.status(HOST), Some(RunStatus::Succeeded));
        let mut sub = broker.subscribe(HOST).await;
        assert!(unidler.spawn(HOST));
        drain(&mut sub).await;
        assert_eq!(unidler.status(HOST), Some(RunStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_failed_run_reports_failed_status() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("1")));
        cluster.fail_set_replicas();
        let broker = Broker::new();
        let unidler = unidler(cluster, broker.clone());

        let mut sub = broker.subscribe(HOST).await;
        assert!(unidler.spawn(HOST));
        let messages = drain(&mut sub).await;

        assert_eq!(messages.last().unwrap().event.as_deref(), Some(EVENT_ERROR));
        assert_eq!(unidler.status(HOST), Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn test_service_redirect_strategy() {
        let cluster = Arc::new(MockCluster::with_idled_app(HOST, Some("1")));
        let broker = Broker::new();
        let unidler = Arc::new(Unidler::new(
            cluster.clone(),
            broker.clone(),
            "nginx",
            RedirectStrategy::ServiceExternalName,
            Duration::from_secs(5),
        ));

        let mut sub = broker.subscribe(HOST).await;
        assert!(unidler.spawn(HOST));
        let messages = drain(&mut sub).await;

        assert_eq!(messages.last().unwrap().event.as_deref(), Some(EVENT_SUCCESS));
        assert!(!cluster.app(HOST).service_external);
        assert_eq!(cluster.calls().remove_host_rule, 0);
        assert_eq!(cluster.calls().redirect_service, 1);
    }
}
