//! Test helpers: an in-memory `ClusterApi` and `AppState` construction for
//! unit and integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::k8s::{AppResources, ClusterApi, Outcome};
use crate::unidler::{RedirectStrategy, Unidler};
use crate::{AppState, Broker};

/// One fake app's cluster-side state, mirroring the resources the real
/// implementation touches.
#[derive(Debug, Clone)]
pub struct MockApp {
    pub replicas: i32,
    pub restore_count: Option<String>,
    pub ingress_class: Option<String>,
    /// Host rule still present on the shared unidler ingress.
    pub unidler_rule: bool,
    /// Service still points at the unidler via ExternalName.
    pub service_external: bool,
    pub idled: bool,
}

/// Per-operation call counts, for asserting ordering and fail-fast behavior.
#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub resolve_app: usize,
    pub set_replicas: usize,
    pub wait_ready: usize,
    pub set_ingress_class: usize,
    pub remove_host_rule: usize,
    pub redirect_service: usize,
    pub clear_idle_metadata: usize,
    /// Mutations actually applied (no-ops excluded).
    pub mutations_applied: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReadyBehavior {
    /// Report availability immediately.
    Ready,
    /// Fail with a timeout error.
    Timeout,
    /// Block until [`MockCluster::release_wait_ready`] is called.
    Block,
}

#[derive(Default)]
struct MockState {
    apps: HashMap<String, MockApp>,
    calls: Calls,
    fail_set_replicas: bool,
    wait_ready: Option<WaitReadyBehavior>,
}

/// In-memory `ClusterApi` with the same no-op semantics as the kube-backed
/// implementation.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockState>,
    ready_gate: Notify,
}

impl MockCluster {
    /// A cluster holding one idled app for `host`: zero replicas, disabled
    /// ingress class, unidler rule present, service pointed at the unidler.
    pub fn with_idled_app(host: &str, restore_count: Option<&str>) -> Self {
        let cluster = MockCluster::default();
        cluster.state.lock().unwrap().apps.insert(
            host.to_string(),
            MockApp {
                replicas: 0,
                restore_count: restore_count.map(String::from),
                ingress_class: Some("disabled".to_string()),
                unidler_rule: true,
                service_external: true,
                idled: true,
            },
        );
        cluster
    }

    pub fn app(&self, host: &str) -> MockApp {
        self.state.lock().unwrap().apps[host].clone()
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_set_replicas(&self) {
        self.state.lock().unwrap().fail_set_replicas = true;
    }

    pub fn set_wait_ready(&self, behavior: WaitReadyBehavior) {
        self.state.lock().unwrap().wait_ready = Some(behavior);
    }

    pub fn release_wait_ready(&self) {
        // notify_one stores a permit, so releasing before the run reaches
        // the gate cannot be missed.
        self.ready_gate.notify_one();
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn resolve_app(&self, host: &str) -> Result<AppResources> {
        let mut state = self.state.lock().unwrap();
        state.calls.resolve_app += 1;
        let app = state
            .apps
            .get(host)
            .ok_or_else(|| Error::NotFound(host.to_string()))?;
        Ok(AppResources {
            host: host.to_string(),
            namespace: "test-ns".to_string(),
            deployment: "test".to_string(),
            ingress: "test".to_string(),
            service: "test".to_string(),
            replicas: app.replicas,
            restore_count: app.restore_count.clone(),
        })
    }

    async fn set_replicas(&self, app: &AppResources, replicas: i32) -> Result<Outcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.set_replicas += 1;
        if state.fail_set_replicas {
            return Err(Error::ClusterApi("simulated patch failure".to_string()));
        }
        let entry = state.apps.get_mut(&app.host).unwrap();
        if entry.replicas > 0 {
            return Ok(Outcome::AlreadyConverged);
        }
        entry.replicas = replicas;
        state.calls.mutations_applied += 1;
        Ok(Outcome::Applied)
    }

    async fn wait_ready(&self, app: &AppResources, _deadline: Duration) -> Result<()> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state.calls.wait_ready += 1;
            state.wait_ready.unwrap_or(WaitReadyBehavior::Ready)
        };
        match behavior {
            WaitReadyBehavior::Ready => Ok(()),
            WaitReadyBehavior::Timeout => Err(Error::Timeout(app.deployment.clone())),
            WaitReadyBehavior::Block => {
                self.ready_gate.notified().await;
                Ok(())
            }
        }
    }

    async fn set_ingress_class(&self, app: &AppResources, class: &str) -> Result<Outcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.set_ingress_class += 1;
        let entry = state.apps.get_mut(&app.host).unwrap();
        if entry.ingress_class.as_deref() == Some(class) {
            return Ok(Outcome::AlreadyConverged);
        }
        entry.ingress_class = Some(class.to_string());
        state.calls.mutations_applied += 1;
        Ok(Outcome::Applied)
    }

    async fn remove_host_rule(&self, host: &str) -> Result<Outcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.remove_host_rule += 1;
        let entry = state.apps.get_mut(host).unwrap();
        if !entry.unidler_rule {
            return Ok(Outcome::AlreadyConverged);
        }
        entry.unidler_rule = false;
        state.calls.mutations_applied += 1;
        Ok(Outcome::Applied)
    }

    async fn redirect_service(&self, app: &AppResources) -> Result<Outcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.redirect_service += 1;
        let entry = state.apps.get_mut(&app.host).unwrap();
        if !entry.service_external {
            return Ok(Outcome::AlreadyConverged);
        }
        entry.service_external = false;
        state.calls.mutations_applied += 1;
        Ok(Outcome::Applied)
    }

    async fn clear_idle_metadata(&self, app: &AppResources) -> Result<Outcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.clear_idle_metadata += 1;
        let entry = state.apps.get_mut(&app.host).unwrap();
        if !entry.idled && entry.restore_count.is_none() {
            return Ok(Outcome::AlreadyConverged);
        }
        entry.idled = false;
        entry.restore_count = None;
        state.calls.mutations_applied += 1;
        Ok(Outcome::Applied)
    }
}

/// A minimal `AppState` over a mock cluster, for driving the router in
/// tests.
pub fn create_test_app_state(cluster: Arc<MockCluster>) -> AppState {
    let broker = Broker::new();
    let unidler = Arc::new(Unidler::new(
        cluster,
        broker.clone(),
        "nginx",
        RedirectStrategy::UnidlerIngressRule,
        Duration::from_secs(5),
    ));
    AppState::new(broker, unidler)
}
