use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::wait::await_condition;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Label marking a Deployment as idled.
pub const IDLED_LABEL: &str = "mojanalytics.xyz/idled";
/// Annotation recording when the app was idled.
pub const IDLED_AT_ANNOTATION: &str = "mojanalytics.xyz/idled-at";
/// Annotation stashing the replica count to restore on unidle.
pub const RESTORE_COUNT_ANNOTATION: &str = "mojanalytics.xyz/restore-count";
/// Ingress-class annotation toggled to route traffic to the app again.
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// The resolved resources of one idled app, located once per run.
#[derive(Debug, Clone)]
pub struct AppResources {
    pub host: String,
    pub namespace: String,
    pub deployment: String,
    pub ingress: String,
    pub service: String,
    /// Current `spec.replicas` at resolution time.
    pub replicas: i32,
    /// Raw restore-count annotation, if present.
    pub restore_count: Option<String>,
}

/// Result of an idempotent mutation: applied, or nothing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    AlreadyConverged,
}

/// Cluster operations the unidle workflow needs.
///
/// Every mutation must be safe to call on an already-converged resource, so
/// the whole workflow can be re-run after a duplicate request or a crash.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Locates the Ingress, Deployment and Service for `host` via the
    /// `host=<host>` label selector. Zero or multiple matches is
    /// [`Error::NotFound`]; an ambiguous match is never resolved silently.
    async fn resolve_app(&self, host: &str) -> Result<AppResources>;

    /// Sets the Deployment's replica count. No-op if it is already positive.
    async fn set_replicas(&self, app: &AppResources, replicas: i32) -> Result<Outcome>;

    /// Blocks until the Deployment has at least one available replica, or
    /// `deadline` elapses ([`Error::Timeout`]).
    async fn wait_ready(&self, app: &AppResources, deadline: Duration) -> Result<()>;

    /// Sets the ingress-class annotation on the app's own Ingress.
    async fn set_ingress_class(&self, app: &AppResources, class: &str) -> Result<Outcome>;

    /// Removes the host's rule from the shared unidler Ingress. Removing an
    /// absent rule is a no-op.
    async fn remove_host_rule(&self, host: &str) -> Result<Outcome>;

    /// Re-points the app's Service from the unidler's ExternalName alias
    /// back to cluster-local selection with proper ports.
    async fn redirect_service(&self, app: &AppResources) -> Result<Outcome>;

    /// Strips the idled label and annotations from the Deployment. Missing
    /// keys are success.
    async fn clear_idle_metadata(&self, app: &AppResources) -> Result<Outcome>;
}

/// `ClusterApi` backed by a real Kubernetes cluster.
pub struct KubeCluster {
    client: Client,
    unidler_namespace: String,
    unidler_ingress: String,
}

impl KubeCluster {
    pub fn new(client: Client, unidler_namespace: &str, unidler_ingress: &str) -> Self {
        KubeCluster {
            client,
            unidler_namespace: unidler_namespace.to_string(),
            unidler_ingress: unidler_ingress.to_string(),
        }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Builds a client from the in-cluster environment, falling back to the
/// local kubeconfig.
pub async fn kube_client() -> anyhow::Result<Client> {
    use anyhow::Context;
    Client::try_default()
        .await
        .context("failed to create kubernetes client (in-cluster config or kubeconfig)")
}

fn exactly_one<K>(mut items: Vec<K>, kind: &str, host: &str) -> Result<K> {
    match items.len() {
        1 => Ok(items.remove(0)),
        n => {
            warn!(host, kind, matches = n, "selector did not match exactly one resource");
            Err(Error::NotFound(host.to_string()))
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn resolve_app(&self, host: &str) -> Result<AppResources> {
        let selector = ListParams::default().labels(&format!("host={host}"));

        let all_ingresses: Api<Ingress> = Api::all(self.client.clone());
        let ingress = exactly_one(all_ingresses.list(&selector).await?.items, "ingress", host)?;
        let namespace = ingress
            .namespace()
            .ok_or_else(|| Error::NotFound(host.to_string()))?;

        let deployment = exactly_one(
            self.deployments(&namespace).list(&selector).await?.items,
            "deployment",
            host,
        )?;
        let service = exactly_one(
            self.services(&namespace).list(&selector).await?.items,
            "service",
            host,
        )?;

        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let restore_count = deployment.annotations().get(RESTORE_COUNT_ANNOTATION).cloned();

        Ok(AppResources {
            host: host.to_string(),
            namespace,
            deployment: deployment.name_any(),
            ingress: ingress.name_any(),
            service: service.name_any(),
            replicas,
            restore_count,
        })
    }

    async fn set_replicas(&self, app: &AppResources, replicas: i32) -> Result<Outcome> {
        let api = self.deployments(&app.namespace);
        let current = api
            .get(&app.deployment)
            .await?
            .spec
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        if current > 0 {
            return Ok(Outcome::AlreadyConverged);
        }

        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(&app.deployment, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(
            host = %app.host,
            deployment = %app.deployment,
            previous = current,
            replicas,
            "replicas restored"
        );
        Ok(Outcome::Applied)
    }

    async fn wait_ready(&self, app: &AppResources, deadline: Duration) -> Result<()> {
        let api = self.deployments(&app.namespace);
        let available = |obj: Option<&Deployment>| {
            obj.and_then(|d| d.status.as_ref())
                .and_then(|s| s.available_replicas)
                .unwrap_or(0)
                > 0
        };

        match tokio::time::timeout(deadline, await_condition(api, &app.deployment, available))
            .await
        {
            Ok(Ok(_)) => {
                info!(host = %app.host, deployment = %app.deployment, "deployment available");
                Ok(())
            }
            Ok(Err(err)) => Err(Error::ClusterApi(err.to_string())),
            Err(_) => Err(Error::Timeout(app.deployment.clone())),
        }
    }

    async fn set_ingress_class(&self, app: &AppResources, class: &str) -> Result<Outcome> {
        let api = self.ingresses(&app.namespace);
        let ingress = api.get(&app.ingress).await?;
        if ingress.annotations().get(INGRESS_CLASS_ANNOTATION).map(String::as_str) == Some(class)
        {
            return Ok(Outcome::AlreadyConverged);
        }

        let patch = json!({
            "metadata": { "annotations": { "kubernetes.io/ingress.class": class } }
        });
        api.patch(&app.ingress, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(host = %app.host, ingress = %app.ingress, class, "ingress enabled");
        Ok(Outcome::Applied)
    }

    async fn remove_host_rule(&self, host: &str) -> Result<Outcome> {
        let api = self.ingresses(&self.unidler_namespace);
        let shared = api.get(&self.unidler_ingress).await?;

        let rules = shared.spec.and_then(|s| s.rules).unwrap_or_default();
        let kept: Vec<_> = rules
            .iter()
            .filter(|r| r.host.as_deref() != Some(host))
            .cloned()
            .collect();
        if kept.len() == rules.len() {
            return Ok(Outcome::AlreadyConverged);
        }

        let patch = json!({ "spec": { "rules": kept } });
        api.patch(
            &self.unidler_ingress,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(host, ingress = %self.unidler_ingress, "host removed from unidler ingress");
        Ok(Outcome::Applied)
    }

    async fn redirect_service(&self, app: &AppResources) -> Result<Outcome> {
        let api = self.services(&app.namespace);
        let service = api.get(&app.service).await?;
        let kind = service.spec.as_ref().and_then(|s| s.type_.as_deref());
        if kind != Some("ExternalName") {
            return Ok(Outcome::AlreadyConverged);
        }

        let patch = json!({
            "spec": {
                "type": "ClusterIP",
                "externalName": null,
                "selector": { "app": app.service },
                "ports": [{ "port": 80, "targetPort": 3000 }],
            }
        });
        api.patch(&app.service, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(host = %app.host, service = %app.service, "service redirected to app");
        Ok(Outcome::Applied)
    }

    async fn clear_idle_metadata(&self, app: &AppResources) -> Result<Outcome> {
        let api = self.deployments(&app.namespace);
        let deployment = api.get(&app.deployment).await?;
        let has_label = deployment.labels().contains_key(IDLED_LABEL);
        let has_annotations = deployment.annotations().contains_key(IDLED_AT_ANNOTATION)
            || deployment.annotations().contains_key(RESTORE_COUNT_ANNOTATION);
        if !has_label && !has_annotations {
            return Ok(Outcome::AlreadyConverged);
        }

        // Merge-patching a key to null deletes it; absent keys are ignored.
        let patch = json!({
            "metadata": {
                "labels": { "mojanalytics.xyz/idled": null },
                "annotations": {
                    "mojanalytics.xyz/idled-at": null,
                    "mojanalytics.xyz/restore-count": null,
                }
            }
        });
        api.patch(&app.deployment, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(host = %app.host, deployment = %app.deployment, "idle metadata cleared");
        Ok(Outcome::Applied)
    }
}
