use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod k8s;
pub mod message;
pub mod unidler;

// Exposed for integration tests
pub mod test_helpers;

pub use broker::{Broker, Subscriber};
pub use config::Config;
pub use error::Error;
pub use message::Message;
pub use unidler::Unidler;

/// Shared handler state: the broker, the workflow driver and the landing
/// page templates. Everything is explicitly constructed and injected; there
/// is no global state.
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub unidler: Arc<Unidler>,
    pub templates: Arc<minijinja::Environment<'static>>,
}

impl AppState {
    pub fn new(broker: Broker, unidler: Arc<Unidler>) -> Self {
        let mut env = minijinja::Environment::new();
        env.add_template("index.html", include_str!("../templates/index.html"))
            .expect("embedded index template is valid");
        AppState {
            broker,
            unidler,
            templates: Arc::new(env),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::index))
        .route("/events/", get(api::events))
        .route("/healthz", get(api::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builds the kube-backed cluster collaborator, wires up the broker and
/// workflow driver, and serves until the process is stopped.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let client = k8s::kube_client().await?;
    let cluster = Arc::new(k8s::KubeCluster::new(
        client,
        &config.unidler_namespace,
        &config.unidler_ingress,
    ));

    let broker = Broker::new();
    let unidler = Arc::new(Unidler::new(
        cluster,
        broker.clone(),
        &config.ingress_class_name,
        config.redirect_strategy,
        config.wait_timeout,
    ));
    let app = router(AppState::new(broker, unidler));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "starting unidler server");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
