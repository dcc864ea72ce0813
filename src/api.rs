use std::collections::HashMap;
use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use futures::stream;
use tracing::{error, info};

use crate::AppState;

/// Landing page shown while the app is being restored.
pub async fn index(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let host = resolve_host(&headers, &params);
    let template = match state.templates.get_template("index.html") {
        Ok(t) => t,
        Err(err) => {
            error!(error = %err, "missing index template");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match template.render(minijinja::context! { host }) {
        Ok(html) => Html(html).into_response(),
        Err(err) => {
            error!(error = %err, "failed rendering index template");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Long-lived event stream for the resolved host.
///
/// Subscribes to the host's broadcast group (replaying its last message if
/// any) and starts an unidle run if none is in flight. Each message is
/// written in the SSE wire encoding and the response ends when the group
/// closes. A client disconnect drops the body stream and with it the
/// subscriber, which unsubscribes immediately.
pub async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let host = resolve_host(&headers, &params);
    let subscriber = state.broker.subscribe(&host).await;
    if state.unidler.spawn(&host) {
        info!(host, "unidle run started");
    }

    let stream = stream::unfold(subscriber, |mut subscriber| async move {
        let msg = subscriber.recv().await?;
        Some((Ok::<Bytes, Infallible>(Bytes::from(msg.to_string())), subscriber))
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

pub async fn healthz() -> &'static str {
    "Still OK"
}

/// The host being unidled: the `host` query parameter when present
/// (testability), otherwise the request's Host header.
fn resolve_host(headers: &HeaderMap, params: &HashMap<String, String>) -> String {
    if let Some(host) = params.get("host") {
        return host.clone();
    }
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}
