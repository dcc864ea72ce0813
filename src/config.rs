use std::time::Duration;

use tracing::warn;

use crate::unidler::RedirectStrategy;

/// Server configuration, read from the environment with defaults suitable
/// for in-cluster operation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen port (`PORT`, default 8080).
    pub port: u16,
    /// Ingress class written to an unidled app's ingress
    /// (`INGRESS_CLASS_NAME`, default `nginx`).
    pub ingress_class_name: String,
    /// Namespace of the shared unidler ingress (`UNIDLER_NAMESPACE`,
    /// default `default`).
    pub unidler_namespace: String,
    /// Name of the shared unidler ingress (`UNIDLER_INGRESS`, default
    /// `unidler`).
    pub unidler_ingress: String,
    /// Bound on the readiness wait (`WAIT_TIMEOUT_SECONDS`, default 300).
    pub wait_timeout: Duration,
    /// `REDIRECT_STRATEGY`: `ingress` (remove the unidler rule, default) or
    /// `service` (re-point the ExternalName service).
    pub redirect_strategy: RedirectStrategy,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source. Tests inject their own
    /// lookup instead of mutating the process environment.
    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let port = match var("PORT") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(port = %raw, "unparseable PORT, using 8080");
                8080
            }),
            None => 8080,
        };

        let wait_timeout = match var("WAIT_TIMEOUT_SECONDS") {
            Some(raw) => raw.parse().map(Duration::from_secs).unwrap_or_else(|_| {
                warn!(timeout = %raw, "unparseable WAIT_TIMEOUT_SECONDS, using 300");
                Duration::from_secs(300)
            }),
            None => Duration::from_secs(300),
        };

        let redirect_strategy = match var("REDIRECT_STRATEGY") {
            Some(raw) => RedirectStrategy::from_str(&raw).unwrap_or_else(|| {
                warn!(strategy = %raw, "unknown REDIRECT_STRATEGY, using 'ingress'");
                RedirectStrategy::UnidlerIngressRule
            }),
            None => RedirectStrategy::UnidlerIngressRule,
        };

        Config {
            port,
            ingress_class_name: var("INGRESS_CLASS_NAME").unwrap_or_else(|| "nginx".to_string()),
            unidler_namespace: var("UNIDLER_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            unidler_ingress: var("UNIDLER_INGRESS").unwrap_or_else(|| "unidler".to_string()),
            wait_timeout,
            redirect_strategy,
        }
    }
}
