use thiserror::Error;

/// Errors produced while unidling an app.
///
/// Internal detail (resource names, kube error strings) is logged server-side
/// only; the browser gets [`Error::user_message`].
#[derive(Debug, Error)]
pub enum Error {
    /// The app's resources are missing for the host, or the selector matched
    /// more than one Deployment/Service. Ambiguity is never resolved by
    /// silently picking one.
    #[error("no app found for host '{0}'")]
    NotFound(String),

    #[error("kubernetes API error: {0}")]
    ClusterApi(String),

    #[error("timed out waiting for deployment '{0}' to become available")]
    Timeout(String),

    /// Stored idle metadata that doesn't parse. Callers downgrade this to a
    /// warning and fall back to a safe default; it never fails a run.
    #[error("malformed idle metadata: {0}")]
    MalformedState(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::ClusterApi(err.to_string())
    }
}

impl Error {
    /// Sanitized phrase safe to publish to the browser.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "app not found",
            Error::ClusterApi(_) => "failed to restore the app, please try again later",
            Error::Timeout(_) => "timed out waiting for the app to start",
            Error::MalformedState(_) => "failed to restore the app, please try again later",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
