use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// The error type returned by every supervisor in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required field was not configured before `start()`.
    #[error("configuration error: {0}")]
    Config(String),

    /// No free local port could be obtained.
    #[error("unable to allocate a port on {host:?}: {source}")]
    Allocation { host: String, source: io::Error },

    /// An argument template could not be rendered.
    #[error("unable to render argument template {template:?}: {source}")]
    Template {
        template: String,
        source: minijinja::Error,
    },

    /// Reading or writing a file or directory failed.
    #[error("i/o error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// The server binary could not be spawned.
    #[error("unable to launch {}: {source}", path.display())]
    Launch { path: PathBuf, source: io::Error },

    /// The server process exited before it became healthy.
    #[error("{name} exited before becoming healthy ({status})")]
    Exited { name: String, status: ExitStatus },

    /// A start or stop did not finish within its deadline.
    #[error("timeout waiting for {name} to {action} after {timeout:?}")]
    Timeout {
        name: String,
        action: &'static str,
        timeout: Duration,
    },

    /// `start()` was cancelled through its cancellation token.
    #[error("start of {name} was cancelled")]
    Cancelled { name: String },

    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("unable to build health-check client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("unable to render kubeconfig: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid kubeconfig: {0}")]
    Kubeconfig(#[from] kube_client::config::KubeconfigError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
