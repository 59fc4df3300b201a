//! The top-level entry point for tests: a running control plane and a client
//! configuration for it.

use tokio_util::sync::CancellationToken;

use crate::control_plane::{AuthenticatedUser, ControlPlane, User};
use crate::datastore::Datastore;
use crate::error::{Error, Result};
use crate::process::Sink;
use crate::settings::Settings;

/// The user [`Environment::start`] provisions and returns a config for.
pub const ADMIN_USER: &str = "envtest-admin";
/// Grants cluster-admin on every Kubernetes version.
pub const ADMIN_GROUP: &str = "system:masters";

/// A disposable control plane for integration tests.
///
/// ```no_run
/// # async fn run() -> kube_testenv::Result<()> {
/// let mut env = kube_testenv::Environment::new();
/// let config = env.start().await?;
/// // ... talk to the API server through `config` ...
/// env.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Environment {
    pub settings: Settings,
    pub control_plane: ControlPlane,

    admin: Option<AuthenticatedUser>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// An environment configured from the process environment variables.
    pub fn new() -> Self {
        Self::with_settings(Settings::global().clone())
    }

    /// An environment using `settings`, with the datastore it selects.
    pub fn with_settings(settings: Settings) -> Self {
        let control_plane = ControlPlane {
            datastore: Datastore::new(settings.datastore),
            ..Default::default()
        };
        Self {
            settings,
            control_plane,
            admin: None,
        }
    }

    pub async fn start(&mut self) -> Result<kube_client::Config> {
        self.start_with_cancellation(&CancellationToken::new()).await
    }

    /// Starts the control plane and provisions an admin user, returning a
    /// client configuration acting as that user.
    ///
    /// On error the caller should still call [`stop`](Self::stop).
    pub async fn start_with_cancellation(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<kube_client::Config> {
        let attach = self.settings.attach_output;
        self.control_plane
            .datastore
            .apply_defaults(&self.settings, attached(attach));
        self.control_plane
            .api_server
            .apply_defaults(&self.settings, attached(attach));

        log::info!("starting {:?} and kube-apiserver", self.control_plane.datastore.kind());
        self.control_plane.start_with_cancellation(cancel).await?;

        let admin = self.control_plane.add_user(User {
            name: ADMIN_USER.into(),
            groups: vec![ADMIN_GROUP.into()],
        })?;
        let config = admin.config().await?;
        self.admin = Some(admin);
        Ok(config)
    }

    /// The admin user provisioned by [`start`](Self::start).
    pub fn admin(&self) -> Result<&AuthenticatedUser> {
        self.admin
            .as_ref()
            .ok_or_else(|| Error::Config("the environment has not been started".into()))
    }

    /// Stops the control plane. Safe to call after a failed start.
    pub async fn stop(&mut self) -> Result<()> {
        log::info!("stopping kube-apiserver and {:?}", self.control_plane.datastore.kind());
        self.admin = None;
        self.control_plane.stop().await
    }
}

/// Our own stdout and stderr when output is attached, discarded otherwise.
fn attached(attach: bool) -> (Option<Sink>, Option<Sink>) {
    if !attach {
        return (None, None);
    }
    let out: Sink = Box::new(std::io::stdout());
    let err: Sink = Box::new(std::io::stderr());
    (Some(out), Some(err))
}
