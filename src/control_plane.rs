//! A datastore and an API server started and stopped as one unit.

use kube_client::config::Kubeconfig;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::apiserver::ApiServer;
use crate::datastore::Datastore;
use crate::error::{Error, Result};
use crate::kubeconfig::{self, Identity};

/// A user known to the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub groups: Vec<String>,
}

/// A [`User`] together with the API server it was provisioned on.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    user: User,
    server: Url,
}

impl AuthenticatedUser {
    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn server(&self) -> &Url {
        &self.server
    }

    /// A kubeconfig acting as this user.
    pub fn kubeconfig_doc(&self) -> Kubeconfig {
        kubeconfig::build(
            &self.server,
            Some(&Identity {
                name: &self.user.name,
                groups: &self.user.groups,
            }),
        )
    }

    /// [`kubeconfig_doc`](Self::kubeconfig_doc) serialized for writing to disk.
    pub fn kubeconfig(&self) -> Result<Vec<u8>> {
        kubeconfig::render(&self.kubeconfig_doc())
    }

    /// A client configuration acting as this user.
    pub async fn config(&self) -> Result<kube_client::Config> {
        kubeconfig::client_config(self.kubeconfig_doc()).await
    }
}

#[derive(Default)]
pub struct ControlPlane {
    pub datastore: Datastore,
    pub api_server: ApiServer,
}

impl ControlPlane {
    pub fn new(datastore: Datastore, api_server: ApiServer) -> Self {
        Self {
            datastore,
            api_server,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_with_cancellation(&CancellationToken::new()).await
    }

    /// Starts the datastore, points the API server at it unless its
    /// `etcd_url` is already set, then starts the API server.
    ///
    /// On error the caller should still call [`stop`](Self::stop).
    pub async fn start_with_cancellation(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.datastore.start_with_cancellation(cancel).await?;

        if self.api_server.etcd_url.is_none() {
            self.api_server.etcd_url = self.datastore.connect_url();
        }
        self.api_server.start_with_cancellation(cancel).await
    }

    /// Stops the API server, then the datastore. Both are always attempted;
    /// the first error is returned.
    pub async fn stop(&mut self) -> Result<()> {
        let api_server = self.api_server.stop().await;
        if let Err(err) = &api_server {
            log::warn!("unable to stop kube-apiserver: {err}");
        }
        let datastore = self.datastore.stop().await;
        api_server.and(datastore)
    }

    /// The URL of the running API server.
    pub fn api_url(&self) -> Option<&Url> {
        self.api_server.url.as_ref()
    }

    /// Provisions `user`.
    ///
    /// The insecure port does not authenticate, so provisioning only records
    /// whom to impersonate; it fails if the API server has no URL yet.
    pub fn add_user(&self, user: User) -> Result<AuthenticatedUser> {
        let server = self.api_url().cloned().ok_or_else(|| {
            Error::Config("cannot add a user before the API server is started".into())
        })?;
        log::debug!("provisioned user {} in groups {:?}", user.name, user.groups);
        Ok(AuthenticatedUser { user, server })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> User {
        User {
            name: "envtest-admin".into(),
            groups: vec!["system:masters".into()],
        }
    }

    #[test]
    fn users_need_a_started_api_server() {
        let plane = ControlPlane::default();
        let err = plane.add_user(admin()).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn users_render_impersonating_kubeconfigs() {
        let mut plane = ControlPlane::default();
        plane.api_server.url = Some(Url::parse("http://127.0.0.1:8080").unwrap());

        let user = plane.add_user(admin()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&user.kubeconfig().unwrap()).unwrap();

        assert_eq!(user.server().as_str(), "http://127.0.0.1:8080/");
        assert_eq!(doc["users"][0]["user"]["as"], "envtest-admin");
        assert_eq!(doc["users"][0]["user"]["as-groups"][0], "system:masters");
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let mut plane = ControlPlane::default();
        plane.stop().await.unwrap();
    }
}
