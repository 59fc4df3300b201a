//! kube-testenv runs a disposable Kubernetes control plane for integration tests:
//! a datastore (etcd or kine) and a kube-apiserver pointed at it,
//! each supervised as a child process that is health-checked on start
//! and terminated on stop.
//!
//! Most tests only need [`Environment`]:
//! start it, talk to the API server through the returned [`kube_client::Config`],
//! then stop it.
//! The individual supervisors ([`Etcd`], [`Kine`], [`ApiServer`])
//! and the [`process`] layer underneath can also be driven directly.
//!
//! Binaries are looked up in `KUBEBUILDER_ASSETS` (or `TEST_ASSET_<NAME>`),
//! see [`settings`] for every environment variable that is honoured.

pub mod addr;
pub mod apiserver;
pub use apiserver::ApiServer;
pub mod certs;
pub mod control_plane;
pub use control_plane::{AuthenticatedUser, ControlPlane, User};
pub mod datastore;
pub use datastore::{Datastore, Etcd, Kine};
pub mod environment;
pub use environment::Environment;
mod error;
pub use error::{Error, Result};
pub mod kubeconfig;
pub mod process;
pub mod settings;
pub use settings::{DatastoreKind, Settings};
