//! The storage backends an API server can run against.

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Result;
use crate::process::{fill_unset, Lifecycle, Sink};
use crate::settings::{DatastoreKind, Settings};

pub mod etcd;
pub use etcd::{Etcd, ETCD_DEFAULT_ARGS};
pub mod kine;
pub use kine::{Kine, KINE_DEFAULT_ARGS};

/// A datastore backend, resolved when the control plane is built.
pub enum Datastore {
    /// A real etcd with its own data directory.
    Etcd(Etcd),
    /// kine in front of a SQL database.
    Kine(Kine),
}

impl Default for Datastore {
    fn default() -> Self {
        Self::new(DatastoreKind::default())
    }
}

impl From<Etcd> for Datastore {
    fn from(etcd: Etcd) -> Self {
        Self::Etcd(etcd)
    }
}

impl From<Kine> for Datastore {
    fn from(kine: Kine) -> Self {
        Self::Kine(kine)
    }
}

impl Datastore {
    /// An unconfigured backend of the given kind.
    pub fn new(kind: DatastoreKind) -> Self {
        match kind {
            DatastoreKind::Etcd => Self::Etcd(Etcd::new()),
            DatastoreKind::Kine => Self::Kine(Kine::new()),
        }
    }

    pub fn kind(&self) -> DatastoreKind {
        match self {
            Self::Etcd(_) => DatastoreKind::Etcd,
            Self::Kine(_) => DatastoreKind::Kine,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_with_cancellation(&CancellationToken::new()).await
    }

    pub async fn start_with_cancellation(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self {
            Self::Etcd(etcd) => etcd.start_with_cancellation(cancel).await,
            Self::Kine(kine) => kine.start_with_cancellation(cancel).await,
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Etcd(etcd) => etcd.stop().await,
            Self::Kine(kine) => kine.stop().await,
        }
    }

    /// The URL to hand to the API server's `--etcd-servers`. `None` until
    /// the backend has been started or its URL pinned.
    pub fn connect_url(&self) -> Option<Url> {
        match self {
            Self::Etcd(etcd) => etcd.connect_url(),
            Self::Kine(kine) => kine.connect_url(),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::Etcd(etcd) => etcd.lifecycle(),
            Self::Kine(kine) => kine.lifecycle(),
        }
    }

    /// Fills in the output sinks and settings the caller left unset.
    pub(crate) fn apply_defaults(
        &mut self,
        settings: &Settings,
        output: (Option<Sink>, Option<Sink>),
    ) {
        match self {
            Self::Etcd(etcd) => fill_unset(
                (&mut etcd.out, &mut etcd.err),
                &mut etcd.settings,
                settings,
                output,
            ),
            Self::Kine(kine) => fill_unset(
                (&mut kine.out, &mut kine.err),
                &mut kine.settings,
                settings,
                output,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::process::CapturedOutput;

    #[test]
    fn built_from_settings() {
        assert_eq!(Datastore::new(DatastoreKind::Kine).kind(), DatastoreKind::Kine);
        assert_eq!(Datastore::default().kind(), DatastoreKind::Etcd);
    }

    #[test]
    fn defaults_never_override_caller_choices() {
        let pinned = Settings {
            start_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let mut etcd = Etcd::new();
        etcd.settings = Some(pinned);
        let mut datastore = Datastore::from(etcd);

        let captured = CapturedOutput::new();
        datastore.apply_defaults(
            &Settings::default(),
            (Some(captured.sink()), Some(captured.sink())),
        );

        let Datastore::Etcd(etcd) = datastore else {
            panic!("variant changed");
        };
        assert!(etcd.out.is_some() && etcd.err.is_some());
        assert_eq!(
            etcd.settings.and_then(|settings| settings.start_timeout),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn unstarted_backends_have_no_url() {
        let mut datastore = Datastore::new(DatastoreKind::Kine);
        assert_eq!(datastore.connect_url(), None);
        assert_eq!(datastore.lifecycle(), Lifecycle::Uninitialized);
        datastore.stop().await.unwrap();
    }
}
