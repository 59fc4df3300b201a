use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::addr;
use crate::error::Result;
use crate::process::arguments::{flag_map, url_string, FlagMap};
use crate::process::{
    template_and_arguments, Arguments, HealthCheck, Lifecycle, ProcessOptions, ProcessState, Sink,
    TemplateDefaults, TemplateUrl,
};
use crate::settings::Settings;

const BINARY: &str = "etcd";
const HEALTH_PATH: &str = "/health";

/// Legacy argument templates equivalent to the computed etcd defaults, for
/// callers that want to extend them through [`Etcd::args`].
pub const ETCD_DEFAULT_ARGS: &[&str] = &[
    "--listen-peer-urls=http://localhost:0",
    "--advertise-client-urls={{ url.string }}",
    "--listen-client-urls={{ url.string }}",
    "--data-dir={{ data_dir }}",
];

/// An etcd server with its own data directory.
///
/// Unset fields are defaulted on the first [`start`](Self::start) and
/// written back, so after a start `url`, `data_dir` and `path` describe the
/// running server.
#[derive(Default)]
pub struct Etcd {
    /// Client URL. A free loopback port is picked when unset.
    pub url: Option<Url>,
    /// Path to the etcd binary, see [`crate::process::bin_path_finder`].
    pub path: Option<PathBuf>,
    /// Legacy argument templates, e.g. `--data-dir={{ data_dir }}`.
    ///
    /// A flag named here replaces the defaults and [`configure`](Self::configure)
    /// entries of the same name.
    pub args: Vec<String>,
    /// Data directory. A temporary directory, removed on stop, when unset.
    pub data_dir: Option<PathBuf>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    /// Receives etcd's stdout. Consumed by the launch.
    pub out: Option<Sink>,
    /// Receives etcd's stderr. Consumed by the launch.
    pub err: Option<Sink>,
    /// Defaults for binary lookup and timeouts; [`Settings::global`] when unset.
    pub settings: Option<Settings>,

    configured: Arguments,
    state: Option<ProcessState>,
}

#[derive(Serialize)]
struct EtcdTemplate {
    url: TemplateUrl,
    data_dir: String,
    path: String,
}

impl Etcd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags layered over the computed defaults.
    pub fn configure(&mut self) -> &mut Arguments {
        &mut self.configured
    }

    pub async fn start(&mut self) -> Result<()> {
        self.start_with_cancellation(&CancellationToken::new()).await
    }

    pub async fn start_with_cancellation(&mut self, cancel: &CancellationToken) -> Result<()> {
        let state = match self.state.take() {
            Some(state) => state,
            None => self.init_state()?,
        };
        let state = self.state.insert(state);
        state
            .start_with_cancellation(&mut self.out, &mut self.err, cancel)
            .await
    }

    /// Stops etcd and removes a temporary data directory. A no-op if it
    /// was never started.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state.as_mut() {
            Some(state) => state.stop().await,
            None => Ok(()),
        }
    }

    /// The URL clients (the API server) connect to.
    pub fn connect_url(&self) -> Option<Url> {
        self.url.clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state
            .as_ref()
            .map_or(Lifecycle::Uninitialized, ProcessState::lifecycle)
    }

    /// The rendered command line, once the server has been started.
    pub fn rendered_args(&self) -> Option<&[String]> {
        self.state.as_ref().map(|state| state.args.as_slice())
    }

    fn init_state(&mut self) -> Result<ProcessState> {
        if let Some(url) = &self.url {
            addr::check_url(url, BINARY, Some("http"))?;
        }

        let settings = self.settings.as_ref().unwrap_or_else(|| Settings::global());
        let mut state = ProcessState::init(
            BINARY,
            ProcessOptions {
                dir: self.data_dir.clone(),
                path: self.path.clone(),
                start_timeout: self.start_timeout,
                stop_timeout: self.stop_timeout,
            },
            settings,
        )?;

        let url = match &self.url {
            Some(url) => url.clone(),
            None => addr::suggest_url("http")?,
        };
        state.health_check = Some(HealthCheck::http(&url, HEALTH_PATH));

        let data = EtcdTemplate {
            url: TemplateUrl::from(&url),
            data_dir: state.dir.display().to_string(),
            path: state.path.display().to_string(),
        };
        state.args = template_and_arguments(
            &self.args,
            &self.configured,
            TemplateDefaults {
                data: &data,
                defaults: default_args(&url, &data.data_dir),
                minimal_defaults: minimal_args(),
            },
        )?;
        log::debug!("etcd arguments: {:?}", state.args);

        self.url = Some(url);
        self.data_dir = Some(state.dir.clone());
        self.path = Some(state.path.clone());
        self.start_timeout = Some(state.start_timeout);
        self.stop_timeout = Some(state.stop_timeout);
        Ok(state)
    }
}

fn default_args(url: &Url, data_dir: &str) -> FlagMap {
    flag_map([
        ("advertise-client-urls", url_string(url)),
        ("listen-client-urls", url_string(url)),
        ("data-dir", data_dir.to_string()),
    ])
}

fn minimal_args() -> FlagMap {
    flag_map([("listen-peer-urls", "http://localhost:0".to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::process::arguments::render_templates;

    fn url() -> Url {
        Url::parse("http://127.0.0.1:2379").unwrap()
    }

    #[test]
    fn default_args_match_the_legacy_templates() {
        let data = EtcdTemplate {
            url: TemplateUrl::from(&url()),
            data_dir: "/data".into(),
            path: "/bin/etcd".into(),
        };
        let templates: Vec<String> = ETCD_DEFAULT_ARGS.iter().map(|s| s.to_string()).collect();
        let mut rendered = render_templates(&templates, &data).unwrap();
        rendered.sort();

        let computed = Arguments::new().as_strings(&{
            let mut all = minimal_args();
            all.extend(default_args(&url(), "/data"));
            all
        });
        assert_eq!(rendered, computed);
    }

    #[test]
    fn init_defaults_and_writes_back() {
        let settings = Settings::default();
        let mut etcd = Etcd {
            settings: Some(settings),
            ..Default::default()
        };
        etcd.configure().set("quota-backend-bytes", "8589934592");

        let state = etcd.init_state().unwrap();

        let url = etcd.url.clone().unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.host_str(), Some(addr::LOCALHOST));
        assert_eq!(etcd.data_dir.as_deref(), Some(state.dir.as_path()));
        assert!(state.owns_dir());
        assert_eq!(
            state.health_check,
            Some(HealthCheck::http(&url, HEALTH_PATH))
        );

        let listen = format!("--listen-client-urls={}", url_string(&url));
        assert!(state.args.contains(&listen), "{:?}", state.args);
        assert!(state.args.contains(&"--quota-backend-bytes=8589934592".to_string()));
        assert!(state
            .args
            .contains(&"--listen-peer-urls=http://localhost:0".to_string()));
        assert!(!listen.ends_with('/'));
    }

    #[test]
    fn pinned_fields_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut etcd = Etcd {
            url: Some(url()),
            data_dir: Some(dir.path().to_path_buf()),
            path: Some("/opt/etcd".into()),
            args: vec!["--data-dir={{ data_dir }}/member".into()],
            settings: Some(Settings::default()),
            ..Default::default()
        };

        let state = etcd.init_state().unwrap();

        assert!(!state.owns_dir());
        assert_eq!(etcd.connect_url(), Some(url()));
        assert_eq!(state.path, PathBuf::from("/opt/etcd"));
        let data_dirs: Vec<_> = state
            .args
            .iter()
            .filter(|arg| arg.starts_with("--data-dir"))
            .collect();
        assert_eq!(
            data_dirs,
            vec![&format!("--data-dir={}/member", dir.path().display())]
        );
    }

    #[test]
    fn pinned_urls_must_be_plain_http_with_a_port() {
        for pinned in ["https://127.0.0.1:2379", "unix://etcd.sock"] {
            let mut etcd = Etcd {
                url: Some(Url::parse(pinned).unwrap()),
                settings: Some(Settings::default()),
                ..Default::default()
            };

            let err = etcd.init_state().unwrap_err();

            assert!(matches!(err, Error::Config(_)), "{pinned}: {err}");
            assert!(etcd.data_dir.is_none());
        }
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let mut etcd = Etcd::new();
        etcd.stop().await.unwrap();
        assert_eq!(etcd.lifecycle(), Lifecycle::Uninitialized);
        assert_eq!(etcd.connect_url(), None);
    }
}
