use std::path::{Path, PathBuf};
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

const BINARY: &str = "kine";
const DATABASE_FILE: &str = "kine.db";

/// Legacy argument templates equivalent to the computed kine defaults.
pub const KINE_DEFAULT_ARGS: &[&str] = &[
    "--listen-address={% if url %}{{ url.string }}{% endif %}",
    "--endpoint={{ dsn }}",
];

/// A kine process serving the etcd API on top of a SQL database.
///
/// Unlike [`Etcd`](super::Etcd) it does not manage a data directory of its
/// own: the default DSN points at a SQLite file in its working directory.
#[derive(Default)]
pub struct Kine {
    /// Listen address, `tcp://host:port`. A free loopback port is picked
    /// when unset.
    pub url: Option<Url>,
    /// Backend DSN passed as `--endpoint`.
    pub dsn: Option<String>,
    pub path: Option<PathBuf>,
    /// Legacy argument templates, e.g. `--endpoint={{ dsn }}`.
    pub args: Vec<String>,
    /// Working directory. A temporary directory, removed on stop, when unset.
    pub dir: Option<PathBuf>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub out: Option<Sink>,
    pub err: Option<Sink>,
    pub settings: Option<Settings>,

    configured: Arguments,
    state: Option<ProcessState>,
}

#[derive(Serialize)]
struct KineTemplate {
    url: TemplateUrl,
    dsn: String,
    dir: String,
    path: String,
}

impl Kine {
    pub fn new() -> Self {
        Self::default()
    }

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

    pub async fn stop(&mut self) -> Result<()> {
        match self.state.as_mut() {
            Some(state) => state.stop().await,
            None => Ok(()),
        }
    }

    /// The etcd-compatible URL clients connect to, always `http://host:port`.
    pub fn connect_url(&self) -> Option<Url> {
        let url = self.url.as_ref()?;
        let host = url.host()?;
        let port = url.port_or_known_default()?;
        Url::parse(&format!("http://{host}:{port}")).ok()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state
            .as_ref()
            .map_or(Lifecycle::Uninitialized, ProcessState::lifecycle)
    }

    pub fn rendered_args(&self) -> Option<&[String]> {
        self.state.as_ref().map(|state| state.args.as_slice())
    }

    fn init_state(&mut self) -> Result<ProcessState> {
        if let Some(url) = &self.url {
            addr::check_url(url, BINARY, None)?;
        }

        let settings = self.settings.as_ref().unwrap_or_else(|| Settings::global());
        let mut state = ProcessState::init(
            BINARY,
            ProcessOptions {
                dir: self.dir.clone(),
                path: self.path.clone(),
                start_timeout: self.start_timeout,
                stop_timeout: self.stop_timeout,
            },
            settings,
        )?;

        let url = match &self.url {
            Some(url) => url.clone(),
            None => addr::suggest_url("tcp")?,
        };
        // kine has no health endpoint on its client port
        state.health_check = Some(HealthCheck::tcp(&url));

        let dsn = match &self.dsn {
            Some(dsn) => dsn.clone(),
            None => sqlite_dsn(&state.dir),
        };

        let data = KineTemplate {
            url: TemplateUrl::from(&url),
            dsn,
            dir: state.dir.display().to_string(),
            path: state.path.display().to_string(),
        };
        state.args = template_and_arguments(
            &self.args,
            &self.configured,
            TemplateDefaults {
                data: &data,
                defaults: default_args(&url, &data.dsn),
                minimal_defaults: FlagMap::new(),
            },
        )?;
        log::debug!("kine arguments: {:?}", state.args);

        self.url = Some(url);
        self.dsn = Some(data.dsn);
        self.dir = Some(state.dir.clone());
        self.path = Some(state.path.clone());
        self.start_timeout = Some(state.start_timeout);
        self.stop_timeout = Some(state.stop_timeout);
        Ok(state)
    }
}

/// The default DSN: a SQLite database in `dir`.
pub fn sqlite_dsn(dir: &Path) -> String {
    format!(
        "sqlite://file:{}?_journal=WAL&cache=shared",
        dir.join(DATABASE_FILE).display()
    )
}

fn default_args(url: &Url, dsn: &str) -> FlagMap {
    flag_map([
        ("listen-address", url_string(url)),
        ("endpoint", dsn.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::error::Error;
    use crate::process::CapturedOutput;

    #[test]
    fn defaults_to_sqlite_in_the_working_dir() {
        let mut kine = Kine {
            settings: Some(Settings::default()),
            ..Default::default()
        };

        let state = kine.init_state().unwrap();

        let url = kine.url.clone().unwrap();
        assert_eq!(url.scheme(), "tcp");
        assert_eq!(state.health_check, Some(HealthCheck::tcp(&url)));

        let dsn = kine.dsn.clone().unwrap();
        assert!(dsn.starts_with("sqlite://file:"), "{dsn}");
        assert!(dsn.ends_with("?_journal=WAL&cache=shared"), "{dsn}");
        assert!(dsn.contains(&state.dir.join(DATABASE_FILE).display().to_string()));
        assert_eq!(
            state.args,
            vec![
                format!("--endpoint={dsn}"),
                format!("--listen-address={}", url_string(&url)),
            ]
        );
    }

    #[test]
    fn connect_url_is_http() {
        let kine = Kine {
            url: Some(Url::parse("tcp://127.0.0.1:2381").unwrap()),
            ..Default::default()
        };
        assert_eq!(
            kine.connect_url(),
            Some(Url::parse("http://127.0.0.1:2381").unwrap())
        );
        assert_eq!(Kine::new().connect_url(), None);
    }

    #[tokio::test]
    async fn portless_url_fails_without_waiting() {
        let mut kine = Kine {
            url: Some(Url::parse("tcp://127.0.0.1").unwrap()),
            path: Some("/bin/sh".into()),
            start_timeout: Some(Duration::from_secs(30)),
            settings: Some(Settings::default()),
            ..Default::default()
        };

        let started = Instant::now();
        let err = kine.start().await.unwrap_err();

        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(kine.lifecycle(), Lifecycle::Uninitialized);
        assert_eq!(kine.connect_url(), None);
        kine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_launch_keeps_the_sinks() {
        let stdout = CapturedOutput::new();
        let stderr = CapturedOutput::new();
        let mut kine = Kine {
            path: Some("/definitely/not/kine".into()),
            out: Some(stdout.sink()),
            err: Some(stderr.sink()),
            settings: Some(Settings::default()),
            ..Default::default()
        };

        let err = kine.start().await.unwrap_err();

        assert!(matches!(err, Error::Launch { .. }), "{err}");
        assert!(kine.out.is_some());
        assert!(kine.err.is_some());
        kine.stop().await.unwrap();
    }

    #[test]
    fn legacy_templates_see_the_dsn() {
        let mut kine = Kine {
            dsn: Some("postgres://localhost/kine".into()),
            args: KINE_DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
            settings: Some(Settings::default()),
            ..Default::default()
        };

        let state = kine.init_state().unwrap();

        let url = kine.url.clone().unwrap();
        assert_eq!(
            state.args,
            vec![
                format!("--listen-address={}", url_string(&url)),
                "--endpoint=postgres://localhost/kine".to_string(),
            ]
        );
    }
}
