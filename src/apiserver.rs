//! Supervision of a `kube-apiserver` backed by an already running datastore.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::addr;
use crate::certs;
use crate::error::{Error, Result};
use crate::process::arguments::{flag_map, url_string, FlagMap};
use crate::process::{
    fill_unset, template_and_arguments, Arguments, HealthCheck, Lifecycle, ProcessOptions,
    ProcessState, Sink, TemplateDefaults, TemplateUrl,
};
use crate::settings::Settings;

const BINARY: &str = "kube-apiserver";
const HEALTH_PATH: &str = "/healthz";
const SERVICE_CLUSTER_IP_RANGE: &str = "10.0.0.0/24";

/// Legacy argument templates equivalent to the computed API server
/// defaults, for callers that extend them through [`ApiServer::args`].
pub const API_SERVER_DEFAULT_ARGS: &[&str] = &[
    "--advertise-address=127.0.0.1",
    "--etcd-servers={% if etcd_url %}{{ etcd_url.string }}{% endif %}",
    "--cert-dir={{ cert_dir }}",
    "--insecure-port={% if url %}{{ url.port }}{% endif %}",
    "--insecure-bind-address={% if url %}{{ url.hostname }}{% endif %}",
    "--secure-port={% if secure_port %}{{ secure_port }}{% endif %}",
    "--disable-admission-plugins=ServiceAccount",
    "--service-cluster-ip-range=10.0.0.0/24",
    "--allow-privileged=true",
];

/// A `kube-apiserver` process.
///
/// [`etcd_url`](Self::etcd_url) must be set before starting. Everything
/// else is defaulted on the first start and written back.
#[derive(Default)]
pub struct ApiServer {
    /// Insecure serving URL, also used for health checks. A free loopback
    /// port is picked when unset.
    pub url: Option<Url>,
    /// Secure serving port. A free port is picked when unset.
    pub secure_port: Option<u16>,
    pub path: Option<PathBuf>,
    /// Legacy argument templates, e.g. `--cert-dir={{ cert_dir }}`.
    ///
    /// Deprecated in favour of [`configure`](Self::configure); a flag named
    /// here replaces every other value for that flag.
    pub args: Vec<String>,
    /// Directory holding the serving certificates. A temporary directory,
    /// removed on stop, when unset. Certificates already present are reused.
    pub cert_dir: Option<PathBuf>,
    /// The datastore the API server talks to.
    pub etcd_url: Option<Url>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub out: Option<Sink>,
    pub err: Option<Sink>,
    pub settings: Option<Settings>,

    configured: Arguments,
    state: Option<ProcessState>,
}

#[derive(Serialize)]
struct ApiServerTemplate {
    url: TemplateUrl,
    secure_port: u16,
    cert_dir: String,
    etcd_url: TemplateUrl,
    path: String,
}

impl ApiServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags layered over the computed defaults, e.g.
    /// `server.configure().append("runtime-config", "api/all=true")`.
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

    /// Stops the API server. A caller-provided `cert_dir` is left in place.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state.as_mut() {
            Some(state) => state.stop().await,
            None => Ok(()),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state
            .as_ref()
            .map_or(Lifecycle::Uninitialized, ProcessState::lifecycle)
    }

    pub fn rendered_args(&self) -> Option<&[String]> {
        self.state.as_ref().map(|state| state.args.as_slice())
    }

    pub(crate) fn apply_defaults(
        &mut self,
        settings: &Settings,
        output: (Option<Sink>, Option<Sink>),
    ) {
        fill_unset((&mut self.out, &mut self.err), &mut self.settings, settings, output);
    }

    fn init_state(&mut self) -> Result<ProcessState> {
        let etcd_url = self
            .etcd_url
            .clone()
            .ok_or_else(|| Error::Config("expected etcd_url to be configured".into()))?;
        addr::check_url(&etcd_url, "etcd", None)?;
        if let Some(url) = &self.url {
            // the insecure port serves plain HTTP only
            addr::check_url(url, BINARY, Some("http"))?;
        }

        let settings = self.settings.as_ref().unwrap_or_else(|| Settings::global());
        let mut state = ProcessState::init(
            BINARY,
            ProcessOptions {
                dir: self.cert_dir.clone(),
                path: self.path.clone(),
                start_timeout: self.start_timeout,
                stop_timeout: self.stop_timeout,
            },
            settings,
        )?;

        let secure_port = match self.secure_port {
            Some(port) => port,
            None => addr::suggest("")?.0,
        };
        let url = match &self.url {
            Some(url) => url.clone(),
            None => addr::suggest_url("http")?,
        };
        state.health_check = Some(HealthCheck::http(&url, HEALTH_PATH));

        certs::ensure_serving_cert(&state.dir)?;

        let data = ApiServerTemplate {
            url: TemplateUrl::from(&url),
            secure_port,
            cert_dir: state.dir.display().to_string(),
            etcd_url: TemplateUrl::from(&etcd_url),
            path: state.path.display().to_string(),
        };
        state.args = template_and_arguments(
            &self.args,
            &self.configured,
            TemplateDefaults {
                data: &data,
                defaults: default_args(&url, secure_port, &data.cert_dir, &etcd_url),
                minimal_defaults: minimal_args(),
            },
        )?;
        log::debug!("kube-apiserver arguments: {:?}", state.args);

        self.url = Some(url);
        self.secure_port = Some(secure_port);
        self.cert_dir = Some(state.dir.clone());
        self.path = Some(state.path.clone());
        self.start_timeout = Some(state.start_timeout);
        self.stop_timeout = Some(state.stop_timeout);
        Ok(state)
    }
}

fn default_args(url: &Url, secure_port: u16, cert_dir: &str, etcd_url: &Url) -> FlagMap {
    let mut args = flag_map([
        ("advertise-address", addr::LOCALHOST.to_string()),
        ("service-cluster-ip-range", SERVICE_CLUSTER_IP_RANGE.to_string()),
        ("allow-privileged", "true".to_string()),
        // no controller manager runs to create the default service account
        ("disable-admission-plugins", "ServiceAccount".to_string()),
        ("etcd-servers", url_string(etcd_url)),
        ("cert-dir", cert_dir.to_string()),
        ("secure-port", secure_port.to_string()),
    ]);
    if let Some(port) = url.port_or_known_default() {
        args.insert("insecure-port".into(), vec![port.to_string()]);
    }
    if let Some(host) = url.host_str() {
        args.insert("insecure-bind-address".into(), vec![host.to_string()]);
    }
    args
}

fn minimal_args() -> FlagMap {
    flag_map([(
        "service-cluster-ip-range",
        SERVICE_CLUSTER_IP_RANGE.to_string(),
    )])
}
