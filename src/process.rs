//! Launching, health-checking and stopping a single server process.
//!
//! A [`ProcessState`] owns at most one child process and moves through
//! [`Lifecycle`]: `Uninitialized -> Starting -> Healthy -> Stopping -> Stopped`.
//! A failed start leaves the state in `Starting` (or back in `Uninitialized`
//! if nothing was spawned); the caller is expected to call
//! [`ProcessState::stop`] afterwards in either case.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::settings::Settings;

pub mod arguments;
pub use arguments::{template_and_arguments, Arguments, TemplateDefaults, TemplateUrl};
pub mod bin_path;
pub use bin_path::bin_path_finder;
mod output;
pub use output::{CapturedOutput, Sink};
use output::Pump;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound for a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long output pumps may keep draining after the child exited.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// How to tell that a launched server is usable.
///
/// This is a liveness probe: the response itself is not inspected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// Any HTTP response from `url` with `path` counts as healthy.
    Http { url: Url, path: String },
    /// A successful TCP connect to `addr` (`host:port`) counts as healthy.
    Tcp { addr: String },
}

impl HealthCheck {
    pub fn http(url: &Url, path: impl Into<String>) -> Self {
        Self::Http {
            url: url.clone(),
            path: path.into(),
        }
    }

    pub fn tcp(url: &Url) -> Self {
        let host = url.host_str().unwrap_or(crate::addr::LOCALHOST);
        let addr = match url.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Self::Tcp { addr }
    }

    /// What is being probed, for log and error messages.
    pub fn target(&self) -> String {
        match self {
            Self::Http { url, path } => {
                let mut url = url.clone();
                url.set_path(path);
                url.to_string()
            }
            Self::Tcp { addr } => format!("tcp://{addr}"),
        }
    }

    fn client(&self) -> Result<Option<reqwest::Client>> {
        match self {
            Self::Http { .. } => Ok(Some(
                reqwest::Client::builder()
                    .timeout(PROBE_TIMEOUT)
                    .no_proxy()
                    .build()?,
            )),
            Self::Tcp { .. } => Ok(None),
        }
    }

    async fn probe(&self, client: Option<&reqwest::Client>) -> bool {
        match (self, client) {
            (Self::Http { .. }, Some(client)) => match client.get(self.target()).send().await {
                Ok(response) => {
                    log::debug!("{} answered {}", self.target(), response.status());
                    true
                }
                Err(err) => {
                    log::debug!("{} not healthy yet: {err}", self.target());
                    false
                }
            },
            (Self::Tcp { addr }, _) => {
                let connect = TcpStream::connect(addr.as_str());
                match tokio::time::timeout(PROBE_TIMEOUT, connect).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(err)) => {
                        log::debug!("{} not healthy yet: {err}", self.target());
                        false
                    }
                    Err(_) => false,
                }
            }
            (Self::Http { .. }, None) => false,
        }
    }
}

/// Where a [`ProcessState`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Starting,
    Healthy,
    Stopping,
    Stopped,
}

/// Caller-provided settings for [`ProcessState::init`]; unset fields are
/// defaulted.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Working directory. A temporary directory is created (and removed on
    /// stop) when unset.
    pub dir: Option<PathBuf>,
    /// Binary path. Looked up with [`bin_path_finder`] when unset.
    pub path: Option<PathBuf>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
}

/// The live/not-live wrapper around one server process.
#[derive(Debug)]
pub struct ProcessState {
    pub name: String,
    pub path: PathBuf,
    pub dir: PathBuf,
    pub args: Vec<String>,
    pub health_check: Option<HealthCheck>,
    pub poll_interval: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,

    temp_dir: Option<TempDir>,
    child: Option<Child>,
    stdout_pump: Option<Pump>,
    stderr_pump: Option<Pump>,
    lifecycle: Lifecycle,
}

impl ProcessState {
    /// Resolves `options` into a process state for the binary `name`.
    pub fn init(name: &str, options: ProcessOptions, settings: &Settings) -> Result<Self> {
        let (dir, temp_dir) = match options.dir {
            Some(dir) => (dir, None),
            None => {
                let temp_dir = tempfile::Builder::new()
                    .prefix(&format!("k8s_test_framework_{name}_"))
                    .tempdir()
                    .map_err(|err| Error::io(std::env::temp_dir(), err))?;
                (temp_dir.path().to_path_buf(), Some(temp_dir))
            }
        };

        Ok(Self {
            name: name.to_string(),
            path: options
                .path
                .unwrap_or_else(|| bin_path_finder(name, settings)),
            dir,
            args: Vec::new(),
            health_check: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            start_timeout: options
                .start_timeout
                .or(settings.start_timeout)
                .unwrap_or(DEFAULT_START_TIMEOUT),
            stop_timeout: options
                .stop_timeout
                .or(settings.stop_timeout)
                .unwrap_or(DEFAULT_STOP_TIMEOUT),
            temp_dir,
            child: None,
            stdout_pump: None,
            stderr_pump: None,
            lifecycle: Lifecycle::Uninitialized,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Whether the working directory was created by us and is removed on stop.
    pub fn owns_dir(&self) -> bool {
        self.temp_dir.is_some()
    }

    /// OS process id of the child, while it runs.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Launches the binary and waits until it is healthy or `start_timeout`
    /// elapses.
    ///
    /// Calling this on a healthy process is a no-op. After a timed out start
    /// the child is left running; calling `start` again resumes waiting for
    /// it, calling [`stop`](Self::stop) kills it.
    ///
    /// The sinks are taken only once the child has been spawned. They are
    /// left in place when the launch fails and handed back when the child
    /// exits before becoming healthy, so a retry writes to the same sinks.
    pub async fn start(
        &mut self,
        stdout: &mut Option<Sink>,
        stderr: &mut Option<Sink>,
    ) -> Result<()> {
        self.start_with_cancellation(stdout, stderr, &CancellationToken::new())
            .await
    }

    /// Like [`start`](Self::start), but also gives up once `cancel` fires,
    /// whichever of the timeout and the cancellation comes first.
    pub async fn start_with_cancellation(
        &mut self,
        stdout: &mut Option<Sink>,
        stderr: &mut Option<Sink>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.lifecycle {
            Lifecycle::Healthy => return Ok(()),
            Lifecycle::Stopping | Lifecycle::Stopped => {
                return Err(Error::Config(format!(
                    "{} has been stopped and cannot be started again",
                    self.name
                )))
            }
            Lifecycle::Uninitialized | Lifecycle::Starting => {}
        }

        let health_check = self.health_check.clone().ok_or_else(|| {
            Error::Config(format!("no health check configured for {}", self.name))
        })?;
        let client = health_check.client()?;

        if self.child.is_none() {
            self.spawn(stdout, stderr)?;
        }
        self.lifecycle = Lifecycle::Starting;

        let name = self.name.clone();
        let timeout = self.start_timeout;
        let deadline = Instant::now() + timeout;
        let healthy = self.wait_healthy(&health_check, client.as_ref());
        let waited = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled { name }),
            waited = tokio::time::timeout_at(deadline, healthy) => {
                waited.unwrap_or_else(|_| Err(Error::Timeout { name, action: "start", timeout }))
            }
        };

        match waited {
            Ok(()) => {
                log::info!("{} is healthy at {}", self.name, health_check.target());
                self.lifecycle = Lifecycle::Healthy;
                Ok(())
            }
            Err(err @ Error::Exited { .. }) => {
                self.child = None;
                self.lifecycle = Lifecycle::Uninitialized;
                if let Some(pump) = self.stdout_pump.take() {
                    *stdout = pump.finish(OUTPUT_DRAIN).await;
                }
                if let Some(pump) = self.stderr_pump.take() {
                    *stderr = pump.finish(OUTPUT_DRAIN).await;
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn spawn(&mut self, stdout: &mut Option<Sink>, stderr: &mut Option<Sink>) -> Result<()> {
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(if stdout.is_some() { Stdio::piped() } else { Stdio::null() })
            .stderr(if stderr.is_some() { Stdio::piped() } else { Stdio::null() })
            .kill_on_drop(true);

        log::info!("launching {}: {} {}", self.name, self.path.display(), self.args.join(" "));
        let mut child = command.spawn().map_err(|source| Error::Launch {
            path: self.path.clone(),
            source,
        })?;

        if let (Some(pipe), Some(sink)) = (child.stdout.take(), stdout.take()) {
            self.stdout_pump = Some(Pump::spawn(pipe, sink));
        }
        if let (Some(pipe), Some(sink)) = (child.stderr.take(), stderr.take()) {
            self.stderr_pump = Some(Pump::spawn(pipe, sink));
        }

        self.child = Some(child);
        Ok(())
    }

    async fn wait_healthy(
        &mut self,
        health_check: &HealthCheck,
        client: Option<&reqwest::Client>,
    ) -> Result<()> {
        loop {
            if health_check.probe(client).await {
                return Ok(());
            }

            if let Some(child) = self.child.as_mut() {
                let exited = child
                    .try_wait()
                    .map_err(|source| Error::io(&self.path, source))?;
                if let Some(status) = exited {
                    return Err(Error::Exited {
                        name: self.name.clone(),
                        status,
                    });
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Terminates the child and waits up to `stop_timeout` for it to exit.
    ///
    /// A no-op if nothing was ever started. If the child ignores SIGTERM it
    /// is killed and a timeout is reported. A temporary working directory is
    /// removed either way.
    pub async fn stop(&mut self) -> Result<()> {
        let idle = self.child.is_none() && self.stdout_pump.is_none() && self.stderr_pump.is_none();
        if self.lifecycle == Lifecycle::Uninitialized && idle {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Stopping;

        let result = match self.child.take() {
            Some(child) => self.terminate(child).await,
            None => Ok(()),
        };

        let pumps = self.stdout_pump.take().into_iter().chain(self.stderr_pump.take());
        Pump::finish_all(pumps, OUTPUT_DRAIN).await;

        if let Some(temp_dir) = self.temp_dir.take() {
            if let Err(err) = temp_dir.close() {
                log::warn!("unable to remove {}: {err}", self.dir.display());
            }
        }

        self.lifecycle = Lifecycle::Stopped;
        result
    }

    async fn terminate(&self, mut child: Child) -> Result<()> {
        if let Err(err) = send_sigterm(&child) {
            log::warn!("unable to signal {}: {err}, killing it", self.name);
            let _ = child.start_kill();
        }

        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("{} exited ({status})", self.name);
                Ok(())
            }
            Ok(Err(err)) => Err(Error::io(&self.path, err)),
            Err(_) => {
                log::warn!(
                    "{} did not exit within {:?}, killing it",
                    self.name,
                    self.stop_timeout
                );
                let _ = child.kill().await;
                Err(Error::Timeout {
                    name: self.name.clone(),
                    action: "stop",
                    timeout: self.stop_timeout,
                })
            }
        }
    }
}

/// Sets the sinks and settings of a supervised server that are still `None`.
pub(crate) fn fill_unset(
    (out, err): (&mut Option<Sink>, &mut Option<Sink>),
    own_settings: &mut Option<Settings>,
    settings: &Settings,
    (default_out, default_err): (Option<Sink>, Option<Sink>),
) {
    if out.is_none() {
        *out = default_out;
    }
    if err.is_none() {
        *err = default_err;
    }
    if own_settings.is_none() {
        *own_settings = Some(settings.clone());
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from),
        // already reaped
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination needs unix signals",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn init_defaults_everything() {
        let state = ProcessState::init("etcd", ProcessOptions::default(), &settings()).unwrap();

        assert!(state.owns_dir());
        assert!(state.dir.is_dir());
        assert_eq!(state.path, bin_path_finder("etcd", &settings()));
        assert_eq!(state.start_timeout, DEFAULT_START_TIMEOUT);
        assert_eq!(state.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert_eq!(state.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(state.lifecycle(), Lifecycle::Uninitialized);
    }

    #[test]
    fn init_prefers_options_then_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            start_timeout: Some(Duration::from_secs(3)),
            stop_timeout: Some(Duration::from_secs(4)),
            ..Default::default()
        };
        let options = ProcessOptions {
            dir: Some(dir.path().to_path_buf()),
            path: Some("/bin/true".into()),
            start_timeout: Some(Duration::from_secs(1)),
            stop_timeout: None,
        };

        let state = ProcessState::init("etcd", options, &settings).unwrap();

        assert!(!state.owns_dir());
        assert_eq!(state.dir, dir.path());
        assert_eq!(state.path, PathBuf::from("/bin/true"));
        assert_eq!(state.start_timeout, Duration::from_secs(1));
        assert_eq!(state.stop_timeout, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let mut state = ProcessState::init("etcd", ProcessOptions::default(), &settings()).unwrap();
        state.stop().await.unwrap();
        state.stop().await.unwrap();
        assert_eq!(state.lifecycle(), Lifecycle::Uninitialized);
    }

    #[tokio::test]
    async fn start_needs_a_health_check() {
        let mut state = ProcessState::init(
            "sleep",
            ProcessOptions {
                path: Some("sleep".into()),
                ..Default::default()
            },
            &settings(),
        )
        .unwrap();

        let err = state.start(&mut None, &mut None).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(state.pid().is_none());
    }

    #[test]
    fn health_check_targets() {
        let url = Url::parse("http://127.0.0.1:6443").unwrap();
        assert_eq!(
            HealthCheck::http(&url, "/healthz").target(),
            "http://127.0.0.1:6443/healthz"
        );
        assert_eq!(HealthCheck::tcp(&url).target(), "tcp://127.0.0.1:6443");
    }
}
