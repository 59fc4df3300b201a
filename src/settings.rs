//! Process-wide toggles taken from environment variables.
//!
//! The environment is read exactly once, the first time [`Settings::global`]
//! is called, or whenever a caller explicitly builds a value with
//! [`Settings::from_env`]. Nothing in this crate polls the environment after
//! that.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;

/// Attach control plane stdout/stderr to our own.
pub const ATTACH_OUTPUT_ENV: &str = "KUBEBUILDER_ATTACH_CONTROL_PLANE_OUTPUT";
/// Directory holding the `etcd`, `kine` and `kube-apiserver` binaries.
pub const ASSETS_ENV: &str = "KUBEBUILDER_ASSETS";
pub const START_TIMEOUT_ENV: &str = "KUBEBUILDER_CONTROLPLANE_START_TIMEOUT";
pub const STOP_TIMEOUT_ENV: &str = "KUBEBUILDER_CONTROLPLANE_STOP_TIMEOUT";
/// Selects the datastore backend, `etcd` or `kine`.
pub const DATASTORE_ENV: &str = "TEST_DATASTORE";
/// Prefix of per-binary path overrides, e.g. `TEST_ASSET_KUBE_APISERVER`.
pub const ASSET_ENV_PREFIX: &str = "TEST_ASSET_";

static GLOBAL: Lazy<Settings> = Lazy::new(Settings::from_env);

/// Which datastore backs the API server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatastoreKind {
    #[default]
    Etcd,
    Kine,
}

impl FromStr for DatastoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(Self::Etcd),
            "kine" => Ok(Self::Kine),
            other => Err(format!("unknown datastore {other:?}, expected etcd or kine")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub attach_output: bool,
    pub assets_dir: Option<PathBuf>,
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub datastore: DatastoreKind,
    /// Explicit binary paths keyed by sanitized name (`KUBE_APISERVER`).
    pub asset_overrides: BTreeMap<String, PathBuf>,
}

impl Settings {
    /// The settings of this process, read from the environment on first use.
    pub fn global() -> &'static Settings {
        &GLOBAL
    }

    /// Reads the process environment. Variables whose name or value is not
    /// valid UTF-8 are skipped.
    pub fn from_env() -> Self {
        Self::from_vars(utf8_vars(std::env::vars_os()))
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut settings = Settings::default();

        for (key, value) in vars {
            match key.as_str() {
                ATTACH_OUTPUT_ENV => settings.attach_output = parse_bool(&key, &value),
                ASSETS_ENV if !value.is_empty() => settings.assets_dir = Some(value.into()),
                START_TIMEOUT_ENV => settings.start_timeout = parse_duration(&key, &value),
                STOP_TIMEOUT_ENV => settings.stop_timeout = parse_duration(&key, &value),
                DATASTORE_ENV => match value.parse() {
                    Ok(kind) => settings.datastore = kind,
                    Err(err) => log::warn!("ignoring {key}: {err}"),
                },
                _ => {
                    if let Some(name) = key.strip_prefix(ASSET_ENV_PREFIX) {
                        if !name.is_empty() {
                            settings
                                .asset_overrides
                                .insert(name.to_string(), value.into());
                        }
                    }
                }
            }
        }

        settings
    }
}

fn utf8_vars(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> impl Iterator<Item = (String, String)> {
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) if is_ours(&key) => {
                log::warn!("ignoring {key}: value is not valid UTF-8");
                None
            }
            (Ok(key), Err(_)) => {
                log::debug!("ignoring {key}: value is not valid UTF-8");
                None
            }
            (Err(key), _) => {
                log::debug!("ignoring {}: name is not valid UTF-8", key.to_string_lossy());
                None
            }
        })
}

fn is_ours(key: &str) -> bool {
    const KEYS: &[&str] = &[
        ATTACH_OUTPUT_ENV,
        ASSETS_ENV,
        START_TIMEOUT_ENV,
        STOP_TIMEOUT_ENV,
        DATASTORE_ENV,
    ];
    KEYS.contains(&key) || key.starts_with(ASSET_ENV_PREFIX)
}

fn parse_bool(key: &str, value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => true,
        "" | "0" | "f" | "false" | "no" | "off" => false,
        _ => {
            log::warn!("ignoring {key}={value:?}: not a boolean");
            false
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Option<Duration> {
    match humantime::parse_duration(value.trim()) {
        Ok(duration) => Some(duration),
        Err(err) => {
            log::warn!("ignoring {key}={value:?}: {err}");
            None
        }
    }
}
