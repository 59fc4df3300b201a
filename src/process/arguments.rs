//! Layered command line arguments for server processes.
//!
//! A server's final argument list is assembled from, lowest priority first:
//!
//! 1. minimal defaults the server cannot run without,
//! 2. defaults computed from the server's current configuration,
//! 3. flags set by the caller through [`Arguments`],
//! 4. legacy template strings, rendered against the server's configuration
//!    and appended verbatim.
//!
//! Layers 1-3 are keyed by flag name, so each name appears once and the
//! higher layer wins. A flag name used by a legacy template removes that
//! name from layers 1-3 entirely, but repeated template flags are all kept.

use std::collections::{BTreeMap, BTreeSet};

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use url::Url;

use crate::error::{Error, Result};

/// Flag name to values, as used for the default layers.
pub type FlagMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Flag {
    /// Rendered once per value, or as a bare `--flag` when empty.
    Values(Vec<String>),
    /// Suppresses the flag even if a default layer sets it.
    Disabled,
}

/// Flags configured by the caller, keyed by name without leading dashes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Arguments {
    flags: BTreeMap<String, Flag>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all values of `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.flags.insert(key.into(), Flag::Values(vec![value.into()]));
        self
    }

    /// Adds another value for `key`, e.g. for repeatable flags.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        match self.flags.entry(key.into()) {
            std::collections::btree_map::Entry::Occupied(mut entry) => match entry.get_mut() {
                Flag::Values(values) => values.push(value.into()),
                disabled @ Flag::Disabled => *disabled = Flag::Values(vec![value.into()]),
            },
            std::collections::btree_map::Entry::Vacant(entry) => {
                entry.insert(Flag::Values(vec![value.into()]));
            }
        }
        self
    }

    /// Sets `key` as a bare flag without a value.
    pub fn enable(&mut self, key: impl Into<String>) -> &mut Self {
        self.flags.insert(key.into(), Flag::Values(Vec::new()));
        self
    }

    /// Keeps `key` out of the rendered list, even if a default sets it.
    pub fn disable(&mut self, key: impl Into<String>) -> &mut Self {
        self.flags.insert(key.into(), Flag::Disabled);
        self
    }

    /// The configured values of `key`, `None` if unset or disabled.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        match self.flags.get(key)? {
            Flag::Values(values) => Some(values),
            Flag::Disabled => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Renders these flags over `defaults` as `--flag=value` strings, ordered
    /// by flag name.
    pub fn as_strings(&self, defaults: &FlagMap) -> Vec<String> {
        let names: BTreeSet<&String> = self.flags.keys().chain(defaults.keys()).collect();

        let mut rendered = Vec::new();
        for name in names {
            let values = match self.flags.get(name) {
                Some(Flag::Values(values)) => values,
                Some(Flag::Disabled) => continue,
                None => &defaults[name],
            };

            if values.is_empty() {
                rendered.push(format!("--{name}"));
            }
            for value in values {
                rendered.push(format!("--{name}={value}"));
            }
        }
        rendered
    }

    fn without(&self, names: &BTreeSet<String>) -> Self {
        Self {
            flags: self
                .flags
                .iter()
                .filter(|(name, _)| !names.contains(*name))
                .map(|(name, flag)| (name.clone(), flag.clone()))
                .collect(),
        }
    }
}

/// Everything the default layers need to render a server's arguments.
pub struct TemplateDefaults<'a, D> {
    /// The fully defaulted server configuration that templates see.
    pub data: &'a D,
    pub defaults: FlagMap,
    pub minimal_defaults: FlagMap,
}

/// Merges all argument layers into the final argument list.
pub fn template_and_arguments<D: Serialize>(
    templates: &[String],
    configured: &Arguments,
    defaults: TemplateDefaults<'_, D>,
) -> Result<Vec<String>> {
    let rendered = render_templates(templates, defaults.data)?;
    let overridden: BTreeSet<String> = rendered
        .iter()
        .filter_map(|arg| flag_name(arg))
        .map(str::to_string)
        .collect();

    let mut layered = defaults.minimal_defaults;
    layered.extend(defaults.defaults);
    layered.retain(|name, _| !overridden.contains(name));

    let mut args = configured.without(&overridden).as_strings(&layered);
    args.extend(rendered);
    Ok(args)
}

/// Renders each template against `data`. Unknown fields are an error.
pub fn render_templates<D: Serialize>(templates: &[String], data: &D) -> Result<Vec<String>> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    templates
        .iter()
        .map(|template| {
            env.render_str(template, data)
                .map_err(|source| Error::Template {
                    template: template.clone(),
                    source,
                })
        })
        .collect()
}

/// The flag name of `--name=value`, `--name` or `-n`; `None` for values.
fn flag_name(arg: &str) -> Option<&str> {
    let stripped = arg
        .strip_prefix("--")
        .or_else(|| arg.strip_prefix('-'))?;
    let name = stripped.split('=').next().unwrap_or_default();
    (!name.is_empty()).then_some(name)
}

/// The template view of a URL.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateUrl {
    /// The full URL.
    pub string: String,
    pub scheme: String,
    /// `hostname:port`
    pub host: String,
    pub hostname: String,
    pub port: Option<u16>,
}

impl From<&Url> for TemplateUrl {
    fn from(url: &Url) -> Self {
        let hostname = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default();
        Self {
            string: url_string(url),
            scheme: url.scheme().to_string(),
            host: match port {
                Some(port) => format!("{hostname}:{port}"),
                None => hostname.clone(),
            },
            hostname,
            port,
        }
    }
}

/// Formats `url` without the trailing `/` that [`Url`] adds to bare
/// origins; servers such as etcd reject listen URLs with a path.
pub fn url_string(url: &Url) -> String {
    let mut formatted = url.to_string();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        formatted.pop();
    }
    formatted
}

/// Builds a [`FlagMap`] from `(name, value)` pairs.
pub(crate) fn flag_map<'a>(pairs: impl IntoIterator<Item = (&'a str, String)>) -> FlagMap {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), vec![value]))
        .collect()
}
