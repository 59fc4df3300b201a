//! Free port discovery for servers whose address the caller did not pin.

use std::collections::HashMap;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use url::Url;

use crate::error::{Error, Result};

/// Host used when the caller does not name one.
pub const LOCALHOST: &str = "127.0.0.1";

/// How long a suggested port is held back from further suggestions.
const PORT_REUSE_DELAY: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: usize = 16;

static HANDED_OUT: Lazy<Mutex<HashMap<u16, Instant>>> = Lazy::new(Default::default);

/// Suggests a free port on `host`, returning the port and the resolved host.
///
/// The port is found by binding to port 0 and reading back what the OS
/// assigned, after which the listener is dropped again. Nothing stops another
/// process from grabbing the port before the real server binds it; this is
/// only meant for test environments and is not retried.
///
/// Ports handed out by this process in the last minute are skipped, so two
/// servers configured back to back never get the same suggestion.
pub fn suggest(host: &str) -> Result<(u16, String)> {
    let host = if host.is_empty() { LOCALHOST } else { host };

    let allocation_error = |source| Error::Allocation {
        host: host.to_string(),
        source,
    };

    // listeners stay bound until we return so the OS cannot hand the same
    // port back on the next attempt
    let mut held = Vec::new();
    for _ in 0..MAX_ATTEMPTS {
        let listener = TcpListener::bind((host, 0)).map_err(allocation_error)?;
        let addr = listener.local_addr().map_err(allocation_error)?;

        if reserve(addr.port()) {
            return Ok((addr.port(), addr.ip().to_string()));
        }
        held.push(listener);
    }

    Err(allocation_error(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no unreserved port after {MAX_ATTEMPTS} attempts"),
    )))
}

/// A `scheme://host:port` URL on a suggested loopback port.
pub fn suggest_url(scheme: &str) -> Result<Url> {
    let (port, host) = suggest("")?;
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host
    };
    Url::parse(&format!("{scheme}://{host}:{port}"))
        .map_err(|err| Error::Config(format!("invalid {scheme} URL for {host}:{port}: {err}")))
}

/// Checks that a caller-provided URL names a host and a port, and uses
/// `scheme` when one is required.
pub(crate) fn check_url(url: &Url, what: &str, scheme: Option<&str>) -> Result<()> {
    if let Some(scheme) = scheme {
        if url.scheme() != scheme {
            return Err(Error::Config(format!("{what} URL {url} must use {scheme}://")));
        }
    }
    if url.host_str().is_none() || url.port_or_known_default().is_none() {
        return Err(Error::Config(format!("{what} URL {url} must name a host and port")));
    }
    Ok(())
}

fn reserve(port: u16) -> bool {
    let now = Instant::now();
    let mut handed_out = HANDED_OUT.lock();
    handed_out.retain(|_, at| now.duration_since(*at) < PORT_REUSE_DELAY);

    if handed_out.contains_key(&port) {
        return false;
    }
    handed_out.insert(port, now);
    true
}
