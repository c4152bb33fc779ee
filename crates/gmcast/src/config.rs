//! `gmcast://` URL configuration.
//!
//! `gmcast://<host>[:<port>]?gmcast.group=<name>[&gmcast.listen_addr=<tcp-url>]`
//!
//! A wildcard host (empty, `0.0.0.0`, `::`, `[::]`) disables the initial
//! seed dial and leaves the node in pure listener mode. The listen port is
//! taken from the `gmcast.listen_addr` option, then the main URL's port,
//! then the default.

use thiserror::Error;

use gmcast_core::addr::TCP_SCHEME;
use gmcast_core::{Addr, AddrError};

/// URL scheme this layer is configured by.
pub const GMCAST_SCHEME: &str = "gmcast";
/// Port used when neither the URL nor the listen option names one.
pub const DEFAULT_PORT: u16 = 4567;

pub const OPT_GROUP: &str = "gmcast.group";
pub const OPT_LISTEN_ADDR: &str = "gmcast.listen_addr";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid URL scheme in '{0}': expected gmcast://")]
    Scheme(String),
    #[error("malformed URL '{0}'")]
    Malformed(String),
    #[error("group not defined in URL '{0}'")]
    GroupMissing(String),
    #[error("initial address '{addr}': {source}")]
    InitialAddr { addr: String, source: AddrError },
    #[error("listen address '{addr}': {source}")]
    ListenAddr { addr: String, source: AddrError },
}

#[derive(Debug, Clone)]
pub struct GmcastConfig {
    pub group: String,
    /// Resolved, canonical endpoint we bind.
    pub listen_addr: Addr,
    /// Resolved seed peer; `None` in pure listener mode.
    pub initial_addr: Option<Addr>,
}

impl GmcastConfig {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ConfigError::Malformed(uri.to_string()))?;
        if scheme != GMCAST_SCHEME {
            return Err(ConfigError::Scheme(uri.to_string()));
        }

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, q),
            None => (rest, ""),
        };

        let mut group = None;
        let mut listen_option = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(uri.to_string()))?;
            match key {
                OPT_GROUP => group = Some(value.to_string()),
                OPT_LISTEN_ADDR => listen_option = Some(value.to_string()),
                _ => tracing::debug!(option = key, "ignoring unknown URL option"),
            }
        }
        let group = group.ok_or_else(|| ConfigError::GroupMissing(uri.to_string()))?;

        let (host, authority_port) = split_host_port(authority)
            .ok_or_else(|| ConfigError::Malformed(uri.to_string()))?;

        let initial_addr = if is_wildcard_host(&host) {
            None
        } else {
            let port = authority_port.unwrap_or(DEFAULT_PORT);
            let addr =
                Addr::resolve(&host, port).map_err(|source| ConfigError::InitialAddr {
                    addr: format!("{host}:{port}"),
                    source,
                })?;
            Some(addr)
        };

        let listen_raw = listen_option.unwrap_or_else(|| format!("{TCP_SCHEME}://0.0.0.0"));
        let listen_rest = listen_raw
            .strip_prefix(TCP_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| ConfigError::ListenAddr {
                addr: listen_raw.clone(),
                source: AddrError::Scheme(listen_raw.clone()),
            })?;
        let (listen_host, listen_port) =
            split_host_port(listen_rest).ok_or_else(|| ConfigError::ListenAddr {
                addr: listen_raw.clone(),
                source: AddrError::Malformed(listen_raw.clone()),
            })?;
        let listen_port = listen_port.or(authority_port).unwrap_or(DEFAULT_PORT);
        let listen_addr = Addr::resolve(&listen_host, listen_port).map_err(|source| {
            ConfigError::ListenAddr {
                addr: listen_raw.clone(),
                source,
            }
        })?;

        Ok(Self {
            group,
            listen_addr,
            initial_addr,
        })
    }
}

fn is_wildcard_host(host: &str) -> bool {
    matches!(host, "" | "0.0.0.0" | "::" | "[::]")
}

/// Split `host[:port]`, tolerating bracketed and bare IPv6 literals.
fn split_host_port(s: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = s.strip_prefix('[') {
        // [v6]:port or [v6]
        let (host, tail) = rest.split_once(']')?;
        return match tail {
            "" => Some((format!("[{host}]"), None)),
            _ => {
                let port = tail.strip_prefix(':')?.parse().ok()?;
                Some((format!("[{host}]"), Some(port)))
            }
        };
    }
    if s.matches(':').count() > 1 {
        // Bare IPv6 literal, no port.
        return Some((s.to_string(), None));
    }
    match s.split_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), Some(port)))
        }
        None => Some((s.to_string(), None)),
    }
}
