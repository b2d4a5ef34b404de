//! Target locations parsed from the inbound path tail.

use std::fmt;

use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LocationError {
    #[error("unparseable target")]
    Invalid,

    #[error("port number too large: {0}")]
    PortTooLarge(String),
}

/// Absolute http(s) URL with a non-empty hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    url: Url,
}

impl Location {
    /// Parses a target such as `https://host/path`, `//host/path` or `host:443/path`.
    ///
    /// When the scheme is omitted it is `https` for port 443 and `http` otherwise.
    pub fn parse(input: &str) -> Result<Self, LocationError> {
        let candidate = match split_scheme(input) {
            Some((scheme, rest)) => {
                // "http:/host" and "http:host" are rejected instead of being repaired.
                if !rest.starts_with("//") {
                    return Err(LocationError::Invalid);
                }
                format!("{scheme}:{rest}")
            }
            None => {
                let rest = input.strip_prefix("//").unwrap_or(input);
                let scheme = match port_of(authority(rest)) {
                    Some("443") => "https",
                    _ => "http",
                };
                format!("{scheme}://{rest}")
            }
        };

        let after_slashes = candidate
            .split_once("//")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        if let Some(port) = port_of(authority(after_slashes)) {
            if port.len() > 5 || port.parse::<u32>().map_or(true, |p| p > 65535) {
                return Err(LocationError::PortTooLarge(port.to_string()));
            }
        }

        let url = Url::parse(&candidate).map_err(|_| LocationError::Invalid)?;
        Self::from_url(url).ok_or(LocationError::Invalid)
    }

    /// Wraps an already parsed URL, rejecting non-http(s) schemes and empty hosts.
    pub fn from_url(url: Url) -> Option<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => Some(Self { url }),
            _ => None,
        }
    }

    /// Resolves a `Location` response header against this location.
    pub fn resolve(&self, reference: &str) -> Option<Self> {
        self.url.join(reference.trim()).ok().and_then(Self::from_url)
    }

    pub fn href(&self) -> &str {
        self.url.as_str()
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Hostname without brackets around IPv6 literals.
    pub fn hostname(&self) -> &str {
        let host = self.url.host_str().unwrap_or_default();
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.href())
    }
}

fn split_scheme(input: &str) -> Option<(&'static str, &str)> {
    let lower = input.get(..6).unwrap_or(input).to_ascii_lowercase();
    if lower.starts_with("https:") {
        Some(("https", &input[6..]))
    } else if lower.starts_with("http:") {
        Some(("http", &input[5..]))
    } else {
        None
    }
}

fn authority(rest: &str) -> &str {
    rest.split(['/', '?', '#']).next().unwrap_or_default()
}

fn port_of(authority: &str) -> Option<&str> {
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let port = if host_port.starts_with('[') {
        host_port.split_once(']')?.1.strip_prefix(':')?
    } else {
        host_port.rsplit_once(':')?.1
    };
    (!port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())).then_some(port)
}
