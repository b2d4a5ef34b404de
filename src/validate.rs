//! Hostname validation for the forwarding surface.
//!
//! Requests whose target hostname is neither a public domain nor an IP
//! literal (`/favicon.ico`, `/robots.txt`, ...) are never forwarded.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use once_cell::sync::Lazy;

use crate::suffixes::PUBLIC_SUFFIXES;

static SUFFIXES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| PUBLIC_SUFFIXES.iter().copied().collect());

/// Returns true if `hostname` ends in a known public suffix or is an IP literal.
pub fn is_valid_host(hostname: &str) -> bool {
    let bare = hostname
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(hostname);

    if bare.parse::<Ipv4Addr>().is_ok() || bare.parse::<Ipv6Addr>().is_ok() {
        return true;
    }

    match hostname.rsplit_once('.') {
        Some((_, suffix)) => SUFFIXES.contains(suffix.to_ascii_lowercase().as_str()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_public_domains_case_insensitively() {
        assert!(is_valid_host("example.com"));
        assert!(is_valid_host("Example.COM"));
        assert!(is_valid_host("cdn.video.example.co"));
        assert!(is_valid_host("stream.xn--p1ai"));
    }

    #[test]
    fn rejects_unknown_suffixes_and_bare_names() {
        assert!(!is_valid_host("favicon.ico"));
        assert!(!is_valid_host("robots.txt"));
        assert!(!is_valid_host("localhost"));
        assert!(!is_valid_host("com"));
        assert!(!is_valid_host("m3u8-proxy"));
        assert!(!is_valid_host(""));
    }

    #[test]
    fn accepts_ip_literals() {
        assert!(is_valid_host("127.0.0.1"));
        assert!(is_valid_host("10.1.2.3"));
        assert!(is_valid_host("::1"));
        assert!(is_valid_host("[2001:db8::1]"));
        assert!(!is_valid_host("999.1.1.1"));
    }
}
