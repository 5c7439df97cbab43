//! Site-URL normalization for instance registration.
//!
//! A registered URL is reduced to its origin; anything unusable parks the
//! instance in `pending_url` with a machine-readable reason instead of
//! rejecting the sync.

use url::Url;

/// Reason: URL missing or empty.
pub const PENDING_URL_MISSING: &str = "pending_url_missing";
/// Reason: URL did not parse.
pub const PENDING_URL_INVALID: &str = "pending_url_invalid";
/// Reason: scheme other than http/https.
pub const PENDING_URL_INVALID_PROTOCOL: &str = "pending_url_invalid_protocol";
/// Reason: the placeholder `example.com` host was never changed.
pub const PENDING_URL_DEFAULT_EXAMPLE: &str = "pending_url_default_example";
/// Reason: loopback or link-local host.
pub const PENDING_URL_LOCALHOST: &str = "pending_url_localhost";

/// Outcome of normalizing a submitted site URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSiteUrl {
    /// Origin (`scheme://host[:port]`) when usable.
    pub url: Option<String>,
    /// Why the URL is unusable, when it is.
    pub pending_reason: Option<&'static str>,
}

impl NormalizedSiteUrl {
    fn usable(url: String) -> Self {
        Self {
            url: Some(url),
            pending_reason: None,
        }
    }

    fn pending(reason: &'static str) -> Self {
        Self {
            url: None,
            pending_reason: Some(reason),
        }
    }
}

fn is_local_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host == "localhost"
        || host == "127.0.0.1"
        || host == "::1"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host.starts_with("127.")
}

/// Normalizes a submitted site URL to its origin.
#[must_use]
pub fn normalize_site_url(raw: Option<&str>) -> NormalizedSiteUrl {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return NormalizedSiteUrl::pending(PENDING_URL_MISSING);
    };

    let Ok(parsed) = Url::parse(raw) else {
        return NormalizedSiteUrl::pending(PENDING_URL_INVALID);
    };

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return NormalizedSiteUrl::pending(PENDING_URL_INVALID_PROTOCOL);
    }

    let Some(host) = parsed.host_str() else {
        return NormalizedSiteUrl::pending(PENDING_URL_INVALID);
    };
    let host = host.to_ascii_lowercase();

    if host == "example.com" {
        return NormalizedSiteUrl::pending(PENDING_URL_DEFAULT_EXAMPLE);
    }
    if is_local_host(&host) {
        return NormalizedSiteUrl::pending(PENDING_URL_LOCALHOST);
    }

    let origin = match parsed.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    };
    NormalizedSiteUrl::usable(origin)
}
