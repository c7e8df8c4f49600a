//! Rule-set fetching.
//!
//! Remote imports and the background syncer read rule files through the
//! [`Fetch`] trait, so the parsing pipeline can be driven from memory in tests.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{AclError, FetchErrorKind, Result};

/// Default timeout for a whole rule-set download
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("acl-router/", env!("CARGO_PKG_VERSION"));

/// Source of rule-set bytes.
pub trait Fetch: Send + Sync {
    /// GET the resource and return a streaming body.
    fn get(&self, url: &str) -> Result<Box<dyn Read>>;
}

/// HTTP(S) fetcher backed by its own ureq agent.
///
/// Connection pooling and any session state live in the agent owned by this
/// value; nothing is shared process-wide.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    /// Create a fetcher with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_FETCH_TIMEOUT)
    }

    /// Create a fetcher with a custom global timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetch for HttpFetcher {
    fn get(&self, url: &str) -> Result<Box<dyn Read>> {
        validate_url(url)?;
        let response = self
            .agent
            .get(url)
            .header("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| map_ureq_error(url, e))?;
        let (_, body) = response.into_parts();
        Ok(Box::new(body.into_reader()))
    }
}

/// In-memory fetcher keyed by URL.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    entries: RwLock<HashMap<String, String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body for a URL
    pub fn with(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<String>) {
        self.entries.write().insert(url.into(), body.into());
    }
}

impl Fetch for StaticFetcher {
    fn get(&self, url: &str) -> Result<Box<dyn Read>> {
        let body = self
            .entries
            .read()
            .get(url)
            .cloned()
            .ok_or_else(|| AclError::fetch(FetchErrorKind::Status, format!("{url}: HTTP 404")))?;
        Ok(Box::new(Cursor::new(body.into_bytes())))
    }
}

fn validate_url(url: &str) -> Result<()> {
    let lower = url.trim().to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(())
    } else {
        Err(AclError::fetch(
            FetchErrorKind::InvalidUrl,
            format!("unsupported URL: {url}"),
        ))
    }
}

fn map_ureq_error(url: &str, err: ureq::Error) -> AclError {
    let kind = match &err {
        ureq::Error::StatusCode(_) => FetchErrorKind::Status,
        ureq::Error::Io(_) => FetchErrorKind::Io,
        ureq::Error::BadUri(_) => FetchErrorKind::InvalidUrl,
        _ => FetchErrorKind::Transport,
    };
    AclError::fetch(kind, format!("{url}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_fetcher_hit_and_miss() {
        let fetcher = StaticFetcher::new().with("https://a/list.acl", "[proxy_all]\n");
        let mut body = String::new();
        fetcher
            .get("https://a/list.acl")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "[proxy_all]\n");

        match fetcher.get("https://a/missing.acl") {
            Err(AclError::Fetch { kind, .. }) => assert_eq!(kind, FetchErrorKind::Status),
            other => panic!("expected fetch error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_http_fetcher_rejects_other_schemes() {
        let fetcher = HttpFetcher::new();
        match fetcher.get("file:///etc/passwd") {
            Err(AclError::Fetch { kind, .. }) => assert_eq!(kind, FetchErrorKind::InvalidUrl),
            other => panic!("expected invalid url, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_validate_url_accepts_http_and_https() {
        assert!(validate_url("http://example.com/a.acl").is_ok());
        assert!(validate_url("HTTPS://example.com/a.acl").is_ok());
        assert!(validate_url("ftp://example.com/a.acl").is_err());
    }
}
