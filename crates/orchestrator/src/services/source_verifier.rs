//! Fetch-and-record verification of cited sources.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::config::VerificationMode;

/// Outcome of checking one cited URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verified: bool,
    pub note: Option<String>,
}

impl Verification {
    pub fn verified() -> Self {
        Self {
            verified: true,
            note: None,
        }
    }

    pub fn unverified(note: impl Into<String>) -> Self {
        Self {
            verified: false,
            note: Some(note.into()),
        }
    }
}

/// Checks a cited source. Failures are recorded on the source, never raised.
#[async_trait]
pub trait SourceVerifier: Send + Sync {
    async fn verify(&self, url: &str, version: Option<&str>) -> Verification;
}

pub struct HttpSourceVerifier {
    client: Client,
    timeout: Duration,
    match_version: bool,
}

impl HttpSourceVerifier {
    pub fn new(mode: VerificationMode, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
            match_version: mode == VerificationMode::FetchAndMatchVersion,
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl SourceVerifier for HttpSourceVerifier {
    async fn verify(&self, url: &str, version: Option<&str>) -> Verification {
        if !is_http_url(url) {
            return Verification::unverified("not an http(s) URL");
        }

        let response = match self.client.get(url).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Source fetch failed");
                return Verification::unverified(format!("fetch failed: {}", e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Verification::unverified(format!("HTTP {}", status.as_u16()));
        }

        let version = match version.map(str::trim) {
            Some(v) if self.match_version && !v.is_empty() => v,
            _ => return Verification::verified(),
        };

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Verification::unverified(format!("unreadable body: {}", e)),
        };

        match version_pattern(version) {
            Some(pattern) if pattern.is_match(&body) => Verification::verified(),
            Some(_) => Verification::unverified(format!("page does not mention version {}", version)),
            None => Verification::unverified(format!("unusable version literal '{}'", version)),
        }
    }
}

pub(crate) fn is_http_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("https://") || url.starts_with("http://")
}

/// Matches a version literal as a whole dotted component: `16` matches
/// `v16` and `16.2` but not `116`.
pub(crate) fn version_pattern(version: &str) -> Option<Regex> {
    let literal = version.trim().trim_start_matches(['v', 'V']);
    if literal.is_empty() {
        return None;
    }
    Regex::new(&format!(
        r"(?:^|[^0-9.]){}(?:$|[^0-9])",
        regex::escape(literal)
    ))
    .ok()
}
