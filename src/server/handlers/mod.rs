pub mod health;
pub mod opaque;
pub mod playlist;
pub mod segment;

use crate::{
    error::{RelayError, Result},
    metrics,
};
use axum::{
    http::{HeaderMap, header},
    response::Response,
};
use serde::Deserialize;
use std::time::Instant;
use tracing::debug;
use url::Url;

/// Query parameters shared by the transparent routes
#[derive(Debug, Default, Deserialize)]
pub struct RelayParams {
    /// Absolute upstream URL
    pub url: Option<String>,
    /// Referer override for this hop
    #[serde(rename = "ref")]
    pub referer: Option<String>,
}

impl RelayParams {
    pub(crate) fn target(&self) -> Result<Url> {
        let raw = self
            .url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or(RelayError::MissingParameter("url"))?;
        parse_target(raw)
    }
}

pub(crate) fn parse_target(raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|e| RelayError::MalformedReference(format!("{raw}: {e}")))
}

/// Explicit referer override for fetching `target`.
///
/// The caller's `ref` wins; otherwise a `ref` pair inside the target URL's
/// own query is honoured. Values that are not absolute URLs are ignored.
pub(crate) fn override_referer(explicit: Option<&str>, target: &Url) -> Option<Url> {
    let embedded = || {
        target
            .query_pairs()
            .find(|(k, _)| k == "ref")
            .map(|(_, v)| v.into_owned())
    };
    let raw = explicit
        .filter(|r| !r.trim().is_empty())
        .map(str::to_string)
        .or_else(embedded)?;

    match Url::parse(raw.trim()) {
        Ok(url) if crate::hls::resolve::is_fetchable(&url) => Some(url),
        _ => {
            debug!("Ignoring unusable referer override '{}'", raw);
            None
        }
    }
}

/// The caller's own `Referer` header, if it is an absolute URL
pub(crate) fn declared_referer(headers: &HeaderMap) -> Option<Url> {
    headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Url::parse(v).ok())
}

/// Record request metrics for a finished handler.
pub(crate) fn observe(
    endpoint: &'static str,
    start: Instant,
    result: Result<Response>,
) -> Result<Response> {
    let status = match &result {
        Ok(response) => response.status().as_u16(),
        Err(e) => {
            if matches!(
                e,
                RelayError::UpstreamFetchFailed { .. } | RelayError::UpstreamUnreachable(_)
            ) {
                metrics::record_upstream_error();
            }
            if e.is_token_error() {
                metrics::record_token_failure(e.kind());
            }
            e.status_code().as_u16()
        }
    };
    metrics::record_request(endpoint, status);
    metrics::record_duration(endpoint, start);
    result
}
