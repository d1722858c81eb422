//! Upstream fetching and response relaying.
//!
//! The relay never retries: a failed fetch is surfaced to the caller with the
//! upstream status and a short excerpt of the error body.

use crate::error::{RelayError, Result};
use crate::hls::ReferenceRole;
use crate::hls::classify::extension;
use crate::referrer::RefererDecision;
use crate::server::url_validation::UpstreamPolicy;
use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::{Client, redirect};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Upper bound on the upstream error body echoed back to clients
pub const ERROR_EXCERPT_LIMIT: usize = 200;

/// Cache policy when the upstream sends none for media
pub const DEFAULT_MEDIA_CACHE_CONTROL: &str = "public, max-age=86400";

/// Largest manifest body buffered for rewriting
pub const MAX_MANIFEST_BYTES: usize = 4 * 1024 * 1024;

/// Redirect hops followed before giving up
pub const MAX_REDIRECTS: usize = 10;

pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
    "AppleWebKit/537.36 (KHTML, like Gecko) ",
    "Chrome/124.0.0.0 Safari/537.36"
);

/// Streamed upstream body
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// Response head and streaming body from an upstream fetch
pub struct UpstreamResponse {
    /// Final URL after redirects; relative manifest references resolve here
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Capability to GET a URL with the given headers
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Issue the request and return as soon as the response head arrives.
    ///
    /// Non-2xx statuses are returned as responses, not errors; only transport
    /// failures yield [`RelayError::UpstreamUnreachable`].
    async fn fetch(&self, url: &Url, headers: HeaderMap) -> Result<UpstreamResponse>;
}

/// [`Upstream`] backed by a pooled reqwest client
#[derive(Clone, Debug)]
pub struct HttpUpstream {
    client: Client,
}

impl HttpUpstream {
    /// Build the client. Every redirect hop is checked against `policy`.
    pub fn new(connect_timeout: Duration, policy: UpstreamPolicy) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(connect_timeout)
            .redirect(redirect_policy(policy))
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, url: &Url, headers: HeaderMap) -> Result<UpstreamResponse> {
        let response = self
            .client
            .get(url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if let Some(blocked) = blocked_redirect(&e) {
                    warn!("Refused redirect from {}: {}", url, blocked);
                    return blocked;
                }
                warn!("HTTP fetch failed for {}: {}", url, e);
                RelayError::UpstreamUnreachable(e.to_string())
            })?;

        let final_url = response.url().clone();
        if final_url != *url {
            debug!("Upstream {} redirected to {}", url, final_url);
        }
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| RelayError::UpstreamUnreachable(e.to_string())))
            .boxed();

        Ok(UpstreamResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }
}

fn redirect_policy(policy: UpstreamPolicy) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error(RelayError::UpstreamUnreachable(format!(
                "more than {MAX_REDIRECTS} redirects"
            )));
        }
        let checked = policy.check(attempt.url());
        match checked {
            Ok(()) => attempt.follow(),
            Err(e) => attempt.error(e),
        }
    })
}

/// The policy rejection behind a refused redirect, if that is what failed
fn blocked_redirect(e: &reqwest::Error) -> Option<RelayError> {
    if !e.is_redirect() {
        return None;
    }
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(RelayError::BlockedUpstream(reason)) = err.downcast_ref::<RelayError>() {
            return Some(RelayError::BlockedUpstream(reason.clone()));
        }
        source = err.source();
    }
    None
}

/// Headers presented on the outbound request
pub fn outbound_headers(decision: &RefererDecision, user_agent: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );

    for (name, value) in [
        (header::USER_AGENT, user_agent),
        (header::REFERER, decision.referer.as_str()),
        (header::ORIGIN, decision.origin.as_str()),
    ] {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => warn!("Skipping unrepresentable {} header", name),
        }
    }
    headers
}

/// Fetch `url` and require a 2xx status.
///
/// # Errors
/// [`RelayError::UpstreamFetchFailed`] with a bounded body excerpt on non-2xx,
/// [`RelayError::UpstreamUnreachable`] on transport failure.
pub async fn fetch(
    upstream: &dyn Upstream,
    url: &Url,
    headers: HeaderMap,
) -> Result<UpstreamResponse> {
    let response = upstream.fetch(url, headers).await?;
    debug!("Upstream {} answered {}", url, response.status);

    if response.status.is_success() {
        return Ok(response);
    }

    let status = response.status.as_u16();
    let excerpt = read_excerpt(response.body, ERROR_EXCERPT_LIMIT).await;
    warn!("Upstream {} returned {}: {}", url, status, excerpt);
    Err(RelayError::UpstreamFetchFailed { status, excerpt })
}

async fn read_excerpt(mut body: BodyStream, limit: usize) -> String {
    let mut buf = Vec::with_capacity(limit);
    while buf.len() < limit {
        match body.next().await {
            Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
            Some(Err(_)) | None => break,
        }
    }
    buf.truncate(limit);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Buffer a manifest body as text.
///
/// Invalid UTF-8 is replaced rather than rejected.
///
/// # Errors
/// [`RelayError::InvalidPlaylist`] once the declared or received length
/// exceeds [`MAX_MANIFEST_BYTES`]; nothing past the limit is read.
pub async fn read_manifest(headers: &HeaderMap, mut body: BodyStream) -> Result<String> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(len) = declared.filter(|len| *len > MAX_MANIFEST_BYTES as u64) {
        warn!("Refusing manifest of {} bytes", len);
        return Err(RelayError::InvalidPlaylist);
    }

    let mut buf = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > MAX_MANIFEST_BYTES {
            warn!("Manifest body exceeds {} bytes", MAX_MANIFEST_BYTES);
            return Err(RelayError::InvalidPlaylist);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(match String::from_utf8(buf) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

/// Content type to assume when the upstream does not send one
pub fn default_content_type(url: &Url, role: ReferenceRole) -> &'static str {
    let ext = extension(url.path()).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        Some("m4a") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("mp3") => "audio/mpeg",
        Some("webm") => "video/webm",
        Some("vtt") => "text/vtt",
        Some("m3u8") | Some("m3u") => "application/vnd.apple.mpegurl",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ if role == ReferenceRole::Segment => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// Stream a segment or key through to the client unmodified.
pub fn stream_media(response: UpstreamResponse, url: &Url, role: ReferenceRole) -> Response {
    let mut headers = HeaderMap::new();

    let content_type = response
        .headers
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(default_content_type(url, role)));
    headers.insert(header::CONTENT_TYPE, content_type);

    if let Some(length) = response.headers.get(header::CONTENT_LENGTH) {
        headers.insert(header::CONTENT_LENGTH, length.clone());
    }

    let cache_control = response
        .headers
        .get(header::CACHE_CONTROL)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_MEDIA_CACHE_CONTROL));
    headers.insert(header::CACHE_CONTROL, cache_control);

    (response.status, headers, Body::from_stream(response.body)).into_response()
}
