use super::{RelayParams, declared_referer, observe, override_referer};
use crate::{
    error::Result,
    hls::{LinkMode, rewrite_document},
    metrics,
    referrer::{self, ReferrerContext},
    relay,
    server::state::AppState,
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::info;
use url::Url;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Fetch a manifest and serve it with every reference routed through the relay
pub async fn serve_playlist(
    State(state): State<AppState>,
    Query(params): Query<RelayParams>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let result = async {
        let target = params.target()?;
        let override_ref = override_referer(params.referer.as_deref(), &target);
        relay_playlist(
            &state,
            &target,
            override_ref,
            declared_referer(&headers),
            state.config.link_mode,
        )
        .await
    }
    .await;
    observe("playlist", start, result)
}

/// Fetch, rewrite and respond for one manifest.
///
/// `mode` selects the link style of the rewritten children.
pub(crate) async fn relay_playlist(
    state: &AppState,
    target: &Url,
    override_ref: Option<Url>,
    declared: Option<Url>,
    mode: LinkMode,
) -> Result<Response> {
    state.policy.check(target)?;

    let ctx = ReferrerContext::new(declared, override_ref, target);
    let decision = referrer::decide(&ctx, target, &state.config.referer_defaults);
    info!(
        "Fetching playlist {} (referer from {})",
        target,
        decision.source.as_str()
    );

    let outbound = relay::outbound_headers(&decision, &state.config.user_agent);
    let response = relay::fetch(state.upstream.as_ref(), target, outbound).await?;
    let cache_control = response
        .headers
        .get(header::CACHE_CONTROL)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("no-cache"));

    let raw = relay::read_manifest(&response.headers, response.body).await?;
    let links = state.links_in(mode);
    // Relative references resolve against the post-redirect URL
    let rewritten = rewrite_document(&raw, &response.url, decision.propagated(), &links)?;
    metrics::record_rewrite(&rewritten.stats);

    info!(
        "Rewrote {} playlist {}: {} playlists, {} segments, {} keys",
        rewritten.kind.as_str(),
        target,
        rewritten.stats.playlists,
        rewritten.stats.segments,
        rewritten.stats.keys
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(PLAYLIST_CONTENT_TYPE)),
            (header::CACHE_CONTROL, cache_control),
        ],
        rewritten.body,
    )
        .into_response())
}
