use super::{RelayParams, declared_referer, observe, override_referer};
use crate::{
    error::Result,
    hls::ReferenceRole,
    referrer::{self, ReferrerContext},
    relay,
    server::state::AppState,
};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Response,
};
use std::time::Instant;
use tracing::info;
use url::Url;

/// Stream a media segment from upstream to the player
pub async fn serve_segment(
    State(state): State<AppState>,
    Query(params): Query<RelayParams>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let result = serve_transparent(&state, &params, &headers, ReferenceRole::Segment).await;
    observe("segment", start, result)
}

/// Stream a decryption key from upstream to the player
pub async fn serve_key(
    State(state): State<AppState>,
    Query(params): Query<RelayParams>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let result = serve_transparent(&state, &params, &headers, ReferenceRole::Key).await;
    observe("key", start, result)
}

async fn serve_transparent(
    state: &AppState,
    params: &RelayParams,
    headers: &HeaderMap,
    role: ReferenceRole,
) -> Result<Response> {
    let target = params.target()?;
    let override_ref = override_referer(params.referer.as_deref(), &target);
    relay_media(state, &target, role, override_ref, declared_referer(headers)).await
}

/// Fetch `target` and stream it back unmodified.
pub(crate) async fn relay_media(
    state: &AppState,
    target: &Url,
    role: ReferenceRole,
    override_ref: Option<Url>,
    declared: Option<Url>,
) -> Result<Response> {
    state.policy.check(target)?;

    let ctx = ReferrerContext::new(declared, override_ref, target);
    let decision = referrer::decide(&ctx, target, &state.config.referer_defaults);
    info!("Relaying {} {}", role.as_str(), target);

    let outbound = relay::outbound_headers(&decision, &state.config.user_agent);
    let response = relay::fetch(state.upstream.as_ref(), target, outbound).await?;
    Ok(relay::stream_media(response, target, role))
}
