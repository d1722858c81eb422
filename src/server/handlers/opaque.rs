use super::{RelayParams, declared_referer, observe, override_referer, parse_target};
use crate::{
    error::{RelayError, Result},
    hls::{LinkMode, classify::reference_role},
    server::{
        handlers::{playlist::relay_playlist, segment::relay_media},
        state::AppState,
    },
    token,
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Response,
};
use std::time::Instant;
use tracing::debug;

/// Resolve an opaque `/video/{token}` link and relay its target.
///
/// Manifests reached this way always get tokenized children, whatever the
/// configured link mode.
pub async fn serve_opaque(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(params): Query<RelayParams>,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let result = async {
        let key = state
            .config
            .secret_key
            .as_deref()
            .ok_or(RelayError::MissingKey)?;
        let payload = token::decode_payload(&token, key)?;
        let target = parse_target(&payload.url)?;

        let explicit = payload.referer.as_deref().or(params.referer.as_deref());
        let override_ref = override_referer(explicit, &target);
        let role = payload
            .role
            .unwrap_or_else(|| reference_role(None, &target, false));
        debug!("Opaque token resolved to {} {}", role.as_str(), target);

        let declared = declared_referer(&headers);
        if role.is_manifest() {
            relay_playlist(&state, &target, override_ref, declared, LinkMode::Tokenized).await
        } else {
            relay_media(&state, &target, role, override_ref, declared).await
        }
    }
    .await;
    observe("opaque", start, result)
}
