use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, RelayError>;

/// Every failure a relay request can end in.
///
/// All variants are terminal for the request that raised them. The only
/// exception is [`RelayError::MalformedReference`] inside the rewrite engine,
/// where the offending line is passed through and rewriting continues.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed reference: {0}")]
    MalformedReference(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Upstream target not allowed: {0}")]
    BlockedUpstream(String),

    #[error("Document is not a valid HLS playlist")]
    InvalidPlaylist,

    #[error("Secret key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Secret key is not configured")]
    MissingKey,

    #[error("Token is too short to contain an IV")]
    TruncatedToken,

    #[error("Token could not be decrypted")]
    DecryptionFailed,

    #[error("Token payload is malformed: {0}")]
    MalformedPayload(String),

    #[error("Upstream returned {status}")]
    UpstreamFetchFailed { status: u16, excerpt: String },

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// HTTP status surfaced to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::MalformedReference(_)
            | RelayError::MissingParameter(_)
            | RelayError::TruncatedToken
            | RelayError::DecryptionFailed
            | RelayError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            RelayError::BlockedUpstream(_) => StatusCode::FORBIDDEN,
            RelayError::InvalidPlaylist
            | RelayError::UpstreamFetchFailed { .. }
            | RelayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            RelayError::InvalidKeyLength(_) | RelayError::MissingKey | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-friendly label, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::MalformedReference(_) => "malformed_reference",
            RelayError::MissingParameter(_) => "missing_parameter",
            RelayError::BlockedUpstream(_) => "blocked_upstream",
            RelayError::InvalidPlaylist => "invalid_playlist",
            RelayError::InvalidKeyLength(_) => "invalid_key_length",
            RelayError::MissingKey => "missing_key",
            RelayError::TruncatedToken => "truncated_token",
            RelayError::DecryptionFailed => "decryption_failed",
            RelayError::MalformedPayload(_) => "malformed_payload",
            RelayError::UpstreamFetchFailed { .. } => "upstream_fetch_failed",
            RelayError::UpstreamUnreachable(_) => "upstream_unreachable",
            RelayError::Internal(_) => "internal",
        }
    }

    /// True for the three token-decoding failures
    pub fn is_token_error(&self) -> bool {
        matches!(
            self,
            RelayError::TruncatedToken
                | RelayError::DecryptionFailed
                | RelayError::MalformedPayload(_)
        )
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!(kind = self.kind(), "Request failed: {}", self);
        } else {
            warn!(kind = self.kind(), "Request rejected: {}", self);
        }

        let body = match &self {
            RelayError::UpstreamFetchFailed { status, excerpt } => json!({
                "error": "Failed to fetch from upstream server",
                "status": status,
                "details": excerpt,
            }),
            // Token errors share one client-facing message; the exact cause
            // is only visible in logs.
            e if e.is_token_error() => json!({ "error": "Invalid token" }),
            RelayError::InvalidKeyLength(_) | RelayError::MissingKey => {
                json!({ "error": "Server configuration error" })
            }
            RelayError::Internal(_) => json!({ "error": "Internal server error" }),
            other => json!({ "error": other.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
