//! Reference resolution against a manifest's base directory.
//!
//! Resolution follows RFC 3986 via [`Url::join`]: absolute references come
//! back unchanged, `/`-rooted references replace the path, and dot segments
//! are removed.

use crate::error::{RelayError, Result};
use url::Url;

/// Directory URL containing `source`, with query and fragment stripped.
///
/// The result always ends with `/` so relative references land inside it.
pub fn base_directory(source: &Url) -> Url {
    let mut base = source.clone();
    base.set_query(None);
    base.set_fragment(None);

    let dir = match base.path().rfind('/') {
        Some(idx) => base.path()[..=idx].to_string(),
        None => "/".to_string(),
    };
    base.set_path(&dir);
    base
}

/// Resolve a manifest reference against `base_directory`.
///
/// # Errors
/// Returns [`RelayError::MalformedReference`] for empty references or ones
/// the URL parser rejects.
pub fn resolve(reference: &str, base_directory: &Url) -> Result<Url> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(RelayError::MalformedReference(
            "empty reference".to_string(),
        ));
    }

    base_directory
        .join(reference)
        .map_err(|e| RelayError::MalformedReference(format!("{reference}: {e}")))
}

/// True when the URL can be fetched by the relay (http or https)
pub fn is_fetchable(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}
