//! Outbound link construction for rewritten manifest references.

use crate::error::{RelayError, Result};
use crate::hls::classify::{self, ReferenceRole};
use crate::token::{self, TokenPayload};
use url::Url;

/// Route serving rewritten sub-playlists
pub const PLAYLIST_ROUTE: &str = "/m3u8";
/// Route streaming media segments
pub const SEGMENT_ROUTE: &str = "/proxy";
/// Route streaming decryption keys
pub const KEY_ROUTE: &str = "/key";
/// Route accepting opaque tokens as its last path segment
pub const OPAQUE_ROUTE: &str = "/video";

/// How rewritten references expose their targets to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// `?url=...&ref=...` query links; the target is visible to the client
    Transparent,
    /// `/video/<token>` links; target and referer are encrypted
    Tokenized,
}

impl LinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkMode::Transparent => "transparent",
            LinkMode::Tokenized => "tokenized",
        }
    }
}

/// Route path serving the given role in transparent mode
pub fn route_for(role: ReferenceRole) -> &'static str {
    match role {
        ReferenceRole::SubPlaylist => PLAYLIST_ROUTE,
        ReferenceRole::Segment => SEGMENT_ROUTE,
        ReferenceRole::Key => KEY_ROUTE,
    }
}

/// Inverse of [`route_for`], keyed by the route's last path segment
pub fn role_for_route(segment: &str) -> Option<ReferenceRole> {
    [
        ReferenceRole::SubPlaylist,
        ReferenceRole::Segment,
        ReferenceRole::Key,
    ]
    .into_iter()
    .find(|role| route_for(*role).trim_start_matches('/') == segment)
}

/// Builds the relay URL that replaces an origin reference.
///
/// `public_base` is the externally visible prefix of the relay, e.g.
/// `https://relay.example.com`. An empty base yields root-relative links.
#[derive(Debug, Clone)]
pub struct LinkBuilder<'a> {
    public_base: &'a str,
    mode: LinkMode,
    key: Option<&'a [u8]>,
}

impl<'a> LinkBuilder<'a> {
    pub fn new(public_base: &'a str, mode: LinkMode, key: Option<&'a [u8]>) -> Self {
        Self {
            public_base: public_base.trim_end_matches('/'),
            mode,
            key,
        }
    }

    /// Transparent-mode builder; never needs a key
    pub fn transparent(public_base: &'a str) -> Self {
        Self::new(public_base, LinkMode::Transparent, None)
    }

    /// Tokenized-mode builder encrypting with `key`
    pub fn tokenized(public_base: &'a str, key: &'a [u8]) -> Self {
        Self::new(public_base, LinkMode::Tokenized, Some(key))
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    /// Build the outbound link for `target`.
    ///
    /// # Errors
    /// In tokenized mode, fails with [`RelayError::MissingKey`] or
    /// [`RelayError::InvalidKeyLength`] when the key is unusable.
    pub fn build(
        &self,
        target: &Url,
        role: ReferenceRole,
        referer: Option<&str>,
    ) -> Result<String> {
        match self.mode {
            LinkMode::Transparent => {
                let mut link = format!(
                    "{}{}?url={}",
                    self.public_base,
                    route_for(role),
                    urlencoding::encode(target.as_str())
                );
                if let Some(referer) = referer {
                    link.push_str("&ref=");
                    link.push_str(&urlencoding::encode(referer));
                }
                Ok(link)
            }
            LinkMode::Tokenized => {
                let key = self.key.ok_or(RelayError::MissingKey)?;
                let payload = TokenPayload {
                    url: target.to_string(),
                    referer: referer.map(str::to_string),
                    role: Some(role),
                };
                let token = token::encode_payload(&payload, key)?;
                Ok(format!("{}{}/{}", self.public_base, OPAQUE_ROUTE, token))
            }
        }
    }

    /// Role carried by an opaque link issued under this builder's key.
    ///
    /// `None` when `url` is not a `/video/<token>` link, the builder has no
    /// key, or the token does not decode.
    pub fn relayed_role(&self, url: &Url) -> Option<ReferenceRole> {
        let key = self.key?;
        let mut segments = url.path_segments()?;
        let token = segments.next_back()?;
        if segments.next_back()? != OPAQUE_ROUTE.trim_start_matches('/') {
            return None;
        }

        let payload = token::decode_payload(token, key).ok()?;
        // Tokens minted before roles were embedded fall back to the target
        payload.role.or_else(|| {
            Url::parse(&payload.url)
                .ok()
                .map(|target| classify::inferred_role(&target))
        })
    }
}
