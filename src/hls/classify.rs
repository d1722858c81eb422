//! Syntactic classification of HLS manifests and their lines.

use serde::{Deserialize, Serialize};
use url::Url;

/// Magic marker every playlist must start with
pub const MAGIC_MARKER: &str = "#EXTM3U";

/// Directive whose reference sits on the following line
pub const STREAM_INF: &str = "#EXT-X-STREAM-INF";

/// Directives that mark a document as a master playlist
const MASTER_MARKERS: &[&str] = &[
    "#EXT-X-STREAM-INF",
    "#EXT-X-I-FRAME-STREAM-INF",
    "#EXT-X-MEDIA:",
];

/// Directives whose `URI` attribute names a decryption key
const KEY_TAGS: &[&str] = &["#EXT-X-KEY", "#EXT-X-SESSION-KEY"];

/// Directives whose `URI` attribute names another playlist
const PLAYLIST_TAGS: &[&str] = &[
    "#EXT-X-MEDIA",
    "#EXT-X-I-FRAME-STREAM-INF",
    "#EXT-X-RENDITION-REPORT",
];

/// Whole-document classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    /// References other playlists (variants, renditions)
    Master,
    /// References segments and keys
    Media,
    /// Missing the `#EXTM3U` marker; must not be rewritten
    Invalid,
}

impl PlaylistKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistKind::Master => "master",
            PlaylistKind::Media => "media",
            PlaylistKind::Invalid => "invalid",
        }
    }
}

/// Syntactic role of a single manifest line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRole {
    /// `#` directive carrying an inline `URI="..."` attribute
    DirectiveWithUri,
    /// Any other `#` line, passed through untouched
    DirectivePlain,
    /// Non-comment line naming a segment or playlist
    BareReference,
    /// Empty or whitespace-only
    Blank,
}

/// What a resolved reference points at, which picks its proxy route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceRole {
    #[serde(rename = "playlist")]
    SubPlaylist,
    Segment,
    Key,
}

impl ReferenceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceRole::SubPlaylist => "playlist",
            ReferenceRole::Segment => "segment",
            ReferenceRole::Key => "key",
        }
    }

    pub fn is_manifest(&self) -> bool {
        matches!(self, ReferenceRole::SubPlaylist)
    }
}

/// Classify a whole document as master, media, or invalid.
pub fn classify_document(doc: &str) -> PlaylistKind {
    let doc = doc.strip_prefix('\u{feff}').unwrap_or(doc);

    let first = doc.lines().map(str::trim).find(|line| !line.is_empty());
    if first != Some(MAGIC_MARKER) {
        return PlaylistKind::Invalid;
    }

    let is_master = doc.lines().map(str::trim).any(|line| {
        if line.starts_with('#') {
            MASTER_MARKERS.iter().any(|marker| line.starts_with(marker))
        } else {
            !line.is_empty() && has_playlist_extension(strip_query(line))
        }
    });

    if is_master {
        PlaylistKind::Master
    } else {
        PlaylistKind::Media
    }
}

/// Classify one line (without its line terminator).
pub fn classify_line(line: &str) -> LineRole {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        LineRole::Blank
    } else if trimmed.starts_with('#') {
        if uri_attribute(line).is_some() {
            LineRole::DirectiveWithUri
        } else {
            LineRole::DirectivePlain
        }
    } else {
        LineRole::BareReference
    }
}

/// Byte range of the quoted `URI="..."` value inside a directive line.
///
/// The attribute name must directly follow `:` or `,`, so vendor attributes
/// such as `X-ASSET-URI` are not mistaken for it.
pub fn uri_attribute(line: &str) -> Option<std::ops::Range<usize>> {
    const NEEDLE: &str = "URI=\"";

    let mut from = 0;
    while let Some(pos) = line[from..].find(NEEDLE) {
        let start = from + pos;
        let preceded_ok = line[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c == ':' || c == ',');
        let value_start = start + NEEDLE.len();

        if preceded_ok {
            let len = line[value_start..].find('"')?;
            return Some(value_start..value_start + len);
        }
        from = value_start;
    }
    None
}

/// Directive name of a `#` line, e.g. `#EXT-X-KEY` for `#EXT-X-KEY:METHOD=...`
pub fn directive_tag(line: &str) -> &str {
    let line = line.trim_start();
    match line.find(':') {
        Some(idx) => &line[..idx],
        None => line.trim_end(),
    }
}

/// True if the directive line announces a variant stream on the next line
pub fn is_stream_variant(line: &str) -> bool {
    directive_tag(line) == STREAM_INF
}

/// Decide the role of a resolved reference.
///
/// `tag` is the directive carrying the reference, `None` for bare lines.
/// `after_variant` is set when the bare line follows `#EXT-X-STREAM-INF`.
pub fn reference_role(tag: Option<&str>, url: &Url, after_variant: bool) -> ReferenceRole {
    declared_role(tag, after_variant).unwrap_or_else(|| inferred_role(url))
}

/// Role fixed by the manifest's structure alone, if any
pub fn declared_role(tag: Option<&str>, after_variant: bool) -> Option<ReferenceRole> {
    if let Some(tag) = tag {
        if KEY_TAGS.contains(&tag) {
            return Some(ReferenceRole::Key);
        }
        if PLAYLIST_TAGS.contains(&tag) {
            return Some(ReferenceRole::SubPlaylist);
        }
    }
    after_variant.then_some(ReferenceRole::SubPlaylist)
}

/// Role guessed from the reference URL itself
pub fn inferred_role(url: &Url) -> ReferenceRole {
    let last_segment = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");

    // Links already pointing at this relay keep the role of their route
    if let Some(role) = crate::hls::link::role_for_route(last_segment) {
        return role;
    }

    if has_playlist_extension(last_segment) {
        ReferenceRole::SubPlaylist
    } else if extension(last_segment).is_some_and(|ext| ext.eq_ignore_ascii_case("key")) {
        ReferenceRole::Key
    } else {
        ReferenceRole::Segment
    }
}

/// Lower-level extension lookup on a path or file name
pub fn extension(path: &str) -> Option<&str> {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
}

fn has_playlist_extension(path: &str) -> bool {
    extension(path)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("m3u8") || ext.eq_ignore_ascii_case("m3u"))
}

fn strip_query(reference: &str) -> &str {
    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    &reference[..end]
}
