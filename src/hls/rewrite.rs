//! Line-preserving manifest rewriting.
//!
//! Every reference in the manifest is resolved against the manifest's
//! directory and replaced with a relay link. Everything else, including
//! line endings and the line count, is left byte-for-byte intact.

use crate::error::{RelayError, Result};
use crate::hls::classify::{
    self, LineRole, PlaylistKind, ReferenceRole, classify_document, classify_line,
};
use crate::hls::link::LinkBuilder;
use crate::hls::resolve::{base_directory, is_fetchable, resolve};
use tracing::{debug, warn};
use url::Url;

/// Counters describing one rewrite pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub playlists: usize,
    pub segments: usize,
    pub keys: usize,
    /// Lines left untouched because their reference was unusable
    pub skipped: usize,
    /// Sub-playlists referenced by bare lines rather than directives
    pub bare_playlists: usize,
}

impl RewriteStats {
    fn record(&mut self, role: ReferenceRole) {
        match role {
            ReferenceRole::SubPlaylist => self.playlists += 1,
            ReferenceRole::Segment => self.segments += 1,
            ReferenceRole::Key => self.keys += 1,
        }
    }
}

/// Rewritten document plus what the pass found
#[derive(Debug, Clone)]
pub struct Rewritten {
    pub body: String,
    pub kind: PlaylistKind,
    pub stats: RewriteStats,
}

/// Rewrite `raw`, fetched from `source`, routing every reference through
/// `links`. `referer` is embedded in each link for the next hop.
///
/// # Errors
/// [`RelayError::InvalidPlaylist`] if the document lacks `#EXTM3U`; link
/// building errors (tokenized mode key problems) abort the whole rewrite.
pub fn rewrite(
    raw: &str,
    source: &Url,
    referer: Option<&str>,
    links: &LinkBuilder<'_>,
) -> Result<String> {
    rewrite_document(raw, source, referer, links).map(|rewritten| rewritten.body)
}

/// Same as [`rewrite`] but also reports the playlist kind and counters.
pub fn rewrite_document(
    raw: &str,
    source: &Url,
    referer: Option<&str>,
    links: &LinkBuilder<'_>,
) -> Result<Rewritten> {
    let mut kind = classify_document(raw);
    if kind == PlaylistKind::Invalid {
        return Err(RelayError::InvalidPlaylist);
    }

    let base = base_directory(source);
    let mut stats = RewriteStats::default();
    let mut out = String::with_capacity(raw.len() * 2);
    let mut expect_variant = false;

    for (idx, raw_line) in raw.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let (line, cr) = match raw_line.strip_suffix('\r') {
            Some(line) => (line, "\r"),
            None => (raw_line, ""),
        };

        let rewritten = match classify_line(line) {
            LineRole::Blank => None,
            LineRole::DirectivePlain => {
                if classify::is_stream_variant(line) {
                    expect_variant = true;
                }
                None
            }
            LineRole::DirectiveWithUri => {
                rewrite_directive(line, &base, referer, links, &mut stats)?
            }
            LineRole::BareReference => {
                let after_variant = std::mem::take(&mut expect_variant);
                rewrite_reference(line, &base, referer, links, after_variant, &mut stats)?
            }
        };

        match rewritten {
            Some(line) => {
                out.push_str(&line);
                out.push_str(cr);
            }
            None => out.push_str(raw_line),
        }
    }

    // Bare lines that were already relayed keep their document a master
    if stats.bare_playlists > 0 {
        kind = PlaylistKind::Master;
    }

    debug!(
        kind = kind.as_str(),
        playlists = stats.playlists,
        segments = stats.segments,
        keys = stats.keys,
        skipped = stats.skipped,
        "Rewrote playlist from {}",
        source
    );

    Ok(Rewritten {
        body: out,
        kind,
        stats,
    })
}

/// A manifest reference after resolution against its manifest's directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub absolute_url: Url,
    pub role: ReferenceRole,
}

/// Resolve one reference and derive its role.
///
/// Links `links` itself issued earlier keep the role embedded in them, so a
/// second pass over rewritten output assigns the same roles.
///
/// `Ok(None)` means the reference is unusable and the line must pass through
/// unchanged.
pub fn resolve_reference(
    reference: &str,
    tag: Option<&str>,
    base: &Url,
    after_variant: bool,
    links: &LinkBuilder<'_>,
) -> Result<Option<ResolvedReference>> {
    let target = match resolve(reference, base) {
        Ok(url) => url,
        Err(RelayError::MalformedReference(reason)) => {
            warn!("Leaving unresolvable reference untouched: {}", reason);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if !is_fetchable(&target) {
        debug!("Leaving non-http reference untouched: {}", target.scheme());
        return Ok(None);
    }

    let role = classify::declared_role(tag, after_variant)
        .or_else(|| links.relayed_role(&target))
        .unwrap_or_else(|| classify::inferred_role(&target));
    Ok(Some(ResolvedReference {
        absolute_url: target,
        role,
    }))
}

fn relay_link(
    reference: &str,
    tag: Option<&str>,
    base: &Url,
    referer: Option<&str>,
    links: &LinkBuilder<'_>,
    after_variant: bool,
    stats: &mut RewriteStats,
) -> Result<Option<String>> {
    let Some(resolved) = resolve_reference(reference, tag, base, after_variant, links)? else {
        stats.skipped += 1;
        return Ok(None);
    };
    stats.record(resolved.role);
    if tag.is_none() && resolved.role == ReferenceRole::SubPlaylist {
        stats.bare_playlists += 1;
    }
    links
        .build(&resolved.absolute_url, resolved.role, referer)
        .map(Some)
}

fn rewrite_directive(
    line: &str,
    base: &Url,
    referer: Option<&str>,
    links: &LinkBuilder<'_>,
    stats: &mut RewriteStats,
) -> Result<Option<String>> {
    let Some(span) = classify::uri_attribute(line) else {
        return Ok(None);
    };
    let tag = classify::directive_tag(line);

    let link = relay_link(&line[span.clone()], Some(tag), base, referer, links, false, stats)?;
    Ok(link.map(|link| {
        let mut rewritten = String::with_capacity(line.len() + link.len());
        rewritten.push_str(&line[..span.start]);
        rewritten.push_str(&link);
        rewritten.push_str(&line[span.end..]);
        rewritten
    }))
}

fn rewrite_reference(
    line: &str,
    base: &Url,
    referer: Option<&str>,
    links: &LinkBuilder<'_>,
    after_variant: bool,
    stats: &mut RewriteStats,
) -> Result<Option<String>> {
    relay_link(line, None, base, referer, links, after_variant, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::link::{LinkMode, OPAQUE_ROUTE};
    use crate::token;

    const KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";
    const REF: &str = "https://site.test/";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn master_source() -> Url {
        url("https://origin.test/show/master.m3u8")
    }

    fn media_source() -> Url {
        url("https://origin.test/show/stream_0/playlist.m3u8")
    }

    const MASTER: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nstream_0/playlist.m3u8";

    const MEDIA: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXT-X-TARGETDURATION:10\n\
        #EXT-X-KEY:METHOD=AES-128,URI=\"enc.key\",IV=0x00000000000000000000000000000001\n\
        #EXTINF:10.0,\n\
        seg1.ts\n\
        #EXTINF:10.0,\n\
        /abs/seg2.ts\n\
        #EXT-X-ENDLIST\n";

    /// Route of each relay link in a rewritten document, in order
    fn routes(doc: &str) -> Vec<String> {
        let mut found = Vec::new();
        for line in doc.lines() {
            let link = match classify::uri_attribute(line) {
                Some(span) => &line[span],
                None if !line.starts_with('#') && !line.trim().is_empty() => line,
                None => continue,
            };
            let route_end = link.find('?').unwrap_or(link.len());
            found.push(link[..route_end].to_string());
        }
        found
    }

    /// Decoded `url=` parameter of a transparent link
    fn target_of(link: &str) -> String {
        let query = link.split_once('?').unwrap().1;
        let value = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("url="))
            .unwrap();
        urlencoding::decode(value).unwrap().into_owned()
    }

    #[test]
    fn master_scenario() {
        let links = LinkBuilder::transparent("");
        let out = rewrite(MASTER, &master_source(), Some(REF), &links).unwrap();
        let lines: Vec<&str> = out.split('\n').collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-STREAM-INF:BANDWIDTH=800000");
        assert_eq!(
            lines[2],
            "/m3u8?url=https%3A%2F%2Forigin.test%2Fshow%2Fstream_0%2Fplaylist.m3u8\
             &ref=https%3A%2F%2Fsite.test%2F"
        );
    }

    #[test]
    fn media_scenario_key_and_segment() {
        let links = LinkBuilder::transparent("");
        let out = rewrite(MEDIA, &media_source(), Some(REF), &links).unwrap();
        let lines: Vec<&str> = out.split('\n').collect();

        let key_line = lines[3];
        assert!(key_line.starts_with("#EXT-X-KEY:METHOD=AES-128,URI=\"/key?url="));
        assert!(key_line.ends_with("\",IV=0x00000000000000000000000000000001"));
        let span = classify::uri_attribute(key_line).unwrap();
        assert_eq!(
            target_of(&key_line[span]),
            "https://origin.test/show/stream_0/enc.key"
        );

        assert!(lines[5].starts_with("/proxy?url="));
        assert_eq!(
            target_of(lines[5]),
            "https://origin.test/show/stream_0/seg1.ts"
        );
        assert_eq!(target_of(lines[7]), "https://origin.test/abs/seg2.ts");
    }

    #[test]
    fn untouched_lines_and_count_are_preserved() {
        let links = LinkBuilder::transparent("");
        let out = rewrite(MEDIA, &media_source(), None, &links).unwrap();

        assert_eq!(out.split('\n').count(), MEDIA.split('\n').count());
        assert!(out.ends_with("#EXT-X-ENDLIST\n"));
        for (before, after) in MEDIA.split('\n').zip(out.split('\n')) {
            if before.starts_with('#') && !before.contains("URI=") {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn crlf_line_endings_are_preserved() {
        let doc = "#EXTM3U\r\n#EXTINF:4,\r\nseg.ts\r\n\r\n#EXT-X-ENDLIST\r\n";
        let links = LinkBuilder::transparent("");
        let out = rewrite(doc, &media_source(), None, &links).unwrap();

        assert_eq!(out.matches("\r\n").count(), doc.matches("\r\n").count());
        let seg_line = out.split("\r\n").nth(2).unwrap();
        assert_eq!(
            target_of(seg_line),
            "https://origin.test/show/stream_0/seg.ts"
        );
    }

    #[test]
    fn invalid_document_is_rejected() {
        let links = LinkBuilder::transparent("");
        let err = rewrite("<html></html>", &media_source(), None, &links).unwrap_err();
        assert!(matches!(err, RelayError::InvalidPlaylist));
    }

    #[test]
    fn malformed_reference_passes_through() {
        let doc = "#EXTM3U\n#EXTINF:4,\nhttp://[::1\n#EXTINF:4,\nok.ts\n";
        let links = LinkBuilder::transparent("");
        let rewritten = rewrite_document(doc, &media_source(), None, &links).unwrap();
        let lines: Vec<&str> = rewritten.body.split('\n').collect();

        assert_eq!(lines[2], "http://[::1");
        assert!(lines[4].starts_with("/proxy?url="));
        assert_eq!(rewritten.stats.skipped, 1);
        assert_eq!(rewritten.stats.segments, 1);
    }

    #[test]
    fn non_http_key_uri_passes_through() {
        let doc = "#EXTM3U\n\
            #EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"skd://asset-42\",\
            KEYFORMAT=\"com.apple.streamingkeydelivery\"\n\
            #EXTINF:4,\nseg.ts\n";
        let links = LinkBuilder::transparent("");
        let out = rewrite(doc, &media_source(), None, &links).unwrap();
        assert!(out.contains("URI=\"skd://asset-42\""));
    }

    #[test]
    fn variant_lookahead_survives_intervening_comments() {
        let doc = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n# note\n\napi/stream?id=7\nextra.ts\n";
        let links = LinkBuilder::transparent("");
        let out = rewrite(doc, &master_source(), None, &links).unwrap();
        assert_eq!(routes(&out), vec!["/m3u8", "/proxy"]);
    }

    #[test]
    fn master_directives_route_to_playlists() {
        let doc = "#EXTM3U\n\
            #EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"en\",URI=\"audio/en.m3u8\"\n\
            #EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=86000,URI=\"iframe/index\"\n\
            #EXT-X-STREAM-INF:BANDWIDTH=800000,AUDIO=\"aac\"\n\
            video/low.m3u8\n";
        let links = LinkBuilder::transparent("");
        let out = rewrite(doc, &master_source(), None, &links).unwrap();
        assert_eq!(routes(&out), vec!["/m3u8", "/m3u8", "/m3u8"]);
    }

    #[test]
    fn map_and_parts_route_to_segments() {
        let doc = "#EXTM3U\n\
            #EXT-X-MAP:URI=\"init.mp4\"\n\
            #EXT-X-PART:DURATION=0.5,URI=\"part1.m4s\"\n\
            #EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part2.m4s\"\n\
            #EXT-X-RENDITION-REPORT:URI=\"../stream_1/playlist.m3u8\",LAST-MSN=4\n";
        let links = LinkBuilder::transparent("");
        let out = rewrite(doc, &media_source(), None, &links).unwrap();
        assert_eq!(routes(&out), vec!["/proxy", "/proxy", "/proxy", "/m3u8"]);
    }

    #[test]
    fn idempotent_roles_transparent() {
        for (doc, source) in [(MASTER, master_source()), (MEDIA, media_source())] {
            let links = LinkBuilder::transparent("https://relay.test");
            let once = rewrite(doc, &source, Some(REF), &links).unwrap();
            let twice = rewrite(&once, &source, Some(REF), &links).unwrap();

            assert_eq!(once.split('\n').count(), twice.split('\n').count());
            assert_eq!(routes(&once), routes(&twice));

            // The second pass wraps the first pass's links unchanged
            let first_links: Vec<&str> = once
                .lines()
                .filter(|l| l.starts_with("https://relay.test/"))
                .collect();
            let second_targets: Vec<String> = twice
                .lines()
                .filter(|l| l.starts_with("https://relay.test/"))
                .map(target_of)
                .collect();
            assert_eq!(first_links, second_targets);
        }
    }

    #[test]
    fn idempotent_roles_relative_links() {
        let links = LinkBuilder::transparent("");
        let doc = "#EXTM3U\nbackup.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n";
        let once = rewrite(doc, &master_source(), None, &links).unwrap();
        let twice = rewrite(&once, &master_source(), None, &links).unwrap();
        assert_eq!(routes(&once), vec!["/m3u8", "/m3u8"]);
        assert_eq!(routes(&once), routes(&twice));
    }

    fn token_roles(doc: &str) -> Vec<Option<ReferenceRole>> {
        let mut roles = Vec::new();
        for line in doc.lines() {
            let link = match classify::uri_attribute(line) {
                Some(span) => &line[span],
                None if !line.starts_with('#') && !line.trim().is_empty() => line,
                None => continue,
            };
            let token = link.rsplit('/').next().unwrap();
            roles.push(token::decode_payload(token, KEY).unwrap().role);
        }
        roles
    }

    #[test]
    fn idempotent_roles_tokenized() {
        let links = LinkBuilder::tokenized("https://relay.test", KEY);
        let bare_master = "#EXTM3U\nbackup.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n";
        for (doc, source) in [
            (bare_master, master_source()),
            (MASTER, master_source()),
            (MEDIA, media_source()),
        ] {
            let once = rewrite_document(doc, &source, Some(REF), &links).unwrap();
            let twice = rewrite_document(&once.body, &source, Some(REF), &links).unwrap();

            assert_eq!(once.kind, classify_document(doc));
            assert_eq!(once.kind, twice.kind);
            assert_eq!(token_roles(&once.body), token_roles(&twice.body));
            assert_eq!(once.body.split('\n').count(), twice.body.split('\n').count());
        }
    }

    #[test]
    fn bare_relayed_master_stays_master() {
        let links = LinkBuilder::tokenized("", KEY);
        let doc = "#EXTM3U\nbackup.m3u8\n";
        let once = rewrite_document(doc, &master_source(), None, &links).unwrap();
        assert_eq!(once.kind, PlaylistKind::Master);

        let twice = rewrite_document(&once.body, &master_source(), None, &links).unwrap();
        assert_eq!(twice.kind, PlaylistKind::Master);
        assert_eq!(token_roles(&twice.body), vec![Some(ReferenceRole::SubPlaylist)]);

        // The second token wraps the first pass's link
        let token = twice.body.lines().nth(1).unwrap().rsplit('/').next().unwrap();
        let payload = token::decode_payload(token, KEY).unwrap();
        assert_eq!(
            payload.url,
            format!("https://origin.test{}", once.body.lines().nth(1).unwrap())
        );
    }

    #[test]
    fn undecodable_video_links_fall_through() {
        let links = LinkBuilder::tokenized("", KEY);
        let doc = "#EXTM3U\n#EXTINF:4,\n/video/not-a-token\n";
        let out = rewrite_document(doc, &media_source(), None, &links).unwrap();
        assert_eq!(out.stats.segments, 1);
        assert_eq!(token_roles(&out.body), vec![Some(ReferenceRole::Segment)]);
    }

    #[test]
    fn tokenized_links_hide_targets() {
        let links = LinkBuilder::new("", LinkMode::Tokenized, Some(KEY));
        let out = rewrite(MEDIA, &media_source(), Some(REF), &links).unwrap();
        assert!(!out.contains("origin.test"));

        let seg_line = out.split('\n').nth(5).unwrap();
        let token = seg_line
            .strip_prefix(OPAQUE_ROUTE)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap();
        let payload = token::decode_payload(token, KEY).unwrap();
        assert_eq!(payload.url, "https://origin.test/show/stream_0/seg1.ts");
        assert_eq!(payload.referer.as_deref(), Some(REF));
        assert_eq!(payload.role, Some(ReferenceRole::Segment));
    }

    #[test]
    fn tokenized_key_roles_survive() {
        let links = LinkBuilder::tokenized("", KEY);
        let out = rewrite(MEDIA, &media_source(), None, &links).unwrap();
        let key_line = out.split('\n').nth(3).unwrap();
        let span = classify::uri_attribute(key_line).unwrap();
        let token = key_line[span].strip_prefix("/video/").unwrap();
        let payload = token::decode_payload(token, KEY).unwrap();
        assert_eq!(payload.role, Some(ReferenceRole::Key));
    }

    #[test]
    fn tokenized_bad_key_aborts() {
        let links = LinkBuilder::tokenized("", b"short");
        let err = rewrite(MEDIA, &media_source(), None, &links).unwrap_err();
        assert!(matches!(err, RelayError::InvalidKeyLength(5)));
    }

    #[test]
    fn stats_count_roles() {
        let links = LinkBuilder::transparent("");
        let rewritten = rewrite_document(MEDIA, &media_source(), None, &links).unwrap();
        assert_eq!(rewritten.kind, PlaylistKind::Media);
        assert_eq!(rewritten.stats.keys, 1);
        assert_eq!(rewritten.stats.segments, 2);
        assert_eq!(rewritten.stats.playlists, 0);
    }

    #[test]
    fn resolved_reference_carries_role() {
        let base = base_directory(&media_source());
        let links = LinkBuilder::transparent("");
        let resolved = resolve_reference("enc.key", Some("#EXT-X-KEY"), &base, false, &links)
            .unwrap()
            .unwrap();
        assert_eq!(
            resolved.absolute_url.as_str(),
            "https://origin.test/show/stream_0/enc.key"
        );
        assert_eq!(resolved.role, ReferenceRole::Key);

        assert_eq!(
            resolve_reference("skd://asset", None, &base, false, &links).unwrap(),
            None
        );
    }
}
