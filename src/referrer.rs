//! Referer/Origin selection for outbound fetches.
//!
//! Precedence, highest first:
//! 1. explicit per-request override (`ref` parameter or token payload)
//! 2. per-host default from the quirk table
//! 3. the caller's own `Referer` header
//! 4. the target's own origin
//!
//! Hosts with a canonical origin in the table always get that origin,
//! whichever referer wins.

use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

/// Referer value configured for a quirky host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum HostReferer {
    /// Use the target URL itself as referer (`"self"` in config)
    Target,
    /// Always send this referer
    Fixed(Url),
}

impl TryFrom<String> for HostReferer {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("self") {
            return Ok(HostReferer::Target);
        }
        Url::parse(&value)
            .map(HostReferer::Fixed)
            .map_err(|e| format!("invalid referer '{value}': {e}"))
    }
}

/// One entry of the per-host quirk table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostDefault {
    pub referer: HostReferer,
    /// Canonical `Origin` header this host insists on
    #[serde(default)]
    pub origin: Option<String>,
}

/// Read-only hostname → [`HostDefault`] table
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct HostDefaults(HashMap<String, HostDefault>);

impl HostDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the `REFERER_DEFAULTS` JSON object.
    ///
    /// ```json
    /// {"hls.example.com": {"referer": "self", "origin": "https://hls.example.com"}}
    /// ```
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let parsed: HashMap<String, HostDefault> = serde_json::from_str(raw)?;
        Ok(Self(
            parsed
                .into_iter()
                .map(|(host, entry)| (host.to_ascii_lowercase(), entry))
                .collect(),
        ))
    }

    pub fn insert(&mut self, host: &str, entry: HostDefault) {
        self.0.insert(host.to_ascii_lowercase(), entry);
    }

    pub fn get(&self, host: &str) -> Option<&HostDefault> {
        self.0.get(&host.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-request referrer inputs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferrerContext {
    /// Caller's inbound `Referer` header
    pub declared: Option<Url>,
    /// Explicit instruction from the caller (`ref` parameter or token)
    pub override_referer: Option<Url>,
    /// Host of the URL about to be fetched
    pub target_host: String,
}

impl ReferrerContext {
    pub fn new(declared: Option<Url>, override_referer: Option<Url>, target: &Url) -> Self {
        Self {
            declared,
            override_referer,
            target_host: target.host_str().unwrap_or_default().to_ascii_lowercase(),
        }
    }
}

/// Which precedence rule picked the referer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefererSource {
    Override,
    HostDefault,
    Declared,
    TargetOrigin,
}

impl RefererSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefererSource::Override => "override",
            RefererSource::HostDefault => "host_default",
            RefererSource::Declared => "declared",
            RefererSource::TargetOrigin => "target_origin",
        }
    }
}

/// Headers to present on the next-hop fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefererDecision {
    pub referer: String,
    pub origin: String,
    pub source: RefererSource,
}

impl RefererDecision {
    /// Referer to embed in rewritten links.
    ///
    /// Host defaults are not propagated: the next hop re-derives them for
    /// its own host.
    pub fn propagated(&self) -> Option<&str> {
        match self.source {
            RefererSource::HostDefault => None,
            _ => Some(&self.referer),
        }
    }
}

/// Decide the `Referer` and `Origin` headers for fetching `target`.
pub fn decide(ctx: &ReferrerContext, target: &Url, defaults: &HostDefaults) -> RefererDecision {
    let host_entry = defaults.get(&ctx.target_host);

    let (referer, source) = if let Some(url) = &ctx.override_referer {
        (url.to_string(), RefererSource::Override)
    } else if let Some(entry) = host_entry {
        let referer = match &entry.referer {
            HostReferer::Target => target.to_string(),
            HostReferer::Fixed(url) => url.to_string(),
        };
        (referer, RefererSource::HostDefault)
    } else if let Some(url) = &ctx.declared {
        (url.to_string(), RefererSource::Declared)
    } else {
        (format!("{}/", origin_of_url(target)), RefererSource::TargetOrigin)
    };

    let origin = match host_entry.and_then(|entry| entry.origin.as_deref()) {
        Some(canonical) => canonical.trim_end_matches('/').to_string(),
        None => origin_of(&referer).unwrap_or_else(|| origin_of_url(target)),
    };

    RefererDecision {
        referer,
        origin,
        source,
    }
}

fn origin_of(referer: &str) -> Option<String> {
    Url::parse(referer).ok().map(|url| origin_of_url(&url))
}

fn origin_of_url(url: &Url) -> String {
    url.origin().ascii_serialization()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn quirky_defaults() -> HostDefaults {
        HostDefaults::from_json(
            r#"{
                "HLS.Quirky.test": {"referer": "self", "origin": "https://hls.quirky.test/"},
                "cdn.fixed.test": {"referer": "https://portal.fixed.test/player"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn falls_back_to_target_origin() {
        let target = url("https://origin.test:8443/show/master.m3u8");
        let ctx = ReferrerContext::new(None, None, &target);
        let decision = decide(&ctx, &target, &HostDefaults::new());

        assert_eq!(decision.referer, "https://origin.test:8443/");
        assert_eq!(decision.origin, "https://origin.test:8443");
        assert_eq!(decision.source, RefererSource::TargetOrigin);
    }

    #[test]
    fn declared_beats_fallback() {
        let target = url("https://origin.test/a.m3u8");
        let ctx = ReferrerContext::new(Some(url("https://player.test/watch/1")), None, &target);
        let decision = decide(&ctx, &target, &HostDefaults::new());

        assert_eq!(decision.referer, "https://player.test/watch/1");
        assert_eq!(decision.origin, "https://player.test");
        assert_eq!(decision.source, RefererSource::Declared);
    }

    #[test]
    fn host_default_beats_declared() {
        let target = url("https://cdn.fixed.test/v/seg.ts");
        let ctx = ReferrerContext::new(Some(url("https://player.test/")), None, &target);
        let decision = decide(&ctx, &target, &quirky_defaults());

        assert_eq!(decision.referer, "https://portal.fixed.test/player");
        assert_eq!(decision.origin, "https://portal.fixed.test");
        assert_eq!(decision.source, RefererSource::HostDefault);
    }

    #[test]
    fn override_beats_everything() {
        let target = url("https://cdn.fixed.test/v/seg.ts");
        let ctx = ReferrerContext::new(
            Some(url("https://player.test/")),
            Some(url("https://site.test/embed")),
            &target,
        );
        let decision = decide(&ctx, &target, &quirky_defaults());

        assert_eq!(decision.referer, "https://site.test/embed");
        assert_eq!(decision.origin, "https://site.test");
        assert_eq!(decision.source, RefererSource::Override);
    }

    #[test]
    fn self_referer_uses_target_url() {
        let target = url("https://hls.quirky.test/manifest/abc/master.m3u8");
        let ctx = ReferrerContext::new(None, None, &target);
        let decision = decide(&ctx, &target, &quirky_defaults());

        assert_eq!(decision.referer, target.as_str());
        assert_eq!(decision.origin, "https://hls.quirky.test");
    }

    #[test]
    fn canonical_origin_survives_override() {
        let target = url("https://hls.quirky.test/seg/1.ts");
        let ctx = ReferrerContext::new(None, Some(url("https://elsewhere.test/page")), &target);
        let decision = decide(&ctx, &target, &quirky_defaults());

        assert_eq!(decision.referer, "https://elsewhere.test/page");
        assert_eq!(decision.origin, "https://hls.quirky.test");
    }

    #[test]
    fn host_lookup_is_case_insensitive() {
        let defaults = quirky_defaults();
        assert!(defaults.get("hls.quirky.test").is_some());
        assert!(defaults.get("HLS.QUIRKY.TEST").is_some());
        assert_eq!(defaults.len(), 2);
    }

    #[test]
    fn decision_is_deterministic() {
        let target = url("https://origin.test/show/master.m3u8");
        let ctx = ReferrerContext::new(Some(url("https://player.test/")), None, &target);
        assert_eq!(
            decide(&ctx, &target, &quirky_defaults()),
            decide(&ctx, &target, &quirky_defaults())
        );
    }

    #[test]
    fn host_defaults_are_not_propagated() {
        let target = url("https://cdn.fixed.test/v/master.m3u8");
        let ctx = ReferrerContext::new(None, None, &target);
        assert_eq!(decide(&ctx, &target, &quirky_defaults()).propagated(), None);

        let ctx = ReferrerContext::new(None, Some(url("https://site.test/")), &target);
        assert_eq!(
            decide(&ctx, &target, &quirky_defaults()).propagated(),
            Some("https://site.test/")
        );
    }

    #[test]
    fn invalid_table_entry_is_rejected() {
        let err = HostDefaults::from_json(r#"{"a.test": {"referer": "not a url"}}"#);
        assert!(err.is_err());
    }
}
