use crate::{
    config::Config,
    error::Result,
    hls::{LinkBuilder, LinkMode},
    relay::{HttpUpstream, Upstream},
    server::url_validation::UpstreamPolicy,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Outbound fetcher, a pooled HTTP client in production
    pub upstream: Arc<dyn Upstream>,
    /// SSRF policy for caller-supplied targets
    pub policy: UpstreamPolicy,
    pub started_at: Instant,
    /// Prometheus render handle, absent when the recorder failed to install
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create a new AppState backed by a real HTTP upstream
    pub fn new(config: Config) -> Result<Self> {
        let policy = UpstreamPolicy::new(config.allow_private_upstreams);
        let upstream = HttpUpstream::new(config.upstream_connect_timeout, policy)?;
        Ok(Self::with_upstream(config, Arc::new(upstream)))
    }

    pub fn with_upstream(config: Config, upstream: Arc<dyn Upstream>) -> Self {
        let metrics = match crate::metrics::install() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!("Prometheus recorder not installed: {}", e);
                None
            }
        };

        Self {
            policy: UpstreamPolicy::new(config.allow_private_upstreams),
            config: Arc::new(config),
            upstream,
            started_at: Instant::now(),
            metrics,
        }
    }

    /// Link builder for an explicit mode, sharing the configured base and key
    pub fn links_in(&self, mode: LinkMode) -> LinkBuilder<'_> {
        LinkBuilder::new(
            &self.config.public_base_url,
            mode,
            self.config.secret_key.as_deref(),
        )
    }
}
