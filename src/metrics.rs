use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheLabels {
    pub status: CacheStatus,
}

/// How a cacheable request was satisfied.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    /// Served from a ready entry.
    Hit,
    /// This request built the entry.
    Miss,
    /// Joined another request's build in progress.
    Coalesced,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// The proxy's metric set, bundled with the registry that renders it for
/// `GET /metrics`.
pub struct Metrics {
    registry: Registry,
    pub pack_requests: Family<CacheLabels, Counter>,
    pub pack_build_duration_seconds: Histogram,
    pub lfs_requests: Family<CacheLabels, Counter>,
    pub proxied_requests: Counter,
    pub lock_timeouts: Counter,
    pub protocol_errors: Counter,
    pub upstream_errors: Counter,
}

impl Metrics {
    /// Set up every series against a fresh registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let pack_requests = Family::<CacheLabels, Counter>::default();
        registry.register(
            "gitcdn_pack_requests",
            "Intercepted upload-pack fetches by cache status",
            pack_requests.clone(),
        );

        let pack_build_duration_seconds = Histogram::new(exponential_buckets(0.1, 2.0, 14));
        registry.register(
            "gitcdn_pack_build_duration_seconds",
            "Wall time of git-upload-pack cache builds",
            pack_build_duration_seconds.clone(),
        );

        let lfs_requests = Family::<CacheLabels, Counter>::default();
        registry.register(
            "gitcdn_lfs_requests",
            "LFS object requests by cache status",
            lfs_requests.clone(),
        );

        let proxied_requests = Counter::default();
        registry.register(
            "gitcdn_proxied_requests",
            "Requests passed through to the upstream verbatim",
            proxied_requests.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "gitcdn_lock_timeouts",
            "Cache entry lock acquisitions that exceeded their budget",
            lock_timeouts.clone(),
        );

        let protocol_errors = Counter::default();
        registry.register(
            "gitcdn_protocol_errors",
            "Requests rejected for malformed Git protocol framing",
            protocol_errors.clone(),
        );

        let upstream_errors = Counter::default();
        registry.register(
            "gitcdn_upstream_errors",
            "Upstream failures observed while serving requests",
            upstream_errors.clone(),
        );

        Self {
            registry,
            pack_requests,
            pack_build_duration_seconds,
            lfs_requests,
            proxied_requests,
            lock_timeouts,
            protocol_errors,
            upstream_errors,
        }
    }

    /// OpenMetrics text exposition of everything registered above.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
