//! # SmartDNS Metrics
//!
//! Process-wide counters plus the HTTP surface that exposes them:
//!
//! - **Counters**: atomics behind a global [`ServerMetrics`] instance
//! - **Endpoints**: `GET /healthz` and `GET /metrics` (plaintext)
//! - **Logging**: tracing subscriber setup in [`tracing_setup`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

pub mod http;
pub mod tracing_setup;

/// Global metrics instance.
static METRICS: OnceCell<ServerMetrics> = OnceCell::new();

/// Gets or initializes the global metrics instance.
pub fn metrics() -> &'static ServerMetrics {
    METRICS.get_or_init(ServerMetrics::new)
}

/// DNS server counters.
pub struct ServerMetrics {
    start_time: Instant,
    requests_total: AtomicU64,
    responses_total: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    zone_reloads: AtomicU64,
}

impl ServerMetrics {
    /// Creates a fresh counter set.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests_total: AtomicU64::new(0),
            responses_total: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            zone_reloads: AtomicU64::new(0),
        }
    }

    /// Returns the server uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Records a received query.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a sent response.
    pub fn record_response(&self) {
        self.responses_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a positive-cache hit.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a positive-cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an accepted zone reload.
    pub fn record_zone_reload(&self) {
        self.zone_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn responses_total(&self) -> u64 {
        self.responses_total.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn zone_reloads(&self) -> u64 {
        self.zone_reloads.load(Ordering::Relaxed)
    }

    /// Renders the counters as Prometheus-style plaintext.
    pub fn render(&self) -> String {
        format!(
            "smartdns_requests_total {}\n\
             smartdns_responses_total {}\n\
             smartdns_cache_hits_total {}\n\
             smartdns_cache_misses_total {}\n\
             smartdns_zone_reloads_total {}\n",
            self.requests_total(),
            self.responses_total(),
            self.cache_hits(),
            self.cache_misses(),
            self.zone_reloads(),
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
