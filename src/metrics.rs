use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    api_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    documents_upserted: AtomicU64,
    documents_deleted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub api_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub documents_upserted: u64,
    pub documents_deleted: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_api_request(&self) {
        self.api_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_upserted(&self) {
        self.documents_upserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_deleted(&self, count: u64) {
        self.documents_deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            api_requests: self.api_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            documents_upserted: self.documents_upserted.load(Ordering::Relaxed),
            documents_deleted: self.documents_deleted.load(Ordering::Relaxed),
        }
    }
}

pub fn log_summary(metrics: &Metrics) {
    let snapshot = metrics.snapshot();
    tracing::info!(
        api_requests = snapshot.api_requests,
        cache_hits = snapshot.cache_hits,
        cache_misses = snapshot.cache_misses,
        documents_upserted = snapshot.documents_upserted,
        documents_deleted = snapshot.documents_deleted,
        "run metrics"
    );
}
