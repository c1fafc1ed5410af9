//! Prometheus instruments for the cache.
//!
//! Handles are cheap clones sharing one atomic; register them once into the
//! daemon's registry.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    pub hits: Counter,
    pub misses: Counter,
    pub blob_fetches: Counter,
    pub peer_fetches: Counter,
    pub drained: Counter,
    pub orphaned: Counter,
    pub evicted_bytes: Counter,
    pub used_bytes: Gauge,
    pub drain_queue_depth: Gauge,
}

impl CacheMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "odrive_cache_hits",
            "Reads served from the local partition",
            self.hits.clone(),
        );
        registry.register(
            "odrive_cache_misses",
            "Reads that required materialization",
            self.misses.clone(),
        );
        registry.register(
            "odrive_cache_blob_fetches",
            "Misses satisfied from the blob backend",
            self.blob_fetches.clone(),
        );
        registry.register(
            "odrive_cache_peer_fetches",
            "Misses satisfied from a peer",
            self.peer_fetches.clone(),
        );
        registry.register(
            "odrive_cache_drained",
            "Ciphertexts uploaded to the blob backend",
            self.drained.clone(),
        );
        registry.register(
            "odrive_cache_orphaned",
            "Ciphertexts parked after drain retries ran out",
            self.orphaned.clone(),
        );
        registry.register(
            "odrive_cache_evicted_bytes",
            "Bytes removed by the eviction walker",
            self.evicted_bytes.clone(),
        );
        registry.register(
            "odrive_cache_used_bytes",
            "Bytes held in the partition",
            self.used_bytes.clone(),
        );
        registry.register(
            "odrive_cache_drain_queue_depth",
            "Ids waiting for or undergoing drain",
            self.drain_queue_depth.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn registered_metrics_encode() {
        let mut registry = Registry::default();
        let m = CacheMetrics::default();
        m.register(&mut registry);
        m.hits.inc();
        m.used_bytes.set(42);

        let mut body = String::new();
        encode(&mut body, &registry).unwrap();
        assert!(body.contains("odrive_cache_hits_total 1"));
        assert!(body.contains("odrive_cache_used_bytes 42"));
    }
}
