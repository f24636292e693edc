//! Process-wide monotonic counters.
//!
//! A deliberately small registry: named `AtomicU64` counters, incremented by
//! the streams and dumped through tracing on shutdown. There is no exporter —
//! the counters exist so operators (and tests) can observe failover, shed and
//! fallback events without a metrics server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;

/// Well-known counter names. Streams may also register ad-hoc names, but
/// everything asserted on in tests lives here.
pub mod names {
    pub const PROVIDER_FAILOVERS_TOTAL: &str = "provider_failovers_total";
    pub const PROMPT_FALLBACK_TOTAL: &str = "prompt_fallback_total";
    pub const MESSAGES_UNPERSISTED_TOTAL: &str = "messages_unpersisted_total";
    pub const ENRICHMENT_SHED_TOTAL: &str = "enrichment_shed_total";
    pub const QUEUE_SHED_TOTAL: &str = "queue_shed_total";
    pub const GATE_MALFORMED_TOTAL: &str = "gatekeeper_malformed_total";
    pub const PLANS_INVALID_TOTAL: &str = "plans_invalid_total";
    pub const TASKS_TIMED_OUT_TOTAL: &str = "tasks_timed_out_total";
    pub const RESEARCH_REJECTED_TOTAL: &str = "research_rejected_total";
    pub const REPLIES_SENT_TOTAL: &str = "replies_sent_total";
    pub const REPLIES_APOLOGIZED_TOTAL: &str = "replies_apologized_total";
}

fn registry() -> &'static DashMap<&'static str, AtomicU64> {
    static REGISTRY: OnceLock<DashMap<&'static str, AtomicU64>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Increment a counter by one.
pub fn incr(name: &'static str) {
    add(name, 1);
}

/// Increment a counter by `n`.
pub fn add(name: &'static str, n: u64) {
    registry()
        .entry(name)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(n, Ordering::Relaxed);
}

/// Current value of a counter (0 when never touched).
pub fn get(name: &str) -> u64 {
    registry()
        .get(name)
        .map(|c| c.load(Ordering::Relaxed))
        .unwrap_or(0)
}

/// Snapshot all counters, sorted by name for deterministic output.
pub fn snapshot() -> Vec<(&'static str, u64)> {
    let mut out: Vec<(&'static str, u64)> = registry()
        .iter()
        .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
        .collect();
    out.sort_by_key(|(name, _)| *name);
    out
}

/// Log every non-zero counter at info level.
pub fn log_snapshot() {
    for (name, value) in snapshot() {
        if value > 0 {
            tracing::info!(counter = name, value, "metric");
        }
    }
}
