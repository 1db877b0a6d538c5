//! Metrics for [super::Queue].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [super::Queue].
#[derive(Default)]
pub(crate) struct Metrics {
    /// Committed entries awaiting dequeue.
    pub items: Gauge,
    /// Committed transactions.
    pub transactions: Counter,
    /// Tentative dequeues reverted by abandoned sessions.
    pub reinstated: Counter,
    /// Data files deleted after draining.
    pub retired: Counter,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "items",
            "Committed entries awaiting dequeue",
            metrics.items.clone(),
        );
        registry.register(
            "transactions",
            "Committed transactions",
            metrics.transactions.clone(),
        );
        registry.register(
            "reinstated",
            "Tentative dequeues reverted by abandoned sessions",
            metrics.reinstated.clone(),
        );
        registry.register(
            "retired",
            "Data files deleted after draining",
            metrics.retired.clone(),
        );
        metrics
    }
}
