//! Metrics collection for observability
//!
//! Each [`Metrics`] owns its registry so that independent ledgers (one per
//! test case, for instance) never collide on registration.
//!
//! # Metrics
//!
//! - `coin_ledger_operations_total` - Ledger operations by kind and outcome
//! - `coin_ledger_apply_duration_seconds` - Histogram of apply latencies
//! - `coin_ledger_compensations_total` - Reversing credits after failed transfers
//! - `coin_router_events_total` - Routed events by envelope and outcome
//! - `coin_reconciliation_sweeps_total` - Completed reconciliation sweeps
//! - `coin_reconciliation_mismatches_total` - Accounts whose balance disagreed with the ledger
//! - `coin_quarantined_accounts` - Accounts currently quarantined

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Ledger operations by kind and outcome
    pub operations_total: IntCounterVec,

    /// Apply duration histogram
    pub apply_duration: Histogram,

    /// Reversing credits written after a failed transfer leg
    pub compensations_total: IntCounter,

    /// Routed events by envelope and outcome
    pub router_events_total: IntCounterVec,

    /// Reconciliation sweeps
    pub reconciliation_sweeps: IntCounter,

    /// Reconciliation balance mismatches
    pub reconciliation_mismatches: IntCounter,

    /// Currently quarantined accounts
    pub quarantined_accounts: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let operations_total = IntCounterVec::new(
            Opts::new(
                "coin_ledger_operations_total",
                "Ledger operations by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let apply_duration = Histogram::with_opts(
            HistogramOpts::new(
                "coin_ledger_apply_duration_seconds",
                "Histogram of apply latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(apply_duration.clone()))?;

        let compensations_total = IntCounter::new(
            "coin_ledger_compensations_total",
            "Reversing credits written after a failed transfer leg",
        )?;
        registry.register(Box::new(compensations_total.clone()))?;

        let router_events_total = IntCounterVec::new(
            Opts::new(
                "coin_router_events_total",
                "Routed events by envelope and outcome",
            ),
            &["envelope", "outcome"],
        )?;
        registry.register(Box::new(router_events_total.clone()))?;

        let reconciliation_sweeps = IntCounter::new(
            "coin_reconciliation_sweeps_total",
            "Completed reconciliation sweeps",
        )?;
        registry.register(Box::new(reconciliation_sweeps.clone()))?;

        let reconciliation_mismatches = IntCounter::new(
            "coin_reconciliation_mismatches_total",
            "Accounts whose balance disagreed with the ledger",
        )?;
        registry.register(Box::new(reconciliation_mismatches.clone()))?;

        let quarantined_accounts = IntGauge::new(
            "coin_quarantined_accounts",
            "Accounts currently quarantined",
        )?;
        registry.register(Box::new(quarantined_accounts.clone()))?;

        Ok(Self {
            operations_total,
            apply_duration,
            compensations_total,
            router_events_total,
            reconciliation_sweeps,
            reconciliation_mismatches,
            quarantined_accounts,
            registry,
        })
    }

    /// Record a ledger operation outcome
    pub fn record_operation(&self, kind: &str, outcome: &str) {
        self.operations_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    /// Record a routed event outcome
    pub fn record_event(&self, envelope: &str, outcome: &str) {
        self.router_events_total
            .with_label_values(&[envelope, outcome])
            .inc();
    }

    /// Prometheus text exposition of this registry plus the process-wide one
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.reconciliation_sweeps.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.record_operation("direct_add", "ok");
        assert_eq!(
            a.operations_total.with_label_values(&["direct_add", "ok"]).get(),
            1
        );
        assert_eq!(
            b.operations_total.with_label_values(&["direct_add", "ok"]).get(),
            0
        );
    }

    #[test]
    fn test_encode_text_contains_ledger_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_event("weapon_purchase", "applied");
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("coin_router_events_total"));
    }
}
