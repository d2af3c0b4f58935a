use lazy_static::lazy_static;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, Histogram, IntCounter, IntCounterVec, Registry,
    TextEncoder,
};
use std::time::Instant;

use crate::checks::RuleOutcome;
use crate::{MonitoringError, Result};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Collection metrics
    pub static ref RECORDS_COLLECTED: IntCounter = register_int_counter_with_registry!(
        "monitoring_records_collected_total",
        "Raw request records stored as request events",
        REGISTRY
    ).expect("register monitoring_records_collected_total");

    pub static ref RECORDS_SKIPPED: IntCounter = register_int_counter_with_registry!(
        "monitoring_records_skipped_total",
        "Raw request records rejected during normalization",
        REGISTRY
    ).expect("register monitoring_records_skipped_total");

    pub static ref RECORDS_DUPLICATE: IntCounter = register_int_counter_with_registry!(
        "monitoring_records_duplicate_total",
        "Raw request records already stored by an earlier pass",
        REGISTRY
    ).expect("register monitoring_records_duplicate_total");

    pub static ref COLLECTION_PASSES: IntCounterVec = register_int_counter_vec_with_registry!(
        "monitoring_collection_passes_total",
        "Collection passes by result",
        &["result"],
        REGISTRY
    ).expect("register monitoring_collection_passes_total");

    pub static ref COLLECTION_DURATION: Histogram = register_histogram_with_registry!(
        "monitoring_collection_duration_seconds",
        "Duration of one collection pass",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 30.0],
        REGISTRY
    ).expect("register monitoring_collection_duration_seconds");

    // Aggregation metrics
    pub static ref METRIC_VALUES_UPSERTED: IntCounter = register_int_counter_with_registry!(
        "monitoring_metric_values_upserted_total",
        "Metric values written by the aggregator",
        REGISTRY
    ).expect("register monitoring_metric_values_upserted_total");

    // Check metrics
    pub static ref CHECK_EVALUATIONS: IntCounterVec = register_int_counter_vec_with_registry!(
        "monitoring_check_evaluations_total",
        "Threshold rule evaluations by outcome",
        &["outcome"],
        REGISTRY
    ).expect("register monitoring_check_evaluations_total");
}

/// Observes the duration of a collection pass when dropped.
pub struct CollectionTimer {
    start: Instant,
}

impl CollectionTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for CollectionTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CollectionTimer {
    fn drop(&mut self) {
        COLLECTION_DURATION.observe(self.start.elapsed().as_secs_f64());
    }
}

pub fn record_collected(stored: usize, duplicates: usize, skipped: usize) {
    RECORDS_COLLECTED.inc_by(stored as u64);
    RECORDS_DUPLICATE.inc_by(duplicates as u64);
    RECORDS_SKIPPED.inc_by(skipped as u64);
}

pub fn record_pass(succeeded: bool) {
    let result = if succeeded { "ok" } else { "failed" };
    COLLECTION_PASSES.with_label_values(&[result]).inc();
}

pub fn record_metric_values(written: usize) {
    METRIC_VALUES_UPSERTED.inc_by(written as u64);
}

pub fn record_check_outcome(outcome: &RuleOutcome) {
    let label = match outcome {
        RuleOutcome::Passed => "passed",
        RuleOutcome::Violated(_) => "violated",
        RuleOutcome::NoData(_) => "no_data",
        RuleOutcome::Invalid(_) => "invalid",
    };
    CHECK_EVALUATIONS.with_label_values(&[label]).inc();
}

/// Text exposition of every self-metric.
pub fn gather() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| MonitoringError::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| MonitoringError::Internal(format!("Metrics are not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposes_counters() {
        record_pass(true);
        record_check_outcome(&RuleOutcome::NoData("nothing".to_string()));
        {
            let _timer = CollectionTimer::new();
        }

        let text = gather().unwrap();
        assert!(text.contains("monitoring_collection_passes_total{result=\"ok\"}"));
        assert!(text.contains("monitoring_check_evaluations_total{outcome=\"no_data\"}"));
        assert!(text.contains("monitoring_collection_duration_seconds_count"));
    }
}
