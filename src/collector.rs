use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::MetricAggregator;
use crate::handlers::HandlerTable;
use crate::metrics::{self, CollectionTimer};
use crate::models::Service;
use crate::normalizer::{normalize, ObservedRequest, RawRecord};
use crate::store::{ClearedData, InsertOutcome, MonitoringStore};
use crate::{MonitoringError, Result};

/// Counters of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectionOutcome {
    pub received: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    /// Records the source returned for timestamps outside the window.
    pub out_of_window: usize,
    pub metric_values: usize,
}

/// Requested window of a scheduled pass. Unset bounds are resolved per
/// service; `force` ignores the stored watermark.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub force: bool,
}

/// Result of one service's pass inside a multi-service run.
#[derive(Debug)]
pub struct ServiceRun {
    pub service: String,
    pub result: Result<CollectionOutcome>,
}

impl ServiceRun {
    pub fn failed(&self) -> bool {
        self.result.is_err()
    }
}

#[derive(Clone)]
pub struct Collector {
    store: MonitoringStore,
    aggregator: MetricAggregator,
    handlers: HandlerTable,
}

impl Collector {
    pub fn new(store: MonitoringStore, handlers: HandlerTable) -> Self {
        Self {
            aggregator: MetricAggregator::new(store.clone()),
            store,
            handlers,
        }
    }

    /// Collect, store and aggregate the requests of `service` in
    /// `[since, until)`. The watermark moves to `until` only when every step
    /// succeeded; malformed records are skipped, not fatal. Records created
    /// outside the window are left to the pass that covers them.
    pub async fn process(
        &self,
        service: &Service,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<CollectionOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("collect", service = %service.name, run_id = %run_id);

        async {
            let _timer = CollectionTimer::new();
            let result = self.run_pass(service, since, until).await;
            metrics::record_pass(result.is_ok());
            match &result {
                Ok(outcome) => info!(
                    "Pass over {} .. {} done: {} received, {} stored, {} duplicate, {} skipped, {} outside the window",
                    since,
                    until,
                    outcome.received,
                    outcome.stored,
                    outcome.duplicates,
                    outcome.skipped,
                    outcome.out_of_window
                ),
                Err(e) => error!("Pass over {} .. {} failed: {}", since, until, e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_pass(
        &self,
        service: &Service,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<CollectionOutcome> {
        if until <= since {
            debug!("Empty window {} .. {}, nothing to do", since, until);
            return Ok(CollectionOutcome::default());
        }

        let handler = self.handlers.handler_for(service.service_type)?;
        let records = handler.collect(service, since, until).await?;

        let mut outcome = CollectionOutcome {
            received: records.len(),
            ..Default::default()
        };
        for record in &records {
            let normalized = match normalize(&service.name, record) {
                Ok(normalized) => normalized,
                Err(MonitoringError::Normalization(reason)) => {
                    warn!("Skipping malformed record: {}", reason);
                    outcome.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let created = normalized.event.created;
            if created < since || created >= until {
                debug!("Ignoring request created at {}, outside the window", created);
                outcome.out_of_window += 1;
                continue;
            }
            match self.store.insert_request(&normalized).await? {
                InsertOutcome::Inserted(_) => outcome.stored += 1,
                InsertOutcome::Duplicate(id) => {
                    debug!("Request {} already stored", id);
                    outcome.duplicates += 1;
                }
            }
        }
        metrics::record_collected(outcome.stored, outcome.duplicates, outcome.skipped);

        let summary = self.aggregator.aggregate(service, since, until).await?;
        outcome.metric_values = summary.metric_values;

        self.store.set_last_checked(&service.name, until).await?;
        Ok(outcome)
    }

    /// Store a request observed by the host application.
    pub async fn record_observed(
        &self,
        service: &Service,
        observed: &ObservedRequest,
    ) -> Result<InsertOutcome> {
        let normalized = normalize(&service.name, &RawRecord::Observed(observed.clone()))?;
        self.store.insert_request(&normalized).await
    }

    /// Run a pass for `service`, resolving a missing window from its
    /// watermark and check interval.
    pub async fn run_check(
        &self,
        service: &Service,
        window: PassWindow,
        now: DateTime<Utc>,
    ) -> Result<CollectionOutcome> {
        let (since, until) = resolve_window(service, window, now);
        self.process(service, since, until).await
    }

    /// Run passes for all `services` concurrently, each on its own task. A
    /// failing or panicking pass does not stop the others.
    pub async fn run_all(
        &self,
        services: &[Service],
        window: PassWindow,
        now: DateTime<Utc>,
    ) -> Vec<ServiceRun> {
        let passes = services.iter().cloned().map(|service| {
            let collector = self.clone();
            tokio::spawn(async move { collector.run_check(&service, window, now).await })
        });

        join_all(passes)
            .await
            .into_iter()
            .zip(services)
            .map(|(joined, service)| ServiceRun {
                service: service.name.clone(),
                result: joined.unwrap_or_else(|e| {
                    Err(MonitoringError::Internal(format!("collection pass aborted: {}", e)))
                }),
            })
            .collect()
    }

    /// Drop stored data older than `retention`.
    pub async fn clear_old_data(&self, now: DateTime<Utc>, retention: Duration) -> Result<ClearedData> {
        let cutoff = now - retention;
        let cleared = self.store.clear_before(cutoff).await?;
        info!(
            "Cleared {} requests, {} exceptions and {} metric values older than {}",
            cleared.requests, cleared.exceptions, cleared.metric_values, cutoff
        );
        Ok(cleared)
    }
}

fn resolve_window(service: &Service, window: PassWindow, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let watermark = if window.force { None } else { service.last_checked };
    let since = window
        .since
        .or(watermark)
        .unwrap_or(now - service.check_interval);
    (since, window.until.unwrap_or(now))
}
