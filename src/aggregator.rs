use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::metrics;
use crate::models::{MetricKey, MetricValue, MonitoredResource, Service};
use crate::periods::{generate_periods, interval_millis};
use crate::store::{MonitoringStore, StoredRequest};
use crate::{MonitoringError, Result};

/// Label stored on scalar (non-breakdown) metrics.
pub const SCALAR_LABEL: &str = "count";

/// Upper bound on the buckets of one re-bucketed series.
pub const MAX_SERIES_POINTS: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Number of matching requests.
    Count,
    /// Mean of a numeric sample; `value_raw` keeps the sum.
    Average,
    Maximum,
    /// Requests counted per distinct observed value, the value being the label.
    Breakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sample {
    Request,
    Error,
    ClientIp,
    UserAgent,
    Method,
    Path,
    Status,
    ErrorType,
    ResponseTime,
    ResponseSize,
}

enum Observation {
    Hit,
    Label(String),
    Number(f64),
}

impl Sample {
    fn observe(&self, request: &StoredRequest) -> Option<Observation> {
        let event = &request.event;
        match self {
            Sample::Request => Some(Observation::Hit),
            Sample::Error => {
                (event.response_status >= 400 || !request.exceptions.is_empty()).then_some(Observation::Hit)
            }
            Sample::ClientIp => event.client_ip.clone().map(Observation::Label),
            Sample::UserAgent => event.user_agent.clone().map(Observation::Label),
            Sample::Method => Some(Observation::Label(event.request_method.clone())),
            Sample::Path => Some(Observation::Label(event.request_path.clone())),
            Sample::Status => Some(Observation::Label(event.response_status.to_string())),
            Sample::ErrorType => request
                .exceptions
                .first()
                .map(|exc| Observation::Label(exc.error_type.clone())),
            Sample::ResponseTime => Some(Observation::Number(event.response_time)),
            Sample::ResponseSize => Some(Observation::Number(event.response_size as f64)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricDefinition {
    pub name: &'static str,
    pub kind: MetricKind,
    sample: Sample,
}

pub const CATALOGUE: &[MetricDefinition] = &[
    MetricDefinition { name: "request.count", kind: MetricKind::Count, sample: Sample::Request },
    MetricDefinition { name: "request.ip", kind: MetricKind::Breakdown, sample: Sample::ClientIp },
    MetricDefinition { name: "request.ua", kind: MetricKind::Breakdown, sample: Sample::UserAgent },
    MetricDefinition { name: "request.method", kind: MetricKind::Breakdown, sample: Sample::Method },
    MetricDefinition { name: "request.path", kind: MetricKind::Breakdown, sample: Sample::Path },
    MetricDefinition { name: "response.status", kind: MetricKind::Breakdown, sample: Sample::Status },
    MetricDefinition { name: "response.error.count", kind: MetricKind::Count, sample: Sample::Error },
    MetricDefinition { name: "response.error.types", kind: MetricKind::Breakdown, sample: Sample::ErrorType },
    MetricDefinition { name: "response.time", kind: MetricKind::Average, sample: Sample::ResponseTime },
    MetricDefinition { name: "response.time.max", kind: MetricKind::Maximum, sample: Sample::ResponseTime },
    MetricDefinition { name: "response.size", kind: MetricKind::Average, sample: Sample::ResponseSize },
];

pub fn definition(name: &str) -> Result<&'static MetricDefinition> {
    CATALOGUE
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| MonitoringError::Configuration(format!("unknown metric: {}", name)))
}

/// Running aggregate for one metric key.
#[derive(Debug, Clone, Copy)]
struct Accumulator {
    sum: f64,
    count: i64,
    max: f64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            max: f64::MIN,
        }
    }

    fn add(&mut self, sample: f64, weight: i64) {
        self.sum += sample;
        self.count += weight;
        self.max = self.max.max(sample);
    }

    /// Returns `(value, value_raw)`.
    fn finish(&self, kind: MetricKind) -> (f64, f64) {
        match kind {
            MetricKind::Count | MetricKind::Breakdown => (self.sum, self.sum),
            MetricKind::Average if self.count > 0 => (self.sum / self.count as f64, self.sum),
            MetricKind::Average => (0.0, 0.0),
            MetricKind::Maximum => (self.max, self.max),
        }
    }
}

/// Compute every catalogue metric over `periods` from `requests`.
///
/// Each metric is produced overall, per referenced resource and per OWS
/// service. Empty buckets still get a zero overall value for count metrics,
/// so a quiet service is distinguishable from one that was never collected.
pub fn compute_metric_values(
    service: &str,
    requests: &[StoredRequest],
    periods: &[(DateTime<Utc>, DateTime<Utc>)],
) -> Vec<MetricValue> {
    let mut arena: BTreeMap<MetricKey, (MetricKind, Accumulator)> = BTreeMap::new();
    let mut pending = requests.iter().peekable();

    for &(bucket_start, bucket_end) in periods {
        while pending.peek().map_or(false, |r| r.event.created < bucket_start) {
            pending.next();
        }

        for def in CATALOGUE.iter().filter(|d| d.kind == MetricKind::Count) {
            arena
                .entry(key(def.name, bucket_start, bucket_end, service, SCALAR_LABEL, None, None))
                .or_insert((def.kind, Accumulator::new()));
        }

        while let Some(request) = pending.next_if(|r| r.event.created < bucket_end) {
            let mut groups: Vec<(Option<&MonitoredResource>, Option<&str>)> = vec![(None, None)];
            groups.extend(request.event.resources.iter().map(|r| (Some(r), None)));
            if let Some(ows) = request.event.ows_service.as_deref() {
                groups.push((None, Some(ows)));
            }

            for def in CATALOGUE {
                let (label, sample) = match def.sample.observe(request) {
                    Some(Observation::Hit) => (SCALAR_LABEL.to_string(), 1.0),
                    Some(Observation::Label(label)) => (label, 1.0),
                    Some(Observation::Number(n)) => (SCALAR_LABEL.to_string(), n),
                    None => continue,
                };
                for (resource, ows) in &groups {
                    let (_, acc) = arena
                        .entry(key(def.name, bucket_start, bucket_end, service, &label, *resource, *ows))
                        .or_insert((def.kind, Accumulator::new()));
                    acc.add(sample, 1);
                }
            }
        }
    }

    arena
        .into_iter()
        .map(|(key, (kind, acc))| {
            let (value, value_raw) = acc.finish(kind);
            MetricValue {
                metric: key.metric,
                bucket_start: key.bucket_start,
                bucket_end: key.bucket_end,
                service: key.service,
                label: key.label,
                resource: key.resource,
                ows_service: key.ows_service,
                value,
                value_raw,
                samples_count: acc.count,
            }
        })
        .collect()
}

fn key(
    metric: &str,
    bucket_start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    service: &str,
    label: &str,
    resource: Option<&MonitoredResource>,
    ows_service: Option<&str>,
) -> MetricKey {
    MetricKey {
        metric: metric.to_string(),
        bucket_start,
        bucket_end,
        service: service.to_string(),
        label: Some(label.to_string()),
        resource: resource.cloned(),
        ows_service: ows_service.map(str::to_string),
    }
}

/// Optional dimension filters for [`MetricAggregator::get_metrics_for`].
///
/// `resource` and `ows_service` left unset select the overall values; a
/// missing `service` or `label` includes all of them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MetricFilter {
    pub service: Option<String>,
    pub resource: Option<MonitoredResource>,
    pub label: Option<String>,
    pub ows_service: Option<String>,
}

impl MetricFilter {
    fn selects(&self, value: &MetricValue) -> bool {
        self.service.as_ref().map_or(true, |s| *s == value.service)
            && self.label.as_ref().map_or(true, |l| value.label.as_ref() == Some(l))
            && self.resource == value.resource
            && self.ows_service == value.ows_service
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelValue {
    pub label: Option<String>,
    pub value: f64,
    pub value_raw: f64,
    pub samples_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub values: Vec<LabelValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeries {
    pub metric: String,
    pub kind: MetricKind,
    pub interval_secs: i64,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    pub buckets: usize,
    pub requests: usize,
    pub metric_values: usize,
}

#[derive(Clone)]
pub struct MetricAggregator {
    store: MonitoringStore,
}

impl MetricAggregator {
    pub fn new(store: MonitoringStore) -> Self {
        Self { store }
    }

    /// Recompute and upsert all metric values of `service` for the buckets
    /// covering `[since, until)`.
    ///
    /// Buckets are always recomputed from every stored request inside them,
    /// not only from the requests of the current window, so a bucket split
    /// across two passes ends up with its full value.
    pub async fn aggregate(
        &self,
        service: &Service,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<AggregationSummary> {
        let periods: Vec<_> = generate_periods(since, service.check_interval, until)?.collect();
        let (first, last) = match (periods.first(), periods.last()) {
            (Some(first), Some(last)) => (first.0, last.1),
            _ => return Ok(AggregationSummary::default()),
        };

        let requests = self.store.requests_between(&service.name, first, last).await?;
        let values = compute_metric_values(&service.name, &requests, &periods);
        debug!(
            "Computed {} metric values for {} over {} bucket(s)",
            values.len(),
            service.name,
            periods.len()
        );

        let written = self.store.upsert_metric_values(&values).await?;
        metrics::record_metric_values(written);

        info!(
            "Aggregated {} requests of {} into {} metric values",
            requests.len(),
            service.name,
            written
        );
        Ok(AggregationSummary {
            buckets: periods.len(),
            requests: requests.len(),
            metric_values: written,
        })
    }

    /// Stored values of `metric_name` in `[valid_from, valid_to)`, summed up
    /// into buckets of `interval`.
    ///
    /// `interval` must be a whole multiple of the stored bucket length; stored
    /// buckets are never split.
    pub async fn get_metrics_for(
        &self,
        metric_name: &str,
        valid_from: DateTime<Utc>,
        valid_to: DateTime<Utc>,
        interval: Duration,
        filter: &MetricFilter,
    ) -> Result<MetricSeries> {
        let def = definition(metric_name)?;
        let step = interval_millis(interval)?;
        let span = (valid_to - valid_from).num_milliseconds();
        if span / step >= MAX_SERIES_POINTS {
            return Err(MonitoringError::Configuration(format!(
                "{} .. {} holds more than {} buckets of {}s",
                valid_from,
                valid_to,
                MAX_SERIES_POINTS,
                step / 1000
            )));
        }
        let periods: Vec<_> = generate_periods(valid_from, interval, valid_to)?.collect();

        let mut series = MetricSeries {
            metric: metric_name.to_string(),
            kind: def.kind,
            interval_secs: interval.num_seconds(),
            points: periods
                .iter()
                .map(|&(bucket_start, bucket_end)| SeriesPoint {
                    bucket_start,
                    bucket_end,
                    values: Vec::new(),
                })
                .collect(),
        };
        let (first, last) = match (periods.first(), periods.last()) {
            (Some(first), Some(last)) => (first.0, last.1),
            _ => return Ok(series),
        };

        let rows = self.store.metric_values(metric_name, first, last).await?;
        let mut merged: BTreeMap<(usize, Option<String>), Accumulator> = BTreeMap::new();

        for row in rows.iter().filter(|row| filter.selects(row)) {
            let width = (row.bucket_end - row.bucket_start).num_milliseconds();
            if width > step {
                return Err(MonitoringError::Configuration(format!(
                    "cannot split stored {}s buckets into {}s buckets",
                    width / 1000,
                    step / 1000
                )));
            }
            if width <= 0 || step % width != 0 {
                return Err(MonitoringError::Configuration(format!(
                    "interval of {}s is not a multiple of the stored {}s buckets",
                    step / 1000,
                    width / 1000
                )));
            }

            let idx = ((row.bucket_start - first).num_milliseconds() / step) as usize;
            let acc = merged
                .entry((idx, row.label.clone()))
                .or_insert_with(Accumulator::new);
            match def.kind {
                MetricKind::Maximum => acc.add(row.value, row.samples_count),
                _ => acc.add(row.value_raw, row.samples_count),
            }
        }

        for ((idx, label), acc) in merged {
            let (value, value_raw) = match def.kind {
                MetricKind::Count | MetricKind::Breakdown => (acc.sum, acc.sum),
                other => acc.finish(other),
            };
            if let Some(point) = series.points.get_mut(idx) {
                point.values.push(LabelValue {
                    label,
                    value,
                    value_raw,
                    samples_count: acc.count,
                });
            }
        }

        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExceptionEvent, NormalizedRequest, RequestEvent, ServiceType};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 6, 20, h, m, s).unwrap()
    }

    fn request(created: DateTime<Utc>, ip: &str, layer: Option<&str>, time: f64) -> RequestEvent {
        RequestEvent {
            source_id: None,
            service: "geonode".to_string(),
            created,
            finished: created + Duration::milliseconds(time as i64),
            response_time: time,
            request_method: "GET".to_string(),
            request_path: "/layers/".to_string(),
            query_string: None,
            ows_service: layer.map(|_| "WMS".to_string()),
            response_status: 200,
            response_size: 100,
            response_type: None,
            client_ip: Some(ip.to_string()),
            user_agent: None,
            resources: layer.map(MonitoredResource::layer).into_iter().collect(),
        }
    }

    fn stored(id: i64, event: RequestEvent) -> StoredRequest {
        StoredRequest {
            id,
            event,
            exceptions: Vec::new(),
        }
    }

    fn find<'a>(
        values: &'a [MetricValue],
        metric: &str,
        label: &str,
        resource: Option<&MonitoredResource>,
        bucket_start: DateTime<Utc>,
    ) -> Option<&'a MetricValue> {
        values.iter().find(|v| {
            v.metric == metric
                && v.label.as_deref() == Some(label)
                && v.resource.as_ref() == resource
                && v.ows_service.is_none()
                && v.bucket_start == bucket_start
        })
    }

    #[test]
    fn test_compute_counts_and_breakdowns() {
        let periods: Vec<_> = generate_periods(at(12, 0, 0), Duration::minutes(5), at(12, 10, 0))
            .unwrap()
            .collect();
        let layer = MonitoredResource::layer("geonode:roads");
        let mut failing = stored(3, request(at(12, 3, 0), "10.0.0.2", None, 40.0));
        failing.event.response_status = 500;
        failing.exceptions.push(ExceptionEvent {
            error_type: "django.http.response.Http404".to_string(),
            error_message: String::new(),
            stack_trace: String::new(),
            parent: None,
        });
        let requests = vec![
            stored(1, request(at(12, 1, 0), "10.0.0.1", Some("geonode:roads"), 10.0)),
            stored(2, request(at(12, 2, 0), "10.0.0.1", Some("geonode:roads"), 30.0)),
            failing,
        ];

        let values = compute_metric_values("geonode", &requests, &periods);
        let first = at(12, 0, 0);

        assert_eq!(find(&values, "request.count", "count", None, first).unwrap().value, 3.0);
        assert_eq!(find(&values, "request.count", "count", Some(&layer), first).unwrap().value, 2.0);
        assert_eq!(find(&values, "request.ip", "10.0.0.1", None, first).unwrap().value, 2.0);
        assert_eq!(find(&values, "request.ip", "10.0.0.2", None, first).unwrap().value, 1.0);
        assert_eq!(find(&values, "response.error.count", "count", None, first).unwrap().value, 1.0);
        assert_eq!(
            find(&values, "response.error.types", "django.http.response.Http404", None, first)
                .unwrap()
                .value,
            1.0
        );

        let time = find(&values, "response.time", "count", None, first).unwrap();
        assert_eq!((time.value, time.value_raw, time.samples_count), (80.0 / 3.0, 80.0, 3));
        assert_eq!(find(&values, "response.time.max", "count", None, first).unwrap().value, 40.0);

        let per_ows = values
            .iter()
            .find(|v| v.metric == "request.count" && v.ows_service.as_deref() == Some("WMS"))
            .unwrap();
        assert_eq!(per_ows.value, 2.0);

        // the second bucket is empty but still reports zero requests
        let quiet = find(&values, "request.count", "count", None, at(12, 5, 0)).unwrap();
        assert_eq!(quiet.value, 0.0);
        assert!(find(&values, "request.ip", "10.0.0.1", None, at(12, 5, 0)).is_none());
    }

    async fn seeded_store() -> (MonitoringStore, Service) {
        let store = MonitoringStore::open_in_memory().unwrap();
        let service = Service::new("geonode", ServiceType::GeoNode, Duration::minutes(1));
        store.upsert_service(&service).await.unwrap();
        for (idx, minute) in [0u32, 0, 1, 3, 4, 6].iter().enumerate() {
            let event = request(at(12, *minute, 10), "10.0.0.1", Some("geonode:roads"), 10.0 * (idx + 1) as f64);
            store
                .insert_request(&NormalizedRequest { event, exceptions: Vec::new() })
                .await
                .unwrap();
        }
        (store, service)
    }

    #[tokio::test]
    async fn test_aggregation_is_idempotent() {
        let (store, service) = seeded_store().await;
        let aggregator = MetricAggregator::new(store.clone());

        aggregator.aggregate(&service, at(12, 0, 0), at(12, 10, 0)).await.unwrap();
        let first = store.metric_values("request.count", at(12, 0, 0), at(12, 10, 0)).await.unwrap();
        let summary = aggregator.aggregate(&service, at(12, 0, 0), at(12, 10, 0)).await.unwrap();
        let second = store.metric_values("request.count", at(12, 0, 0), at(12, 10, 0)).await.unwrap();

        assert_eq!(summary.buckets, 10);
        assert_eq!(summary.requests, 6);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_bucket_split_across_passes() {
        let (store, service) = seeded_store().await;
        let aggregator = MetricAggregator::new(store.clone());

        aggregator.aggregate(&service, at(12, 0, 0), at(12, 0, 5)).await.unwrap();
        aggregator.aggregate(&service, at(12, 0, 5), at(12, 1, 0)).await.unwrap();

        let values = store.metric_values("request.count", at(12, 0, 0), at(12, 1, 0)).await.unwrap();
        let overall = find(&values, "request.count", "count", None, at(12, 0, 0)).unwrap();
        assert_eq!(overall.value, 2.0);
    }

    #[tokio::test]
    async fn test_get_metrics_for_rebuckets() {
        let (store, service) = seeded_store().await;
        let aggregator = MetricAggregator::new(store);
        aggregator.aggregate(&service, at(12, 0, 0), at(12, 10, 0)).await.unwrap();

        let series = aggregator
            .get_metrics_for("request.count", at(12, 0, 0), at(12, 10, 0), Duration::minutes(5), &MetricFilter::default())
            .await
            .unwrap();
        let counts: Vec<f64> = series.points.iter().map(|p| p.values[0].value).collect();
        assert_eq!(counts, vec![5.0, 1.0]);

        let times = aggregator
            .get_metrics_for("response.time", at(12, 0, 0), at(12, 10, 0), Duration::minutes(5), &MetricFilter::default())
            .await
            .unwrap();
        let first = &times.points[0].values[0];
        assert_eq!(first.value, 30.0);
        assert_eq!(first.samples_count, 5);

        let by_resource = MetricFilter {
            resource: Some(MonitoredResource::layer("geonode:roads")),
            ..MetricFilter::default()
        };
        let series = aggregator
            .get_metrics_for("request.ip", at(12, 0, 0), at(12, 10, 0), Duration::minutes(10), &by_resource)
            .await
            .unwrap();
        assert_eq!(
            series.points[0].values,
            vec![LabelValue {
                label: Some("10.0.0.1".to_string()),
                value: 6.0,
                value_raw: 6.0,
                samples_count: 6,
            }]
        );
    }

    #[tokio::test]
    async fn test_get_metrics_for_rejects_finer_or_misaligned_intervals() {
        let (store, service) = seeded_store().await;
        let aggregator = MetricAggregator::new(store);
        aggregator.aggregate(&service, at(12, 0, 0), at(12, 10, 0)).await.unwrap();

        let filter = MetricFilter::default();
        let finer = aggregator
            .get_metrics_for("request.count", at(12, 0, 0), at(12, 10, 0), Duration::seconds(30), &filter)
            .await;
        assert!(matches!(finer, Err(MonitoringError::Configuration(_))));

        let misaligned = aggregator
            .get_metrics_for("request.count", at(12, 0, 0), at(12, 10, 0), Duration::seconds(90), &filter)
            .await;
        assert!(matches!(misaligned, Err(MonitoringError::Configuration(_))));

        let unknown = aggregator
            .get_metrics_for("request.nope", at(12, 0, 0), at(12, 10, 0), Duration::minutes(5), &filter)
            .await;
        assert!(matches!(unknown, Err(MonitoringError::Configuration(_))));

        let oversized = aggregator
            .get_metrics_for(
                "request.count",
                at(12, 0, 0) - Duration::days(365),
                at(12, 10, 0),
                Duration::minutes(1),
                &filter,
            )
            .await;
        assert!(matches!(oversized, Err(MonitoringError::Configuration(_))));

        let widest = at(12, 0, 0) + Duration::minutes(MAX_SERIES_POINTS - 1);
        let series = aggregator
            .get_metrics_for("request.count", at(12, 0, 0), widest, Duration::minutes(1), &filter)
            .await
            .unwrap();
        assert_eq!(series.points.len() as i64, MAX_SERIES_POINTS - 1);
    }
}
