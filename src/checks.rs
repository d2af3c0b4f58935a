use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Bound;
use crate::metrics;
use crate::models::{MetricNotificationCheck, MetricValue, NotificationCheck};
use crate::periods::align_period_start;
use crate::store::MonitoringStore;
use crate::{MonitoringError, Result};

/// Overall state of a notification check at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    Ok,
    Triggered,
    /// Some rule had nothing to evaluate against, or could not be evaluated.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RuleOutcome {
    Passed,
    Violated(String),
    NoData(String),
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleReport {
    pub rule_id: i64,
    pub metric: String,
    pub outcome: RuleOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub check_id: i64,
    pub name: String,
    pub state: CheckState,
    pub rules: Vec<RuleReport>,
}

impl CheckReport {
    fn from_rules(check: &NotificationCheck, rules: Vec<RuleReport>) -> Self {
        let state = if rules.iter().any(|r| matches!(r.outcome, RuleOutcome::Violated(_))) {
            CheckState::Triggered
        } else if rules.iter().all(|r| r.outcome == RuleOutcome::Passed) {
            CheckState::Ok
        } else {
            CheckState::Unknown
        };

        Self {
            check_id: check.id,
            name: check.name.clone(),
            state,
            rules,
        }
    }
}

/// Keep only the reports a dispatcher has to act upon.
pub fn failing(reports: &[CheckReport]) -> Vec<&CheckReport> {
    reports.iter().filter(|r| r.state != CheckState::Ok).collect()
}

/// Evaluates threshold rules against stored metric values.
#[derive(Clone)]
pub struct CheckEngine {
    store: MonitoringStore,
    default_interval: Duration,
}

impl CheckEngine {
    /// `default_interval` sizes the fallback slot for rules not bound to a
    /// service when no stored bucket contains the evaluated instant.
    pub fn new(store: MonitoringStore, default_interval: Duration) -> Self {
        Self {
            store,
            default_interval,
        }
    }

    /// Evaluate one rule for the bucket containing `for_timestamp`.
    ///
    /// Fails with `Configuration` for a rule without any constraint, `NoData`
    /// when no matching value exists, and `MetricOutOfRange` or
    /// `MetricTimeout` when the rule is violated.
    pub async fn check_metric(
        &self,
        rule: &MetricNotificationCheck,
        for_timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if !rule.is_constrained() {
            return Err(MonitoringError::Configuration(format!(
                "rule {} on {} sets none of min_value, max_value, max_timeout",
                rule.id, rule.metric
            )));
        }

        let interval = match &rule.service {
            Some(name) => match self.store.get_service(name).await {
                Ok(service) => Some(service.check_interval),
                Err(MonitoringError::NotFound(_)) => {
                    return Err(MonitoringError::Configuration(format!(
                        "rule {} refers to unknown service {}",
                        rule.id, name
                    )))
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        if rule.min_value.is_some() || rule.max_value.is_some() {
            // Services store buckets on their own grid. Without one, any
            // bucket covering the instant is evaluated, then the default slot.
            let candidates = match interval {
                Some(interval) => self.aligned_values(&rule.metric, for_timestamp, interval).await?,
                None => {
                    let containing = self.store.metric_values_at(&rule.metric, for_timestamp).await?;
                    if containing.iter().any(|v| rule_matches(rule, v)) {
                        containing
                    } else {
                        self.aligned_values(&rule.metric, for_timestamp, self.default_interval)
                            .await?
                    }
                }
            };
            let values: Vec<MetricValue> = candidates
                .into_iter()
                .filter(|v| rule_matches(rule, v))
                .collect();

            if values.is_empty() {
                return Err(MonitoringError::NoData(format!(
                    "no {} values for the bucket containing {}",
                    rule.metric, for_timestamp
                )));
            }

            for value in &values {
                if let Some(min) = rule.min_value {
                    if value.value < min {
                        return Err(out_of_range(rule, value.value, min, Bound::Minimum));
                    }
                }
                if let Some(max) = rule.max_value {
                    if value.value > max {
                        return Err(out_of_range(rule, value.value, max, Bound::Maximum));
                    }
                }
            }
        }

        if let Some(max_timeout) = rule.max_timeout {
            let last_seen = self
                .store
                .metric_values_until(&rule.metric, for_timestamp)
                .await?
                .into_iter()
                .filter(|v| v.samples_count > 0 && rule_matches(rule, v))
                .map(|v| v.bucket_end)
                .max()
                .ok_or_else(|| {
                    MonitoringError::NoData(format!("{} was never recorded", rule.metric))
                })?;

            if for_timestamp - last_seen > max_timeout {
                return Err(MonitoringError::MetricTimeout {
                    metric: rule.metric.clone(),
                    last_seen,
                    max_timeout,
                });
            }
        }

        Ok(())
    }

    async fn aligned_values(
        &self,
        metric: &str,
        at: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<MetricValue>> {
        let bucket_start = align_period_start(at, interval)?;
        self.store.metric_values(metric, bucket_start, bucket_start + interval).await
    }

    /// Evaluate every active notification check as of `as_of`.
    ///
    /// Rule-level failures are reported in the result; only storage errors
    /// abort the evaluation.
    pub async fn check_for(&self, as_of: DateTime<Utc>) -> Result<Vec<CheckReport>> {
        let checks = self.store.notification_checks(true).await?;
        let mut reports = Vec::with_capacity(checks.len());

        for check in &checks {
            let mut rules = Vec::with_capacity(check.definitions.len());
            for rule in &check.definitions {
                let outcome = match self.check_metric(rule, as_of).await {
                    Ok(()) => RuleOutcome::Passed,
                    Err(e) if e.is_threshold_violation() => RuleOutcome::Violated(e.to_string()),
                    Err(e) if e.is_no_data() => RuleOutcome::NoData(e.to_string()),
                    Err(MonitoringError::Configuration(reason)) => {
                        warn!("Cannot evaluate rule {} of {}: {}", rule.id, check.name, reason);
                        RuleOutcome::Invalid(reason)
                    }
                    Err(e) => return Err(e),
                };
                metrics::record_check_outcome(&outcome);
                rules.push(RuleReport {
                    rule_id: rule.id,
                    metric: rule.metric.clone(),
                    outcome,
                });
            }

            let report = CheckReport::from_rules(check, rules);
            debug!("Notification check {} is {:?}", report.name, report.state);
            reports.push(report);
        }

        Ok(reports)
    }
}

/// An unset service or label matches any stored value. An unset resource or
/// OWS service selects the overall values, not the per-resource breakdown.
fn rule_matches(rule: &MetricNotificationCheck, value: &MetricValue) -> bool {
    rule.service.as_ref().map_or(true, |s| *s == value.service)
        && rule.label.as_ref().map_or(true, |l| value.label.as_ref() == Some(l))
        && rule.resource == value.resource
        && rule.ows_service == value.ows_service
}

fn out_of_range(rule: &MetricNotificationCheck, value: f64, threshold: f64, bound: Bound) -> MonitoringError {
    MonitoringError::MetricOutOfRange {
        metric: rule.metric.clone(),
        value,
        threshold,
        bound,
    }
}
