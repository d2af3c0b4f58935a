use std::env;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;

use crate::aggregator;
use crate::models::{MetricNotificationCheck, MonitoredResource, Service, ServiceType};
use crate::normalizer::parse_timestamp;
use crate::store::MonitoringStore;
use crate::{MonitoringError, Result};

/// What the binary does once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Collect,
    Serve,
    List,
}

impl std::str::FromStr for Role {
    type Err = MonitoringError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "collect" => Ok(Role::Collect),
            "serve" => Ok(Role::Serve),
            "list" => Ok(Role::List),
            other => Err(MonitoringError::Configuration(format!(
                "invalid MONITORING_ROLE {:?}, must be collect, serve or list",
                other
            ))),
        }
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Collect => "collect",
            Role::Serve => "serve",
            Role::List => "list",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub role: Role,
    /// duckdb file; in-memory when unset.
    pub db_path: Option<String>,
    pub port: u16,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Restricts a collection run to one service.
    pub service: Option<String>,
    /// Run retention cleanup after collecting.
    pub clear: bool,
    /// Ignore stored watermarks when resolving collection windows.
    pub force: bool,
    pub retention: Duration,
    /// Bucket length for rules not bound to a service.
    pub default_interval: Duration,
    pub services: Vec<Service>,
    pub notification_checks: Vec<CheckConfig>,
}

impl MonitoringConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key/value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let role = match var("MONITORING_ROLE") {
            Some(raw) => raw.parse()?,
            None => Role::Collect,
        };
        let port = parse_var(var("PORT"), "PORT", 8080u16)?;
        let retention_days = parse_var(var("MONITORING_RETENTION_DAYS"), "MONITORING_RETENTION_DAYS", 7i64)?;
        let interval_secs = parse_var(
            var("MONITORING_CHECK_INTERVAL_SECS"),
            "MONITORING_CHECK_INTERVAL_SECS",
            60i64,
        )?;
        if retention_days <= 0 {
            return Err(MonitoringError::Configuration(
                "MONITORING_RETENTION_DAYS must be positive".to_string(),
            ));
        }
        if interval_secs <= 0 {
            return Err(MonitoringError::Configuration(
                "MONITORING_CHECK_INTERVAL_SECS must be positive".to_string(),
            ));
        }

        let since = var("MONITORING_SINCE").map(|raw| parse_timestamp(&raw)).transpose()
            .map_err(|e| MonitoringError::Configuration(format!("MONITORING_SINCE: {}", e)))?;
        let until = var("MONITORING_UNTIL").map(|raw| parse_timestamp(&raw)).transpose()
            .map_err(|e| MonitoringError::Configuration(format!("MONITORING_UNTIL: {}", e)))?;
        if let (Some(since), Some(until)) = (since, until) {
            if until <= since {
                return Err(MonitoringError::Configuration(format!(
                    "MONITORING_UNTIL {} is not after MONITORING_SINCE {}",
                    until, since
                )));
            }
        }

        let clear = match var("MONITORING_CLEAR") {
            Some(raw) => parse_flag(&raw, "MONITORING_CLEAR")?,
            None => false,
        };
        let force = match var("MONITORING_FORCE") {
            Some(raw) => parse_flag(&raw, "MONITORING_FORCE")?,
            None => false,
        };

        let file = match var("MONITORING_CONFIG") {
            Some(path) => ConfigFile::load(&path)?,
            None => ConfigFile::default(),
        };

        Ok(Self {
            role,
            db_path: var("MONITORING_DB_PATH"),
            port,
            since,
            until,
            service: var("MONITORING_SERVICE"),
            clear,
            force,
            retention: Duration::try_days(retention_days).ok_or_else(|| {
                MonitoringError::Configuration("MONITORING_RETENTION_DAYS is too large".to_string())
            })?,
            default_interval: seconds(interval_secs, "MONITORING_CHECK_INTERVAL_SECS")?,
            services: file.services()?,
            notification_checks: file.notification_checks()?,
        })
    }

    /// Write configured services and notification checks into `store`.
    pub async fn sync(&self, store: &MonitoringStore) -> Result<()> {
        for service in &self.services {
            store.upsert_service(service).await?;
        }
        for check in &self.notification_checks {
            store
                .save_notification_check(&check.name, &check.description, &check.definitions)
                .await?;
        }
        info!(
            "Synced {} services and {} notification checks",
            self.services.len(),
            self.notification_checks.len()
        );
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        Some(raw) => raw.trim().parse().map_err(|_| {
            MonitoringError::Configuration(format!("invalid value for {}: {:?}", key, raw))
        }),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str, key: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(MonitoringError::Configuration(format!(
            "invalid value for {}: {:?}",
            key, other
        ))),
    }
}

fn seconds(secs: i64, key: &str) -> Result<Duration> {
    Duration::try_seconds(secs)
        .ok_or_else(|| MonitoringError::Configuration(format!("{} is too large", key)))
}

/// A notification check as configured, rules already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckConfig {
    pub name: String,
    pub description: String,
    pub definitions: Vec<MetricNotificationCheck>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    services: Vec<ServiceEntry>,
    #[serde(default)]
    notification_checks: Vec<CheckEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default = "default_host")]
    host: String,
    #[serde(rename = "type")]
    service_type: ServiceType,
    #[serde(default = "default_check_interval")]
    check_interval_secs: i64,
    #[serde(default = "default_active")]
    active: bool,
}

#[derive(Debug, Deserialize)]
struct CheckEntry {
    name: String,
    #[serde(default)]
    description: String,
    definitions: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    metric: String,
    service: Option<String>,
    /// `type=name`
    resource: Option<String>,
    label: Option<String>,
    ows_service: Option<String>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    max_timeout_secs: Option<i64>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_check_interval() -> i64 {
    60
}

fn default_active() -> bool {
    true
}

impl ConfigFile {
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MonitoringError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| MonitoringError::Configuration(format!("invalid configuration file: {}", e)))
    }

    fn services(&self) -> Result<Vec<Service>> {
        let mut services: Vec<Service> = Vec::with_capacity(self.services.len());
        for entry in &self.services {
            if entry.name.trim().is_empty() {
                return Err(MonitoringError::Configuration("service without a name".to_string()));
            }
            if services.iter().any(|s| s.name == entry.name) {
                return Err(MonitoringError::Configuration(format!(
                    "service {} configured twice",
                    entry.name
                )));
            }
            if entry.check_interval_secs <= 0 {
                return Err(MonitoringError::Configuration(format!(
                    "service {}: check_interval_secs must be positive",
                    entry.name
                )));
            }
            if entry.service_type == ServiceType::GeoServer && entry.url.trim().is_empty() {
                return Err(MonitoringError::Configuration(format!(
                    "service {}: geoserver services need a url",
                    entry.name
                )));
            }

            let interval = seconds(entry.check_interval_secs, "check_interval_secs").map_err(|e| {
                MonitoringError::Configuration(format!("service {}: {}", entry.name, e))
            })?;
            let mut service = Service::new(&entry.name, entry.service_type, interval);
            service.url = entry.url.clone();
            service.host = entry.host.clone();
            service.active = entry.active;
            services.push(service);
        }
        Ok(services)
    }

    fn notification_checks(&self) -> Result<Vec<CheckConfig>> {
        self.notification_checks
            .iter()
            .map(|entry| {
                let definitions = entry
                    .definitions
                    .iter()
                    .map(|rule| rule.to_rule())
                    .collect::<Result<Vec<_>>>()
                    .map_err(|e| {
                        MonitoringError::Configuration(format!("check {}: {}", entry.name, e))
                    })?;
                Ok(CheckConfig {
                    name: entry.name.clone(),
                    description: entry.description.clone(),
                    definitions,
                })
            })
            .collect()
    }
}

impl RuleEntry {
    fn to_rule(&self) -> Result<MetricNotificationCheck> {
        aggregator::definition(&self.metric)?;

        let mut rule = MetricNotificationCheck::new(&self.metric);
        rule.service = self.service.clone();
        rule.resource = self.resource.as_deref().map(MonitoredResource::parse).transpose()?;
        rule.label = self.label.clone();
        rule.ows_service = self.ows_service.as_ref().map(|s| s.to_ascii_uppercase());
        rule.min_value = self.min_value;
        rule.max_value = self.max_value;
        rule.max_timeout = match self.max_timeout_secs {
            Some(secs) if secs <= 0 => {
                return Err(MonitoringError::Configuration(format!(
                    "{}: max_timeout_secs must be positive",
                    self.metric
                )))
            }
            Some(secs) => Some(seconds(secs, "max_timeout_secs")?),
            None => None,
        };

        if let (Some(min), Some(max)) = (rule.min_value, rule.max_value) {
            if min > max {
                return Err(MonitoringError::Configuration(format!(
                    "{}: min_value {} is above max_value {}",
                    self.metric, min, max
                )));
            }
        }
        if !rule.is_constrained() {
            return Err(MonitoringError::Configuration(format!(
                "{}: rule has no threshold",
                self.metric
            )));
        }
        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MonitoringConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.role, Role::Collect);
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, None);
        assert_eq!(config.retention, Duration::days(7));
        assert_eq!(config.default_interval, Duration::seconds(60));
        assert!(!config.clear);
        assert!(!config.force);
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_env_values() {
        let config = MonitoringConfig::from_lookup(lookup(&[
            ("MONITORING_ROLE", "serve"),
            ("PORT", "9000"),
            ("MONITORING_SINCE", "2024-01-10 12:00:00"),
            ("MONITORING_UNTIL", "2024-01-10T13:00:00Z"),
            ("MONITORING_SERVICE", "geoserver"),
            ("MONITORING_CLEAR", "yes"),
            ("MONITORING_FORCE", "1"),
        ]))
        .unwrap();

        assert_eq!(config.role, Role::Serve);
        assert_eq!(config.port, 9000);
        assert_eq!(config.service.as_deref(), Some("geoserver"));
        assert!(config.clear);
        assert!(config.force);
        assert_eq!(config.until.unwrap() - config.since.unwrap(), Duration::hours(1));
    }

    #[test]
    fn test_invalid_env_values() {
        for vars in [
            vec![("MONITORING_ROLE", "worker")],
            vec![("PORT", "eighty")],
            vec![("MONITORING_RETENTION_DAYS", "0")],
            vec![("MONITORING_RETENTION_DAYS", "9223372036854775807")],
            vec![("MONITORING_CHECK_INTERVAL_SECS", "9223372036854775807")],
            vec![("MONITORING_FORCE", "sometimes")],
            vec![("MONITORING_SINCE", "yesterday")],
            vec![
                ("MONITORING_SINCE", "2024-01-10 13:00:00"),
                ("MONITORING_UNTIL", "2024-01-10 12:00:00"),
            ],
        ] {
            let result = MonitoringConfig::from_lookup(lookup(&vars));
            assert!(
                matches!(result, Err(MonitoringError::Configuration(_))),
                "{:?} accepted",
                vars
            );
        }
    }

    #[test]
    fn test_config_file() {
        let file = ConfigFile::parse(
            r#"{
                "services": [
                    {"name": "geoserver", "type": "geoserver", "url": "http://localhost/geoserver",
                     "check_interval_secs": 300},
                    {"name": "geonode", "type": "geonode"}
                ],
                "notification_checks": [{
                    "name": "wms errors",
                    "definitions": [{
                        "metric": "response.error.count",
                        "service": "geoserver",
                        "resource": "layer=geonode:roads",
                        "ows_service": "wms",
                        "max_value": 10
                    }]
                }]
            }"#,
        )
        .unwrap();

        let services = file.services().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].check_interval, Duration::minutes(5));
        assert_eq!(services[1].host, "localhost");

        let checks = file.notification_checks().unwrap();
        let rule = &checks[0].definitions[0];
        assert_eq!(rule.resource, Some(MonitoredResource::layer("geonode:roads")));
        assert_eq!(rule.ows_service.as_deref(), Some("WMS"));
        assert_eq!(rule.max_value, Some(10.0));
    }

    #[test]
    fn test_invalid_rules() {
        for rule in [
            r#"{"metric": "no.such.metric", "max_value": 1}"#,
            r#"{"metric": "request.count"}"#,
            r#"{"metric": "request.count", "min_value": 5, "max_value": 1}"#,
            r#"{"metric": "request.count", "max_timeout_secs": 0}"#,
            r#"{"metric": "request.count", "max_timeout_secs": 9223372036854775807}"#,
            r#"{"metric": "request.count", "resource": "roads", "max_value": 1}"#,
        ] {
            let raw = format!(
                r#"{{"notification_checks": [{{"name": "c", "definitions": [{}]}}]}}"#,
                rule
            );
            let file = ConfigFile::parse(&raw).unwrap();
            assert!(file.notification_checks().is_err(), "{} accepted", rule);
        }
    }

    #[test]
    fn test_oversized_service_interval() {
        let file = ConfigFile::parse(
            r#"{"services": [{"name": "geonode", "type": "geonode",
                "check_interval_secs": 9223372036854775807}]}"#,
        )
        .unwrap();
        assert!(matches!(file.services(), Err(MonitoringError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_sync_into_store() {
        let store = MonitoringStore::open_in_memory().unwrap();
        let file = ConfigFile::parse(
            r#"{"services": [{"name": "geonode", "type": "geonode"}],
                "notification_checks": [{"name": "c", "definitions": [
                    {"metric": "request.count", "max_timeout_secs": 600}]}]}"#,
        )
        .unwrap();
        let mut config = MonitoringConfig::from_lookup(lookup(&[])).unwrap();
        config.services = file.services().unwrap();
        config.notification_checks = file.notification_checks().unwrap();

        config.sync(&store).await.unwrap();
        config.sync(&store).await.unwrap();

        assert_eq!(store.list_services().await.unwrap().len(), 1);
        let checks = store.notification_checks(false).await.unwrap();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].definitions[0].max_timeout, Some(Duration::minutes(10)));
    }
}
