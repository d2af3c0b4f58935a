use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ExceptionEvent, MonitoredResource, NormalizedRequest, RequestEvent};
use crate::periods::from_millis;
use crate::{MonitoringError, Result};

/// Longest error chain accepted from a single record.
pub const MAX_ERROR_CHAIN: usize = 64;

/// Root element name used when GeoServer request data is converted from XML.
const GEOSERVER_ROOT: &str = "org.geoserver.monitor.RequestData";

/// One raw request record, before normalization.
#[derive(Debug, Clone)]
pub enum RawRecord {
    /// Structured request document from the GeoServer monitor log.
    GeoServer(Value),
    /// Request observed by the host application itself.
    Observed(ObservedRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedRequest {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub query_string: Option<String>,
    pub status: u16,
    pub response_size: i64,
    pub content_type: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub resources: Vec<MonitoredResource>,
    pub exception: Option<ObservedException>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedException {
    pub error_type: String,
    pub message: String,
    pub traceback: String,
}

/// Normalize one raw record for `service` into a request event and its
/// exception chain.
pub fn normalize(service: &str, record: &RawRecord) -> Result<NormalizedRequest> {
    match record {
        RawRecord::GeoServer(doc) => from_geoserver(service, doc),
        RawRecord::Observed(observed) => from_observed(service, observed),
    }
}

pub fn from_geoserver(service: &str, doc: &Value) -> Result<NormalizedRequest> {
    let doc = match doc.get(GEOSERVER_ROOT) {
        Some(inner) => inner,
        None => doc,
    };
    if !doc.is_object() {
        return Err(MonitoringError::Normalization(
            "request record is not an object".to_string(),
        ));
    }

    let source_id = text(doc, "internalid")
        .or_else(|| text(doc, "id"))
        .ok_or_else(|| missing("internalid"))?;
    let created = parse_timestamp_value(doc.get("startTime").ok_or_else(|| missing("startTime"))?)?;
    let request_method = text(doc, "httpMethod").ok_or_else(|| missing("httpMethod"))?;

    let total_time = non_negative(doc, "totalTime")?;
    let finished = match doc.get("endTime") {
        Some(value) => parse_timestamp_value(value)?,
        None => {
            let elapsed = Duration::try_milliseconds(total_time.unwrap_or(0.0) as i64)
                .ok_or_else(|| out_of_range_field("totalTime"))?;
            created
                .checked_add_signed(elapsed)
                .ok_or_else(|| out_of_range_field("totalTime"))?
        }
    };
    if finished < created {
        return Err(MonitoringError::Normalization(format!(
            "request {} ends before it starts",
            source_id
        )));
    }
    let response_time = total_time
        .unwrap_or_else(|| (finished - created).num_milliseconds() as f64);

    let error = doc.get("error").filter(|e| !e.is_null());
    let failed = error.is_some() || text(doc, "status").as_deref() == Some("FAILED");
    let response_status = match number(doc, "responseStatus") {
        Some(status) => status as u16,
        None if failed => 500,
        None => 200,
    };

    let event = RequestEvent {
        source_id: Some(source_id),
        service: service.to_string(),
        created,
        finished,
        response_time,
        request_method,
        request_path: text(doc, "path").unwrap_or_else(|| "/".to_string()),
        query_string: text(doc, "queryString"),
        ows_service: text(doc, "service").map(|s| s.to_ascii_uppercase()),
        response_status,
        response_size: non_negative(doc, "responseLength")?.unwrap_or(0.0) as i64,
        response_type: text(doc, "responseContentType"),
        client_ip: text(doc, "remoteAddr").or_else(|| text(doc, "remoteHost")),
        user_agent: text(doc, "remoteUserAgent"),
        resources: resources(doc.get("resources")),
    };

    let exceptions = match error {
        Some(root) => error_chain(root, text(doc, "errorMessage"))?,
        None => Vec::new(),
    };

    Ok(NormalizedRequest { event, exceptions })
}

pub fn from_observed(service: &str, observed: &ObservedRequest) -> Result<NormalizedRequest> {
    if observed.method.trim().is_empty() {
        return Err(missing("method"));
    }
    if observed.finished < observed.started {
        return Err(MonitoringError::Normalization(format!(
            "request to {} ends before it starts",
            observed.path
        )));
    }

    let mut resources = Vec::new();
    for resource in &observed.resources {
        if !resources.contains(resource) {
            resources.push(resource.clone());
        }
    }

    let event = RequestEvent {
        source_id: None,
        service: service.to_string(),
        created: observed.started,
        finished: observed.finished,
        response_time: (observed.finished - observed.started).num_milliseconds() as f64,
        request_method: observed.method.to_ascii_uppercase(),
        request_path: observed.path.clone(),
        query_string: observed.query_string.clone(),
        ows_service: None,
        response_status: observed.status,
        response_size: observed.response_size,
        response_type: observed.content_type.clone(),
        client_ip: observed.client_ip.clone(),
        user_agent: observed.user_agent.clone(),
        resources,
    };

    let exceptions = observed
        .exception
        .iter()
        .map(|exc| ExceptionEvent {
            error_type: exc.error_type.clone(),
            error_message: exc.message.clone(),
            stack_trace: exc.traceback.clone(),
            parent: None,
        })
        .collect();

    Ok(NormalizedRequest { event, exceptions })
}

/// Flatten a nested `error`/`cause` tree into exception events, outermost
/// first.
///
/// Every node that wraps a further cause yields one event. The innermost
/// cause is folded into the trace of the event wrapping it, so a record whose
/// error has a single cause level yields exactly one event typed after the
/// outer error. An error without any cause yields one event of its own.
fn error_chain(root: &Value, fallback_message: Option<String>) -> Result<Vec<ExceptionEvent>> {
    let mut nodes = Vec::new();
    let mut current = Some(root);
    while let Some(node) = current {
        if nodes.len() == MAX_ERROR_CHAIN {
            return Err(MonitoringError::Normalization(format!(
                "error chain deeper than {} levels",
                MAX_ERROR_CHAIN
            )));
        }
        nodes.push(node);
        current = node.get("cause").filter(|c| c.is_object());
    }

    let innermost = if nodes.len() > 1 { nodes.pop() } else { None };

    let mut events: Vec<ExceptionEvent> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| ExceptionEvent {
            error_type: error_type(node),
            error_message: text(node, "detailMessage")
                .or_else(|| text(node, "message"))
                .unwrap_or_default(),
            stack_trace: stack_trace(node),
            parent: idx.checked_sub(1),
        })
        .collect();

    if let (Some(first), Some(message)) = (events.first_mut(), fallback_message) {
        if first.error_message.is_empty() {
            first.error_message = message;
        }
    }

    if let (Some(leaf), Some(last)) = (innermost, events.last_mut()) {
        let mut trace = std::mem::take(&mut last.stack_trace);
        if !trace.is_empty() {
            trace.push('\n');
        }
        trace.push_str(&format!(
            "Caused by: {}: {}",
            error_type(leaf),
            text(leaf, "detailMessage").unwrap_or_default()
        ));
        let leaf_trace = stack_trace(leaf);
        if !leaf_trace.is_empty() {
            trace.push('\n');
            trace.push_str(&leaf_trace);
        }
        last.stack_trace = trace;
    }

    Ok(events)
}

fn error_type(node: &Value) -> String {
    text(node, "class")
        .or_else(|| text(node, "type"))
        .unwrap_or_else(|| "java.lang.Exception".to_string())
}

fn stack_trace(node: &Value) -> String {
    let traces = match node.get("stackTrace") {
        Some(Value::Object(map)) => map.get("trace"),
        other => other,
    };
    match traces {
        Some(Value::Array(lines)) => lines
            .iter()
            .filter_map(value_text)
            .map(|line| format!("\tat {}", line))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(value) => value_text(value).map(|line| format!("\tat {}", line)).unwrap_or_default(),
        None => String::new(),
    }
}

/// Resource names are listed either as a plain array or wrapped in a
/// `string` element; repeated names are kept once.
fn resources(value: Option<&Value>) -> Vec<MonitoredResource> {
    let names: Vec<String> = match value {
        Some(Value::Array(items)) => items.iter().filter_map(value_text).collect(),
        Some(Value::Object(map)) => match map.get("string") {
            Some(Value::Array(items)) => items.iter().filter_map(value_text).collect(),
            Some(item) => value_text(item).into_iter().collect(),
            None => Vec::new(),
        },
        Some(item) => value_text(item).into_iter().collect(),
        None => Vec::new(),
    };

    let mut out: Vec<MonitoredResource> = Vec::new();
    for name in names {
        let resource = MonitoredResource::layer(&name);
        if !out.contains(&resource) {
            out.push(resource);
        }
    }
    out
}

fn missing(field: &str) -> MonitoringError {
    MonitoringError::Normalization(format!("missing required field {}", field))
}

fn text(doc: &Value, key: &str) -> Option<String> {
    doc.get(key).and_then(value_text)
}

fn value_text(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if raw.is_empty() {
        None
    } else {
        Some(raw)
    }
}

fn number(doc: &Value, key: &str) -> Option<f64> {
    match doc.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// A numeric field that must be finite, non-negative and fit in an `i64`.
fn non_negative(doc: &Value, key: &str) -> Result<Option<f64>> {
    match number(doc, key) {
        Some(n) if !n.is_finite() || n < 0.0 || n >= i64::MAX as f64 => Err(out_of_range_field(key)),
        other => Ok(other),
    }
}

fn out_of_range_field(field: &str) -> MonitoringError {
    MonitoringError::Normalization(format!("field {} out of range", field))
}

fn parse_timestamp_value(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| MonitoringError::Normalization(format!("bad timestamp {}", n)))
            .and_then(|ms| {
                from_millis(ms).map_err(|_| {
                    MonitoringError::Normalization(format!("timestamp out of range: {}", ms))
                })
            }),
        Value::String(s) => parse_timestamp(s),
        other => Err(MonitoringError::Normalization(format!(
            "bad timestamp {}",
            other
        ))),
    }
}

/// Parses RFC 3339 or `YYYY-MM-DD HH:MM:SS[.fff][ UTC]` (taken as UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let naive = raw.strip_suffix("UTC").map(str::trim_end).unwrap_or(raw);
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(|dt| Utc.from_utc_datetime(&dt))
        .map_err(|e| MonitoringError::Normalization(format!("cannot parse timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn failed_request() -> Value {
        json!({
            "org.geoserver.monitor.RequestData": {
                "internalid": 1825,
                "id": 1825,
                "status": "FAILED",
                "category": "OWS",
                "path": "/wms",
                "queryString": "SERVICE=WMS&VERSION=1.3.0&REQUEST=GetMap&LAYERS=unesco:Unesco_point",
                "httpMethod": "GET",
                "startTime": "2017-06-20 11:33:22.336 UTC",
                "endTime": "2017-06-20 11:33:22.344 UTC",
                "totalTime": 8,
                "remoteAddr": "217.110.187.74",
                "remoteHost": "217.110.187.74",
                "remoteUserAgent": "Mozilla/5.0 (Windows NT 6.3; Win64; x64)",
                "service": "WMS",
                "operation": "GetMap",
                "owsVersion": "1.3.0",
                "resources": {"string": "unesco:Unesco_point"},
                "responseLength": 447,
                "responseContentType": "text/xml;charset=UTF-8",
                "errorMessage": "Rendering process failed",
                "error": {
                    "class": "org.geoserver.platform.ServiceException",
                    "detailMessage": "Rendering process failed",
                    "cause": {
                        "class": "java.lang.IndexOutOfBoundsException",
                        "detailMessage": "Index: 0",
                        "stackTrace": {"trace": [
                            "java.util.Collections$EmptyList.get(Collections.java:4454)",
                            "org.geotools.renderer.lite.StreamingRenderer.createBBoxFilters(StreamingRenderer.java:1666)"
                        ]}
                    }
                }
            }
        })
    }

    fn finished_request() -> Value {
        json!({
            "internalid": "12681",
            "status": "FINISHED",
            "path": "/wms",
            "httpMethod": "GET",
            "startTime": "2017-05-30 16:04:00.719 UTC",
            "endTime": "2017-05-30 16:04:00.809 UTC",
            "totalTime": 90,
            "remoteAddr": "201.195.233.98",
            "service": "wms",
            "resources": ["nurc:Arc_Sample", "nurc:Arc_Sample", "nurc:Img_Sample"],
            "responseLength": 3622,
            "responseContentType": "image/png",
            "responseStatus": 200
        })
    }

    #[test]
    fn test_gs_req() {
        let normalized = from_geoserver("geoserver", &finished_request()).unwrap();
        let event = &normalized.event;

        assert_eq!(event.source_id.as_deref(), Some("12681"));
        assert_eq!(event.response_time, 90.0);
        assert_eq!(event.response_status, 200);
        assert_eq!(event.ows_service.as_deref(), Some("WMS"));
        assert_eq!(
            event.resources,
            vec![
                MonitoredResource::layer("nurc:Arc_Sample"),
                MonitoredResource::layer("nurc:Img_Sample"),
            ]
        );
        assert!(normalized.exceptions.is_empty());
    }

    #[test]
    fn test_gs_err_req() {
        let normalized = from_geoserver("geoserver", &failed_request()).unwrap();

        assert_eq!(normalized.event.response_status, 500);
        assert_eq!(normalized.event.resources, vec![MonitoredResource::layer("unesco:Unesco_point")]);
        assert_eq!(normalized.exceptions.len(), 1);

        let exc = &normalized.exceptions[0];
        assert_eq!(exc.error_type, "org.geoserver.platform.ServiceException");
        assert_eq!(exc.error_message, "Rendering process failed");
        assert_eq!(exc.parent, None);
        assert!(exc
            .stack_trace
            .starts_with("Caused by: java.lang.IndexOutOfBoundsException: Index: 0"));
        assert!(exc.stack_trace.contains("StreamingRenderer.createBBoxFilters"));
    }

    #[test]
    fn test_chain_order_is_outer_to_inner() {
        let doc = json!({
            "internalid": 7,
            "httpMethod": "GET",
            "startTime": "2017-06-20T11:33:22Z",
            "error": {
                "class": "a.Outer",
                "cause": {
                    "class": "b.Middle",
                    "cause": {
                        "class": "c.Inner",
                        "cause": {"class": "d.Root", "detailMessage": "boom"}
                    }
                }
            }
        });

        let normalized = from_geoserver("gs", &doc).unwrap();
        let types: Vec<_> = normalized.exceptions.iter().map(|e| e.error_type.as_str()).collect();
        let parents: Vec<_> = normalized.exceptions.iter().map(|e| e.parent).collect();

        assert_eq!(types, vec!["a.Outer", "b.Middle", "c.Inner"]);
        assert_eq!(parents, vec![None, Some(0), Some(1)]);
        assert!(normalized.exceptions[2].stack_trace.contains("d.Root: boom"));
    }

    #[test]
    fn test_single_error_without_cause() {
        let mut doc = finished_request();
        doc["error"] = json!({"class": "java.io.IOException", "detailMessage": "closed"});

        let normalized = from_geoserver("gs", &doc).unwrap();
        assert_eq!(normalized.exceptions.len(), 1);
        assert_eq!(normalized.exceptions[0].error_type, "java.io.IOException");
        assert_eq!(normalized.event.response_status, 200);
    }

    #[test]
    fn test_chain_depth_is_bounded() {
        let mut error = json!({"class": "leaf"});
        for level in 0..MAX_ERROR_CHAIN {
            error = json!({"class": format!("level{}", level), "cause": error});
        }
        let mut doc = finished_request();
        doc["error"] = error;

        assert!(matches!(
            from_geoserver("gs", &doc),
            Err(MonitoringError::Normalization(_))
        ));
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let mut doc = finished_request();
        doc.as_object_mut().unwrap().remove("startTime");
        assert!(matches!(
            from_geoserver("gs", &doc),
            Err(MonitoringError::Normalization(_))
        ));

        let mut doc = finished_request();
        doc["startTime"] = json!("yesterday");
        assert!(matches!(
            from_geoserver("gs", &doc),
            Err(MonitoringError::Normalization(_))
        ));

        assert!(from_geoserver("gs", &json!("not a record")).is_err());
    }

    #[test]
    fn test_out_of_range_numbers_are_rejected() {
        for (field, value) in [
            ("totalTime", json!(1e20)),
            ("totalTime", json!(-1e20)),
            ("totalTime", json!(-5)),
            ("responseLength", json!(1e30)),
            ("responseLength", json!(-1)),
        ] {
            let mut doc = finished_request();
            doc.as_object_mut().unwrap().remove("endTime");
            doc[field] = value.clone();
            assert!(
                matches!(from_geoserver("gs", &doc), Err(MonitoringError::Normalization(_))),
                "{} = {} accepted",
                field,
                value
            );
        }

        // Within the i64 range but past the last representable date.
        let mut doc = finished_request();
        doc.as_object_mut().unwrap().remove("endTime");
        doc["totalTime"] = json!(9.0e18);
        assert!(matches!(
            from_geoserver("gs", &doc),
            Err(MonitoringError::Normalization(_))
        ));
    }

    #[test]
    fn test_gn_request() {
        let started = parse_timestamp("2017-06-20 12:00:00").unwrap();
        let observed = ObservedRequest {
            started,
            finished: started + Duration::milliseconds(120),
            method: "get".to_string(),
            path: "/layers/geonode:roads".to_string(),
            query_string: None,
            status: 404,
            response_size: 1024,
            content_type: Some("text/html".to_string()),
            client_ip: Some("127.0.0.1".to_string()),
            user_agent: Some("Mozilla/5.0 (X11; Linux x86_64)".to_string()),
            resources: vec![
                MonitoredResource::layer("geonode:roads"),
                MonitoredResource::layer("geonode:roads"),
            ],
            exception: Some(ObservedException {
                error_type: "django.http.response.Http404".to_string(),
                message: "No Layer matches the given query.".to_string(),
                traceback: "Traceback (most recent call last)".to_string(),
            }),
        };

        let normalized = normalize("geonode", &RawRecord::Observed(observed)).unwrap();
        assert_eq!(normalized.event.request_method, "GET");
        assert_eq!(normalized.event.response_time, 120.0);
        assert_eq!(normalized.event.resources, vec![MonitoredResource::layer("geonode:roads")]);
        assert_eq!(normalized.exceptions.len(), 1);
        assert_eq!(normalized.exceptions[0].error_type, "django.http.response.Http404");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2017, 6, 20, 11, 33, 22).unwrap();
        assert_eq!(parse_timestamp("2017-06-20 11:33:22").unwrap(), expected);
        assert_eq!(parse_timestamp("2017-06-20T11:33:22Z").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2017-06-20 11:33:22.336 UTC").unwrap(),
            expected + Duration::milliseconds(336)
        );
        assert!(parse_timestamp("20/06/2017").is_err());
    }
}
