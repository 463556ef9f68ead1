use crate::config::WafConfig;
use crate::error::{AppSecError, Result};
use crate::waf::addresses;
use crate::waf::engine::{EvaluationContext, WafEngine, WafResult};
use crate::waf::object::WafObject;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use metrics::counter;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, warn};

type EventRateLimiter =
    RateLimiter<governor::state::direct::NotKeyed, InMemoryState, DefaultClock>;

/// Ruleset document compiled when no path override is configured.
const DEFAULT_RULES: &str = include_str!("../../rules.json");

/// Context item keys shared with the embedding server.
pub mod items {
    pub const REQUEST_QUERY: &str = "http.request.query";
    pub const REQUEST_HEADERS: &str = "http.request.headers";
    pub const REQUEST_HEADERS_CASE_SENSITIVE: &str = "http.request.headers_case_sensitive";
    pub const REQUEST_URI: &str = "http.request.uri";
    pub const REQUEST_METHOD: &str = "http.request.method";
    pub const REQUEST_PATH_PARAMS: &str = "http.request.path_params";
    pub const REQUEST_COOKIES: &str = "http.request.cookies";
    pub const REQUEST_BODY: &str = "http.request.body";
    pub const REQUEST_REMOTE_IP: &str = "http.request.remote_ip";
    pub const REQUEST_BLOCKED: &str = "http.request.blocked";
    pub const REQUEST_WAF_JSON: &str = "http.request.waf_json";
    pub const REQUEST_WAF_DURATION: &str = "http.request.waf_duration";
    pub const REQUEST_WAF_DURATION_EXT: &str = "http.request.waf_duration_ext";
    pub const RESPONSE_STATUS: &str = "http.response.status";
    pub const RESPONSE_HEADERS: &str = "http.response.headers";
}

/// Tag and metric names stamped on the unit of work.
pub mod tags {
    pub const APPSEC_ENABLED: &str = "_dd.appsec.enabled";
    pub const APPSEC_JSON: &str = "_dd.appsec.json";
    pub const APPSEC_EVENT: &str = "appsec.event";
    pub const APPSEC_BLOCKED: &str = "appsec.blocked";
    pub const ACTOR_IP: &str = "actor.ip";
    pub const ORIGIN: &str = "_dd.origin";
    pub const ORIGIN_APPSEC: &str = "appsec";
    pub const RUNTIME_FAMILY: &str = "_dd.runtime_family";
    pub const WAF_DURATION: &str = "_dd.appsec.waf.duration";
    pub const WAF_DURATION_EXT: &str = "_dd.appsec.waf.duration_ext";
    pub const WAF_VERSION: &str = "_dd.appsec.waf.version";
    pub const EVENT_RULES_LOADED: &str = "_dd.appsec.event_rules.loaded";
    pub const EVENT_RULES_ERROR_COUNT: &str = "_dd.appsec.event_rules.error_count";
    pub const EVENT_RULES_ERRORS: &str = "_dd.appsec.event_rules.errors";
    pub const EVENT_RULES_VERSION: &str = "_dd.appsec.event_rules.version";
}

/// Request headers snapshotted as tags when an event is recorded.
const COLLECTED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "content-encoding",
    "content-language",
    "content-length",
    "content-type",
    "forwarded",
    "forwarded-for",
    "host",
    "true-client-ip",
    "user-agent",
    "via",
    "x-client-ip",
    "x-cluster-client-ip",
    "x-forwarded",
    "x-forwarded-for",
    "x-real-ip",
];

/// Header names consulted, in order, when resolving the client IP.
const IP_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "x-real-ip",
    "true-client-ip",
    "x-client-ip",
    "x-forwarded",
    "forwarded-for",
    "x-cluster-client-ip",
];

/// The unit of work carrying one logical request.
///
/// The processor only reads and writes named context items, tags, metrics
/// and the retention flag; span mechanics live with the embedding server.
#[derive(Debug, Default)]
pub struct RequestRecord {
    web: bool,
    items: HashMap<String, Value>,
    tags: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
    keep: bool,
}

impl RequestRecord {
    pub fn new() -> Self {
        Self {
            web: true,
            ..Default::default()
        }
    }

    /// A record for a non-web unit of work; the final evaluation skips it.
    pub fn non_web() -> Self {
        Self::default()
    }

    pub fn set_item(&mut self, key: &str, value: Value) {
        self.items.insert(key.to_string(), value);
    }

    pub fn get_item(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    pub fn set_tag(&mut self, key: &str, value: impl Into<String>) {
        self.tags.insert(key.to_string(), value.into());
    }

    pub fn get_tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn set_metric(&mut self, key: &str, value: f64) {
        self.metrics.insert(key.to_string(), value);
    }

    pub fn get_metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    /// Force retention of this unit of work.
    pub fn mark_keep(&mut self) {
        self.keep = true;
    }

    pub fn is_kept(&self) -> bool {
        self.keep
    }

    fn blocked(&self) -> bool {
        matches!(self.items.get(items::REQUEST_BLOCKED), Some(Value::Bool(true)))
    }
}

/// Request-lifecycle security decision logic.
///
/// Collects the attributes the compiled ruleset declared as required, runs
/// the early IP check and the final full check, and records the security
/// event behind a token-bucket rate limiter.
#[derive(Debug)]
pub struct AppSecProcessor {
    engine: Arc<WafEngine>,
    addresses_to_keep: HashSet<String>,
    rate_limiter: EventRateLimiter,
    waf_timeout: std::time::Duration,
}

impl AppSecProcessor {
    /// Load the ruleset (path override or embedded default) and initialize
    /// the engine. Missing or unparseable rule files are fatal here.
    pub fn new(config: &WafConfig) -> Result<Self> {
        let rules_json: Value = match &config.rules_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AppSecError::ConfigLoad(format!("could not read rule file {path}: {e}"))
                })?;
                serde_json::from_str(&raw).map_err(|e| {
                    AppSecError::ConfigLoad(format!("rule file {path} is not valid JSON: {e}"))
                })?
            }
            None => serde_json::from_str(DEFAULT_RULES)
                .map_err(|e| AppSecError::ConfigLoad(format!("embedded ruleset invalid: {e}")))?,
        };

        let engine = WafEngine::new(
            &rules_json,
            &config.obfuscation_parameter_key_regexp,
            &config.obfuscation_parameter_value_regexp,
        )?;

        let mut addresses_to_keep = engine.required_addresses();
        // Header snapshots are reported with every event, so both header
        // addresses are always collected.
        addresses_to_keep.insert(addresses::SERVER_REQUEST_HEADERS_NO_COOKIES.to_string());
        addresses_to_keep.insert(addresses::SERVER_RESPONSE_HEADERS_NO_COOKIES.to_string());

        let quota =
            Quota::per_second(NonZeroU32::new(config.trace_rate_limit).unwrap_or(NonZeroU32::MIN));

        // A zero budget would make every run an InvalidArgument error;
        // fall back to the engine-side cap instead.
        let waf_timeout = if config.timeout_ms == 0 {
            std::time::Duration::from_micros(crate::config::ENGINE_RUN_TIMEOUT_US)
        } else {
            std::time::Duration::from_millis(config.timeout_ms)
        };

        Ok(Self {
            engine: Arc::new(engine),
            addresses_to_keep,
            rate_limiter: RateLimiter::direct(quota),
            waf_timeout,
        })
    }

    /// Engine handle for remote-config driven updates.
    pub fn engine(&self) -> Arc<WafEngine> {
        Arc::clone(&self.engine)
    }

    /// Start a per-request evaluation context.
    pub fn new_context(&self) -> EvaluationContext {
        self.engine.new_context()
    }

    fn is_needed(&self, address: &str) -> bool {
        self.addresses_to_keep.contains(address)
    }

    /// Request-start hook: stash the raw headers, resolve the client IP and
    /// run the narrow IP-only check. Returns true when the request is
    /// pre-decided as blocked; actually rejecting it is the caller's job.
    pub fn on_request_start(
        &self,
        record: &mut RequestRecord,
        ctx: &mut EvaluationContext,
        peer_ip: Option<IpAddr>,
        headers: &[(String, String)],
        headers_case_sensitive: bool,
    ) -> bool {
        let header_pairs: Vec<Value> = headers
            .iter()
            .map(|(k, v)| json!([k, v]))
            .collect();
        record.set_item(items::REQUEST_HEADERS, Value::Array(header_pairs));
        record.set_item(
            items::REQUEST_HEADERS_CASE_SENSITIVE,
            Value::Bool(headers_case_sensitive),
        );

        let Some(client_ip) = resolve_client_ip(headers, peer_ip) else {
            return false;
        };
        record.set_item(items::REQUEST_REMOTE_IP, Value::from(client_ip.to_string()));

        if !self.is_needed(addresses::HTTP_CLIENT_IP) {
            return false;
        }

        let mut ip_only = serde_json::Map::new();
        ip_only.insert(
            addresses::HTTP_CLIENT_IP.to_string(),
            Value::from(client_ip.to_string()),
        );
        match self.run_waf(ctx, &Value::Object(ip_only)) {
            Some(result) if result.is_block() => {
                debug!(ip = %client_ip, "WAF pre-decided block on client IP");
                record.set_item(
                    items::REQUEST_WAF_JSON,
                    json!({ "triggers": result.triggers }),
                );
                record.set_item(
                    items::REQUEST_WAF_DURATION,
                    Value::from(result.duration.as_micros() as u64),
                );
                record.set_item(
                    items::REQUEST_WAF_DURATION_EXT,
                    Value::from(result.total_duration.as_micros() as u64),
                );
                record.set_item(items::REQUEST_BLOCKED, Value::Bool(true));
                counter!("appsec_requests_blocked_total", 1);
                true
            }
            _ => false,
        }
    }

    /// Request-end hook: run the full evaluation over the collected
    /// attributes and record the security event when allowed by the rate
    /// limiter. Evaluation failures never abort the request lifecycle.
    pub fn on_request_finish(&self, record: &mut RequestRecord, ctx: &mut EvaluationContext) {
        if !record.web {
            return;
        }
        record.set_metric(tags::APPSEC_ENABLED, 1.0);
        record.set_tag(tags::RUNTIME_FAMILY, "rust");

        let data = self.assemble_data(record);
        debug!(addresses = data.as_object().map(|m| m.len()).unwrap_or(0), "Executing final WAF evaluation");

        let blocked = record.blocked();
        let result = if blocked {
            // The early IP check already decided; its result items carry
            // the durations and triggers.
            None
        } else {
            self.run_waf(ctx, &data)
        };

        if let Err(e) = self.report_ruleset_metrics(record, blocked, result.as_ref()) {
            warn!(error = %e, "Error reporting WAF metrics");
        }

        let matched = result.as_ref().map(|r| r.matched).unwrap_or(false);
        if !matched && !blocked {
            return;
        }

        // The limiter only gates event recording, not evaluation.
        if self.rate_limiter.check().is_err() {
            counter!("appsec_events_rate_limited_total", 1);
            return;
        }

        if let Some(headers) = data.get(addresses::SERVER_REQUEST_HEADERS_NO_COOKIES) {
            set_header_tags(record, headers, "request");
        }
        if let Some(headers) = data.get(addresses::SERVER_RESPONSE_HEADERS_NO_COOKIES) {
            set_header_tags(record, headers, "response");
        }

        if let Some(result) = &result {
            record.set_tag(
                tags::APPSEC_JSON,
                json!({ "triggers": result.triggers }).to_string(),
            );
        } else if let Some(stored) = record.get_item(items::REQUEST_WAF_JSON).cloned() {
            record.set_tag(tags::APPSEC_JSON, stored.to_string());
            record.set_tag(tags::APPSEC_BLOCKED, "true");
        }

        record.set_tag(tags::APPSEC_EVENT, "true");

        if let Some(Value::String(ip)) = record.get_item(items::REQUEST_REMOTE_IP).cloned() {
            record.set_tag(tags::ACTOR_IP, ip);
        }

        record.mark_keep();
        if record.get_tag(tags::ORIGIN).is_none() {
            record.set_tag(tags::ORIGIN, tags::ORIGIN_APPSEC);
        }
        counter!("appsec_events_recorded_total", 1);
    }

    /// Build the address map restricted to what the ruleset declared.
    fn assemble_data(&self, record: &RequestRecord) -> Value {
        let mut data = serde_json::Map::new();

        let mut copy_item = |address: &str, item: &str| {
            if self.is_needed(address) {
                if let Some(value) = record.get_item(item) {
                    data.insert(address.to_string(), value.clone());
                }
            }
        };

        copy_item(addresses::SERVER_REQUEST_QUERY, items::REQUEST_QUERY);
        copy_item(addresses::SERVER_REQUEST_URI_RAW, items::REQUEST_URI);
        copy_item(addresses::SERVER_REQUEST_METHOD, items::REQUEST_METHOD);
        copy_item(
            addresses::SERVER_REQUEST_PATH_PARAMS,
            items::REQUEST_PATH_PARAMS,
        );
        copy_item(addresses::SERVER_REQUEST_COOKIES, items::REQUEST_COOKIES);
        copy_item(addresses::SERVER_RESPONSE_STATUS, items::RESPONSE_STATUS);
        copy_item(addresses::SERVER_REQUEST_BODY, items::REQUEST_BODY);
        copy_item(addresses::HTTP_CLIENT_IP, items::REQUEST_REMOTE_IP);

        if self.is_needed(addresses::SERVER_REQUEST_HEADERS_NO_COOKIES) {
            if let Some(headers) = record.get_item(items::REQUEST_HEADERS) {
                data.insert(
                    addresses::SERVER_REQUEST_HEADERS_NO_COOKIES.to_string(),
                    transform_headers(headers),
                );
            }
        }
        if self.is_needed(addresses::SERVER_RESPONSE_HEADERS_NO_COOKIES) {
            if let Some(headers) = record.get_item(items::RESPONSE_HEADERS) {
                data.insert(
                    addresses::SERVER_RESPONSE_HEADERS_NO_COOKIES.to_string(),
                    transform_headers(headers),
                );
            }
        }

        Value::Object(data)
    }

    fn run_waf(&self, ctx: &mut EvaluationContext, data: &Value) -> Option<WafResult> {
        let encoded = match WafObject::encode(data) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode WAF input");
                return None;
            }
        };
        match ctx.run(encoded, self.waf_timeout) {
            Ok(result) => Some(result),
            Err(e) => {
                // Evaluation errors are treated as no-match.
                warn!(error = %e, "WAF evaluation failed");
                None
            }
        }
    }

    fn report_ruleset_metrics(
        &self,
        record: &mut RequestRecord,
        blocked: bool,
        result: Option<&WafResult>,
    ) -> Result<()> {
        let info = self.engine.ruleset_info();
        if !info.errors.is_empty() {
            record.set_tag(
                tags::EVENT_RULES_ERRORS,
                serde_json::to_string(&info.errors)?,
            );
        }
        record.set_tag(tags::EVENT_RULES_VERSION, info.version);
        record.set_tag(tags::WAF_VERSION, WafEngine::version());
        record.set_metric(tags::EVENT_RULES_LOADED, f64::from(info.loaded));
        record.set_metric(tags::EVENT_RULES_ERROR_COUNT, f64::from(info.failed));

        match (blocked, result) {
            (false, Some(result)) => {
                record.set_metric(tags::WAF_DURATION, result.duration.as_micros() as f64);
                record.set_metric(
                    tags::WAF_DURATION_EXT,
                    result.total_duration.as_micros() as f64,
                );
            }
            (true, _) => {
                // Blocked requests ran the engine earlier; reuse the stored
                // durations.
                if let Some(us) = record
                    .get_item(items::REQUEST_WAF_DURATION)
                    .and_then(Value::as_u64)
                {
                    record.set_metric(tags::WAF_DURATION, us as f64);
                }
                if let Some(us) = record
                    .get_item(items::REQUEST_WAF_DURATION_EXT)
                    .and_then(Value::as_u64)
                {
                    record.set_metric(tags::WAF_DURATION_EXT, us as f64);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Normalize a header collection for the no-cookies addresses: lowercase
/// keys, drop cookie headers, fold duplicates into ordered lists.
pub fn transform_headers(raw: &Value) -> Value {
    let mut normalized = serde_json::Map::new();

    let pairs: Vec<(String, Value)> = match raw {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|pair| {
                let name = pair.get(0)?.as_str()?.to_string();
                let value = pair.get(1)?.clone();
                Some((name, value))
            })
            .collect(),
        _ => return Value::Object(normalized),
    };

    for (name, value) in pairs {
        let name = name.to_lowercase();
        if name == "cookie" || name == "set-cookie" {
            continue;
        }
        match normalized.get_mut(&name) {
            Some(Value::Array(existing)) => existing.push(value),
            Some(single) => {
                let first = single.take();
                *single = Value::Array(vec![first, value]);
            }
            None => {
                normalized.insert(name, value);
            }
        }
    }

    Value::Object(normalized)
}

/// Snapshot allow-listed headers as tags on the record.
fn set_header_tags(record: &mut RequestRecord, headers: &Value, kind: &str) {
    let Some(map) = headers.as_object() else {
        return;
    };
    for (name, value) in map {
        if !COLLECTED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(","),
            other => other.to_string(),
        };
        record.set_tag(&format!("http.{kind}.headers.{name}"), rendered);
    }
}

/// Resolve the client IP from forwarding headers, falling back to the peer
/// address.
pub fn resolve_client_ip(headers: &[(String, String)], peer_ip: Option<IpAddr>) -> Option<IpAddr> {
    for wanted in IP_HEADERS {
        for (name, value) in headers {
            if !name.eq_ignore_ascii_case(wanted) {
                continue;
            }
            // Forwarding headers may carry a comma-separated chain; the
            // first parseable entry wins.
            for candidate in value.split(',') {
                let candidate = candidate.trim();
                if let Ok(ip) = candidate.parse::<IpAddr>() {
                    return Some(ip);
                }
                // host:port form
                if let Some((host, _)) = candidate.rsplit_once(':') {
                    if let Ok(ip) = host.parse::<IpAddr>() {
                        return Some(ip);
                    }
                }
            }
        }
    }
    peer_ip
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transform_headers_filters_cookies_and_folds_duplicates() {
        let raw = json!([
            ["Host", "example.com"],
            ["Cookie", "secret=1"],
            ["Accept", "text/html"],
            ["ACCEPT", "application/json"],
            ["Set-Cookie", "session=2"]
        ]);
        let out = transform_headers(&raw);
        let map = out.as_object().unwrap();
        assert_eq!(map["host"], "example.com");
        assert_eq!(map["accept"], json!(["text/html", "application/json"]));
        assert!(!map.contains_key("cookie"));
        assert!(!map.contains_key("set-cookie"));
    }

    #[test]
    fn test_resolve_client_ip_prefers_forwarding_headers() {
        let headers = vec![
            ("User-Agent".to_string(), "t".to_string()),
            (
                "X-Forwarded-For".to_string(),
                "not-an-ip, 198.51.100.7".to_string(),
            ),
        ];
        let resolved = resolve_client_ip(&headers, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(resolved, Some("198.51.100.7".parse().unwrap()));
    }

    #[test]
    fn test_resolve_client_ip_falls_back_to_peer() {
        let resolved = resolve_client_ip(&[], Some("10.0.0.1".parse().unwrap()));
        assert_eq!(resolved, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_non_web_record_is_skipped() {
        let config = crate::config::AppSecConfig::default();
        let processor = AppSecProcessor::new(&config.waf).unwrap();
        let mut record = RequestRecord::non_web();
        let mut ctx = processor.new_context();
        processor.on_request_finish(&mut record, &mut ctx);
        assert!(record.get_metric(tags::APPSEC_ENABLED).is_none());
    }
}
