//! Integration tests for the WAF execution path:
//! - value bridge round-trip and clipping laws
//! - rules file loading
//! - request lifecycle decision logic (early IP check, final check)
//! - event rate limiting

use appsec_agent::config::AppSecConfig;
use appsec_agent::waf::object::{
    WafObject, MAX_CONTAINER_DEPTH, MAX_CONTAINER_SIZE, MAX_STRING_LENGTH,
};
use appsec_agent::waf::processor::{items, tags};
use appsec_agent::waf::{AppSecProcessor, RequestRecord};
use appsec_agent::AppSecError;
use proptest::prelude::*;
use serde_json::{json, Value};
use std::io::Write;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config_with_rules(rules: &Value) -> (AppSecConfig, tempfile::NamedTempFile) {
    let mut file = tempfile::NamedTempFile::new().expect("temp rules file");
    file.write_all(rules.to_string().as_bytes())
        .expect("write rules");
    let mut config = AppSecConfig::default();
    config.waf.rules_path = Some(file.path().to_string_lossy().into_owned());
    (config, file)
}

fn blocked_ip_rules() -> Value {
    json!({
        "version": "2.2",
        "metadata": {"rules_version": "1.2.3"},
        "rules": [
            {"id": "blk-001", "name": "block listed ips", "tags": {"type": "block_ip"},
             "conditions": [{"operator": "ip_match",
                             "parameters": {"inputs": [{"address": "http.client_ip"}],
                                             "data": "blocked_ips"}}],
             "on_match": ["block"]},
            {"id": "sqli-1", "name": "sql injection", "tags": {"type": "sql_injection"},
             "conditions": [{"operator": "match_regex",
                             "parameters": {"inputs": [{"address": "server.request.query"}],
                                             "regex": "union\\s+select"}}]}
        ],
        "rules_data": [
            {"id": "blocked_ips", "type": "ip_with_expiration",
             "data": [{"value": "203.0.113.9", "expiration": 0}]}
        ]
    })
}

mod bridge_laws {
    use super::*;

    /// Bounded JSON values: no floats, strings and containers inside the
    /// clipping limits.
    fn bounded_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            "[a-zA-Z0-9 _.-]{0,64}".prop_map(Value::from),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                prop::collection::vec(("[a-z]{1,12}", inner), 0..8).prop_map(|entries| {
                    let mut map = serde_json::Map::new();
                    for (k, v) in entries {
                        map.insert(k, v);
                    }
                    Value::Object(map)
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_encode_round_trips_bounded_values(value in bounded_json()) {
            let encoded = WafObject::encode(&value).unwrap();
            // Duplicate generated keys collapse at map construction, so the
            // input value is already normalized.
            prop_assert_eq!(encoded.decode(), value);
        }
    }

    #[test]
    fn oversized_inputs_clip_instead_of_failing() {
        let long_string = Value::from("a".repeat(MAX_STRING_LENGTH * 2));
        let wide_array = Value::Array((0..MAX_CONTAINER_SIZE * 2).map(Value::from).collect());
        let mut deep = json!(1);
        for _ in 0..MAX_CONTAINER_DEPTH * 2 {
            deep = json!([deep]);
        }

        for value in [long_string, wide_array, deep] {
            assert!(WafObject::encode(&value).is_ok());
        }
    }
}

mod rules_loading {
    use super::*;

    #[test]
    fn embedded_default_ruleset_loads() {
        let config = AppSecConfig::default();
        let processor = AppSecProcessor::new(&config.waf).expect("default rules");
        let engine = processor.engine();
        assert!(engine.ruleset_info().loaded > 0);
        assert_eq!(engine.ruleset_info().failed, 0);
    }

    #[test]
    fn missing_rule_file_is_config_load_error() {
        let mut config = AppSecConfig::default();
        config.waf.rules_path = Some("/definitely/not/here/rules.json".to_string());
        match AppSecProcessor::new(&config.waf) {
            Err(AppSecError::ConfigLoad(_)) => {}
            other => panic!("expected ConfigLoad, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_rule_file_is_config_load_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        let mut config = AppSecConfig::default();
        config.waf.rules_path = Some(file.path().to_string_lossy().into_owned());
        match AppSecProcessor::new(&config.waf) {
            Err(AppSecError::ConfigLoad(_)) => {}
            other => panic!("expected ConfigLoad, got {other:?}"),
        }
    }
}

mod request_lifecycle {
    use super::*;

    #[test]
    fn blocked_ip_is_pre_decided_at_request_start() {
        super::init_tracing();
        let (config, _file) = config_with_rules(&blocked_ip_rules());
        let processor = AppSecProcessor::new(&config.waf).unwrap();

        let mut record = RequestRecord::new();
        let mut ctx = processor.new_context();
        let headers = vec![("X-Forwarded-For".to_string(), "203.0.113.9".to_string())];
        let blocked = processor.on_request_start(&mut record, &mut ctx, None, &headers, false);
        assert!(blocked);
        assert_eq!(
            record.get_item(items::REQUEST_BLOCKED),
            Some(&Value::Bool(true))
        );

        // The final check reuses the stored decision instead of re-running.
        processor.on_request_finish(&mut record, &mut ctx);
        assert_eq!(record.get_tag(tags::APPSEC_EVENT), Some("true"));
        assert_eq!(record.get_tag(tags::APPSEC_BLOCKED), Some("true"));
        assert!(record.get_tag(tags::APPSEC_JSON).is_some());
        assert!(record.is_kept());
        assert_eq!(record.get_tag(tags::ORIGIN), Some("appsec"));
        assert_eq!(record.get_tag(tags::ACTOR_IP), Some("203.0.113.9"));
    }

    #[test]
    fn clean_ip_is_not_blocked() {
        let (config, _file) = config_with_rules(&blocked_ip_rules());
        let processor = AppSecProcessor::new(&config.waf).unwrap();

        let mut record = RequestRecord::new();
        let mut ctx = processor.new_context();
        let headers = vec![("X-Forwarded-For".to_string(), "198.51.100.1".to_string())];
        assert!(!processor.on_request_start(&mut record, &mut ctx, None, &headers, false));

        processor.on_request_finish(&mut record, &mut ctx);
        assert!(record.get_tag(tags::APPSEC_EVENT).is_none());
        assert!(!record.is_kept());
    }

    #[test]
    fn matching_query_records_event_on_finish() {
        let (config, _file) = config_with_rules(&blocked_ip_rules());
        let processor = AppSecProcessor::new(&config.waf).unwrap();

        let mut record = RequestRecord::new();
        let mut ctx = processor.new_context();
        let headers = vec![("User-Agent".to_string(), "test".to_string())];
        processor.on_request_start(
            &mut record,
            &mut ctx,
            Some("198.51.100.1".parse().unwrap()),
            &headers,
            false,
        );
        record.set_item(items::REQUEST_QUERY, json!({"q": "1 UNION SELECT * FROM x"}));
        processor.on_request_finish(&mut record, &mut ctx);

        assert_eq!(record.get_tag(tags::APPSEC_EVENT), Some("true"));
        assert!(record.is_kept());
        let triggers: Value =
            serde_json::from_str(record.get_tag(tags::APPSEC_JSON).unwrap()).unwrap();
        assert_eq!(triggers["triggers"][0]["rule"]["id"], "sqli-1");
        // Ruleset accounting is reported alongside the event.
        assert_eq!(record.get_metric(tags::EVENT_RULES_LOADED), Some(2.0));
        assert_eq!(record.get_tag(tags::EVENT_RULES_VERSION), Some("1.2.3"));
        assert!(record.get_metric(tags::WAF_DURATION).is_some());
    }

    #[test]
    fn rate_limiter_caps_recorded_events() {
        let (mut config, _file) = config_with_rules(&blocked_ip_rules());
        let allowed = 3u32;
        config.waf.trace_rate_limit = allowed;
        let processor = AppSecProcessor::new(&config.waf).unwrap();

        let total = 10;
        let mut recorded = 0;
        for _ in 0..total {
            let mut record = RequestRecord::new();
            let mut ctx = processor.new_context();
            record.set_item(items::REQUEST_QUERY, json!({"q": "union select 1"}));
            processor.on_request_finish(&mut record, &mut ctx);
            if record.get_tag(tags::APPSEC_EVENT).is_some() {
                recorded += 1;
            }
        }
        assert_eq!(recorded, allowed);
    }
}
