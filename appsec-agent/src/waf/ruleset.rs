use crate::error::{AppSecError, Result};
use ipnet::IpNet;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Load/failure accounting for a compiled ruleset
#[derive(Debug, Clone, Default)]
pub struct RulesetInfo {
    /// Number of rules that compiled successfully
    pub loaded: u32,
    /// Number of rules rejected during compilation
    pub failed: u32,
    /// Per-rule failure detail: error message -> offending rule ids
    pub errors: BTreeMap<String, Vec<String>>,
    /// Ruleset version string from the document metadata
    pub version: String,
}

/// One named input an operator reads: an address plus an optional key path
/// into the submitted value.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub address: String,
    pub key_path: Vec<String>,
}

/// Compiled matcher for one condition
#[derive(Debug)]
pub enum ConditionCheck {
    Regex(Regex),
    PhraseMatch(Vec<String>),
    ExactMatch(Vec<String>),
    IpMatch(Vec<IpNet>),
}

#[derive(Debug)]
pub struct CompiledCondition {
    pub operator: String,
    pub inputs: Vec<InputSpec>,
    pub check: ConditionCheck,
}

#[derive(Debug)]
pub struct CompiledRule {
    pub id: String,
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub conditions: Vec<CompiledCondition>,
    pub actions: Vec<String>,
}

/// Reporting-time redaction of sensitive parameters
#[derive(Debug)]
pub struct Obfuscator {
    key_regex: Option<Regex>,
    value_regex: Option<Regex>,
}

/// Replacement emitted for redacted values in trigger reports.
pub const REDACTED: &str = "<Redacted>";

impl Obfuscator {
    pub fn new(key_regexp: &str, value_regexp: &str) -> Result<Self> {
        let key_regex = compile_obfuscation_regex(key_regexp, "key")?;
        let value_regex = compile_obfuscation_regex(value_regexp, "value")?;
        Ok(Self {
            key_regex,
            value_regex,
        })
    }

    /// True when a matched parameter must be redacted before reporting.
    pub fn is_sensitive(&self, key_path: &[String], value: &str) -> bool {
        if let Some(re) = &self.key_regex {
            if key_path.iter().any(|k| re.is_match(k)) {
                return true;
            }
        }
        if let Some(re) = &self.value_regex {
            if re.is_match(value) {
                return true;
            }
        }
        false
    }
}

fn compile_obfuscation_regex(pattern: &str, which: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    match Regex::new(pattern) {
        Ok(re) => Ok(Some(re)),
        Err(e) => Err(AppSecError::InvalidArgument(format!(
            "invalid obfuscation {which} regex: {e}"
        ))),
    }
}

/// A compiled, immutable ruleset handle.
///
/// Created whole at init or update time and shared read-only between
/// concurrent evaluation contexts; never mutated in place.
#[derive(Debug)]
pub struct Ruleset {
    pub rules: Vec<CompiledRule>,
    pub required_addresses: HashSet<String>,
    pub info: RulesetInfo,
    pub obfuscator: Obfuscator,
    /// Raw ruleset document retained so rule-data updates can recompile
    source: Value,
}

impl Ruleset {
    /// Compile a ruleset document. Individual rule failures are counted and
    /// retained; the ruleset is invalid only when nothing loads.
    pub fn compile(rules_json: &Value, obfuscator: Obfuscator) -> Result<Self> {
        Self::compile_with_data(rules_json, obfuscator, None)
    }

    /// Recompile this ruleset's source with replacement rule data.
    pub fn with_rule_data(&self, rule_data: &Value, obfuscator: Obfuscator) -> Result<Self> {
        Self::compile_with_data(&self.source, obfuscator, Some(rule_data))
    }

    /// Raw document this handle was compiled from.
    pub fn source(&self) -> &Value {
        &self.source
    }

    fn compile_with_data(
        rules_json: &Value,
        obfuscator: Obfuscator,
        rule_data_override: Option<&Value>,
    ) -> Result<Self> {
        let doc = rules_json
            .as_object()
            .ok_or_else(|| AppSecError::InvalidRuleset("ruleset is not a JSON object".into()))?;

        let version = doc
            .get("metadata")
            .and_then(|m| m.get("rules_version"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let rule_data = rule_data_override
            .or_else(|| doc.get("rules_data"))
            .map(parse_rule_data)
            .unwrap_or_default();

        let raw_rules = doc
            .get("rules")
            .and_then(Value::as_array)
            .ok_or_else(|| AppSecError::InvalidRuleset("ruleset has no rules array".into()))?;

        let mut info = RulesetInfo {
            version,
            ..Default::default()
        };
        let mut rules = Vec::with_capacity(raw_rules.len());
        let mut required_addresses = HashSet::new();

        for raw in raw_rules {
            let id = raw
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("<missing id>")
                .to_string();
            match compile_rule(raw, &rule_data) {
                Ok(rule) => {
                    for condition in &rule.conditions {
                        for input in &condition.inputs {
                            required_addresses.insert(input.address.clone());
                        }
                    }
                    rules.push(rule);
                    info.loaded += 1;
                }
                Err(e) => {
                    warn!(rule_id = %id, error = %e, "Failed to compile rule");
                    info.failed += 1;
                    info.errors.entry(e.to_string()).or_default().push(id);
                }
            }
        }

        if rules.is_empty() {
            return Err(AppSecError::InvalidRuleset(format!(
                "no usable rules ({} failed)",
                info.failed
            )));
        }

        debug!(
            loaded = info.loaded,
            failed = info.failed,
            version = %info.version,
            "Compiled ruleset"
        );

        let mut source = rules_json.clone();
        if let (Some(obj), Some(data)) = (source.as_object_mut(), rule_data_override) {
            obj.insert("rules_data".to_string(), data.clone());
        }

        Ok(Self {
            rules,
            required_addresses,
            info,
            obfuscator,
            source,
        })
    }
}

/// Parsed `rules_data` section: data id -> CIDR set. Expired entries are
/// dropped at compile time; data refreshes arrive through rule updates.
fn parse_rule_data(raw: &Value) -> HashMap<String, Vec<IpNet>> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut out: HashMap<String, Vec<IpNet>> = HashMap::new();
    let Some(entries) = raw.as_array() else {
        return out;
    };
    for entry in entries {
        let Some(id) = entry.get("id").and_then(Value::as_str) else {
            continue;
        };
        let nets = out.entry(id.to_string()).or_default();
        for item in entry
            .get("data")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let expiration = item.get("expiration").and_then(Value::as_u64).unwrap_or(0);
            if expiration != 0 && expiration < now {
                continue;
            }
            let Some(value) = item.get("value").and_then(Value::as_str) else {
                continue;
            };
            match parse_net(value) {
                Some(net) => nets.push(net),
                None => warn!(data_id = %id, value = %value, "Failed to parse rule data entry"),
            }
        }
    }
    out
}

fn parse_net(value: &str) -> Option<IpNet> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Some(net);
    }
    value.parse::<IpAddr>().ok().map(IpNet::from)
}

fn compile_rule(raw: &Value, rule_data: &HashMap<String, Vec<IpNet>>) -> Result<CompiledRule> {
    let id = str_field(raw, "id")?;
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&id)
        .to_string();

    let tags = raw
        .get("tags")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let raw_conditions = raw
        .get("conditions")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppSecError::InvalidRuleset("missing key 'conditions'".into()))?;

    let mut conditions = Vec::with_capacity(raw_conditions.len());
    for raw_condition in raw_conditions {
        conditions.push(compile_condition(raw_condition, rule_data)?);
    }

    let actions = raw
        .get("on_match")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(CompiledRule {
        id,
        name,
        tags,
        conditions,
        actions,
    })
}

fn compile_condition(
    raw: &Value,
    rule_data: &HashMap<String, Vec<IpNet>>,
) -> Result<CompiledCondition> {
    let operator = str_field(raw, "operator")?;
    let parameters = raw
        .get("parameters")
        .and_then(Value::as_object)
        .ok_or_else(|| AppSecError::InvalidRuleset("missing key 'parameters'".into()))?;

    let inputs = parameters
        .get("inputs")
        .and_then(Value::as_array)
        .filter(|i| !i.is_empty())
        .ok_or_else(|| AppSecError::InvalidRuleset("missing key 'inputs'".into()))?
        .iter()
        .map(|input| {
            let address = input
                .get("address")
                .and_then(Value::as_str)
                .ok_or_else(|| AppSecError::InvalidRuleset("missing key 'address'".into()))?;
            let key_path = input
                .get("key_path")
                .and_then(Value::as_array)
                .map(|p| {
                    p.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(InputSpec {
                address: address.to_string(),
                key_path,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let check = match operator.as_str() {
        "match_regex" => {
            let pattern = parameters
                .get("regex")
                .and_then(Value::as_str)
                .ok_or_else(|| AppSecError::InvalidRuleset("missing key 'regex'".into()))?;
            let case_sensitive = parameters
                .get("options")
                .and_then(|o| o.get("case_sensitive"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()
                .map_err(|e| AppSecError::InvalidRuleset(format!("invalid regex: {e}")))?;
            ConditionCheck::Regex(regex)
        }
        "phrase_match" => ConditionCheck::PhraseMatch(string_list(parameters, "list")?),
        "exact_match" => ConditionCheck::ExactMatch(string_list(parameters, "list")?),
        "ip_match" => {
            if let Some(data_id) = parameters.get("data").and_then(Value::as_str) {
                // Data-driven sets resolve to empty until rule data arrives.
                ConditionCheck::IpMatch(rule_data.get(data_id).cloned().unwrap_or_default())
            } else {
                let nets = string_list(parameters, "list")?
                    .iter()
                    .filter_map(|s| parse_net(s))
                    .collect();
                ConditionCheck::IpMatch(nets)
            }
        }
        other => {
            return Err(AppSecError::InvalidRuleset(format!(
                "unknown operator '{other}'"
            )))
        }
    };

    Ok(CompiledCondition {
        operator,
        inputs,
        check,
    })
}

fn str_field(raw: &Value, key: &str) -> Result<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AppSecError::InvalidRuleset(format!("missing key '{key}'")))
}

fn string_list(parameters: &serde_json::Map<String, Value>, key: &str) -> Result<Vec<String>> {
    parameters
        .get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| AppSecError::InvalidRuleset(format!("missing key '{key}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obfuscator() -> Obfuscator {
        Obfuscator::new("", "").unwrap()
    }

    #[test]
    fn test_compile_counts_partial_failures() {
        let doc = json!({
            "version": "2.2",
            "metadata": {"rules_version": "1.0.0"},
            "rules": [
                {"id": "ok-1", "name": "good", "tags": {"type": "t"},
                 "conditions": [{"operator": "match_regex",
                                 "parameters": {"inputs": [{"address": "server.request.uri.raw"}],
                                                 "regex": "attack"}}]},
                {"id": "bad-regex", "name": "bad",
                 "conditions": [{"operator": "match_regex",
                                 "parameters": {"inputs": [{"address": "server.request.uri.raw"}],
                                                 "regex": "("}}]},
                {"id": "bad-op", "name": "bad",
                 "conditions": [{"operator": "does_not_exist",
                                 "parameters": {"inputs": [{"address": "server.request.uri.raw"}]}}]}
            ]
        });
        let ruleset = Ruleset::compile(&doc, obfuscator()).unwrap();
        assert_eq!(ruleset.info.loaded, 1);
        assert_eq!(ruleset.info.failed, 2);
        assert_eq!(ruleset.info.version, "1.0.0");
        let flagged: Vec<_> = ruleset.info.errors.values().flatten().collect();
        assert!(flagged.contains(&&"bad-regex".to_string()));
        assert!(flagged.contains(&&"bad-op".to_string()));
    }

    #[test]
    fn test_all_rules_failing_is_invalid() {
        let doc = json!({"rules": [{"id": "r", "conditions": []}]});
        assert!(matches!(
            Ruleset::compile(&doc, obfuscator()),
            Err(AppSecError::InvalidRuleset(_))
        ));
    }

    #[test]
    fn test_required_addresses_union() {
        let doc = json!({
            "rules": [
                {"id": "a", "conditions": [{"operator": "ip_match",
                    "parameters": {"inputs": [{"address": "http.client_ip"}], "data": "blocked_ips"}}]},
                {"id": "b", "conditions": [{"operator": "match_regex",
                    "parameters": {"inputs": [{"address": "server.request.query"}], "regex": "x"}}]}
            ]
        });
        let ruleset = Ruleset::compile(&doc, obfuscator()).unwrap();
        assert!(ruleset.required_addresses.contains("http.client_ip"));
        assert!(ruleset.required_addresses.contains("server.request.query"));
        assert_eq!(ruleset.required_addresses.len(), 2);
    }

    #[test]
    fn test_rule_data_parsing_handles_plain_ips_and_cidrs() {
        let data = json!([
            {"id": "blocked_ips", "type": "ip_with_expiration",
             "data": [{"value": "10.1.2.3", "expiration": 0},
                       {"value": "192.168.0.0/16", "expiration": 0},
                       {"value": "not-an-ip", "expiration": 0}]}
        ]);
        let parsed = parse_rule_data(&data);
        assert_eq!(parsed["blocked_ips"].len(), 2);
    }

    #[test]
    fn test_expired_rule_data_is_dropped() {
        let data = json!([
            {"id": "blocked_ips", "type": "ip_with_expiration",
             "data": [{"value": "10.1.2.3", "expiration": 1}]}
        ]);
        let parsed = parse_rule_data(&data);
        assert!(parsed["blocked_ips"].is_empty());
    }

    #[test]
    fn test_obfuscator_flags_sensitive_keys_and_values() {
        let obf = Obfuscator::new(
            crate::config::DEFAULT_OBFUSCATION_KEY_REGEXP,
            crate::config::DEFAULT_OBFUSCATION_VALUE_REGEXP,
        )
        .unwrap();
        assert!(obf.is_sensitive(&["password".to_string()], "hunter2"));
        assert!(obf.is_sensitive(&["q".to_string()], "bearer deadbeefcafe"));
        assert!(!obf.is_sensitive(&["q".to_string()], "plain text"));
    }
}
