use crate::error::{AppSecError, Result};
use crate::waf::object::WafObject;
use crate::waf::ruleset::{
    CompiledCondition, CompiledRule, ConditionCheck, Obfuscator, Ruleset, RulesetInfo, REDACTED,
};
use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of one bounded evaluation call.
///
/// A timeout is a result flag, not an error: the engine aborted
/// mid-evaluation and reports whatever matched before the deadline.
#[derive(Debug, Clone)]
pub struct WafResult {
    pub matched: bool,
    pub timeout: bool,
    /// ddwaf-shaped event array describing the matched rules
    pub triggers: Value,
    /// Ordered, deduplicated union of matched rules' on_match actions
    pub actions: Vec<String>,
    /// Time spent inside rule evaluation
    pub duration: Duration,
    /// Wall-clock time of the whole call
    pub total_duration: Duration,
}

impl WafResult {
    pub fn is_block(&self) -> bool {
        self.actions.iter().any(|a| a == "block")
    }
}

/// Owns the compiled ruleset handle and hands out per-request evaluation
/// contexts.
///
/// Handle replacement is an atomic swap: contexts created before an update
/// keep their pinned `Arc` and finish against the old ruleset, which is
/// released when the last such context drops.
#[derive(Debug)]
pub struct WafEngine {
    handle: ArcSwap<Ruleset>,
    key_regexp: String,
    value_regexp: String,
}

impl WafEngine {
    /// Compile the ruleset and initialize the engine.
    ///
    /// Partial rule failures keep the handle valid with `failed > 0`;
    /// `InvalidRuleset` is returned only when nothing loads.
    pub fn new(rules_json: &Value, key_regexp: &str, value_regexp: &str) -> Result<Self> {
        let obfuscator = Obfuscator::new(key_regexp, value_regexp)?;
        let ruleset = Ruleset::compile(rules_json, obfuscator)?;

        info!(
            loaded = ruleset.info.loaded,
            failed = ruleset.info.failed,
            version = %ruleset.info.version,
            "WAF engine initialized"
        );

        Ok(Self {
            handle: ArcSwap::from_pointee(ruleset),
            key_regexp: key_regexp.to_string(),
            value_regexp: value_regexp.to_string(),
        })
    }

    /// Engine implementation version, reported alongside events.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Load/failure accounting of the current handle.
    pub fn ruleset_info(&self) -> RulesetInfo {
        self.handle.load().info.clone()
    }

    /// Addresses the compiled ruleset reads. Collecting anything else is
    /// wasted work.
    pub fn required_addresses(&self) -> HashSet<String> {
        self.handle.load().required_addresses.clone()
    }

    /// Swap in new rule data (e.g. blocked IP sets) without invalidating
    /// in-flight evaluation contexts.
    pub fn update_rule_data(&self, rule_data: &Value) -> Result<()> {
        let obfuscator = Obfuscator::new(&self.key_regexp, &self.value_regexp)?;
        let current = self.handle.load_full();
        let updated = current.with_rule_data(rule_data, obfuscator)?;
        self.handle.store(Arc::new(updated));
        counter!("waf_rule_data_updates", 1);
        debug!("WAF rule data updated");
        Ok(())
    }

    /// Replace the whole ruleset with the same swap discipline.
    pub fn update_ruleset(&self, rules_json: &Value) -> Result<()> {
        let obfuscator = Obfuscator::new(&self.key_regexp, &self.value_regexp)?;
        let ruleset = Ruleset::compile(rules_json, obfuscator)?;
        info!(
            loaded = ruleset.info.loaded,
            failed = ruleset.info.failed,
            version = %ruleset.info.version,
            "WAF ruleset replaced"
        );
        self.handle.store(Arc::new(ruleset));
        counter!("waf_ruleset_updates", 1);
        Ok(())
    }

    /// Create a per-request evaluation context pinned to the current handle.
    pub fn new_context(&self) -> EvaluationContext {
        EvaluationContext {
            ruleset: self.handle.load_full(),
            known: HashMap::new(),
            matched_rules: HashSet::new(),
        }
    }
}

/// Per-request evaluation state.
///
/// Accumulates submitted addresses across `run` calls within one logical
/// request; each call only (re)evaluates rules touched by newly-submitted
/// data. One context per request, never shared.
#[derive(Debug)]
pub struct EvaluationContext {
    ruleset: Arc<Ruleset>,
    known: HashMap<String, WafObject>,
    matched_rules: HashSet<String>,
}

struct EvalBudget {
    deadline: Instant,
    exceeded: bool,
    probe: u32,
}

impl EvalBudget {
    fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            exceeded: false,
            probe: 0,
        }
    }

    /// Deadline probe, amortized to one clock read per 32 calls.
    fn check(&mut self) -> bool {
        if self.exceeded {
            return true;
        }
        self.probe += 1;
        if self.probe & 31 == 0 && Instant::now() >= self.deadline {
            self.exceeded = true;
        }
        self.exceeded
    }

    fn check_now(&mut self) -> bool {
        if !self.exceeded && Instant::now() >= self.deadline {
            self.exceeded = true;
        }
        self.exceeded
    }
}

struct MatchEvidence {
    key_path: Vec<String>,
    value: String,
    highlight: Vec<String>,
}

impl EvaluationContext {
    /// Run one bounded evaluation over newly-submitted data.
    ///
    /// The top-level object must be a map keyed by input addresses; the
    /// call takes ownership of it and absorbs the entries into the
    /// context.
    pub fn run(&mut self, data: WafObject, timeout: Duration) -> Result<WafResult> {
        if timeout.is_zero() {
            return Err(AppSecError::InvalidArgument(
                "evaluation timeout must be non-zero".into(),
            ));
        }

        let call_start = Instant::now();
        let entries = match data {
            WafObject::Map(entries) => entries,
            other => {
                return Err(AppSecError::InvalidObject(format!(
                    "top-level evaluation input must be a map, got {other:?}"
                )))
            }
        };

        let mut new_addresses: HashSet<String> = HashSet::with_capacity(entries.len());
        for (address, value) in entries {
            new_addresses.insert(address.clone());
            self.known.insert(address, value);
        }

        let ruleset = Arc::clone(&self.ruleset);
        let eval_start = Instant::now();
        let mut budget = EvalBudget::new(eval_start + timeout);
        let mut events = Vec::new();
        let mut actions: Vec<String> = Vec::new();

        for rule in &ruleset.rules {
            if self.matched_rules.contains(&rule.id) {
                continue;
            }
            if !rule_touches(rule, &new_addresses) {
                continue;
            }
            if budget.check_now() {
                break;
            }

            if let Some(event) = self.evaluate_rule(rule, &ruleset.obfuscator, &mut budget) {
                self.matched_rules.insert(rule.id.clone());
                events.push(event);
                for action in &rule.actions {
                    if !actions.contains(action) {
                        actions.push(action.clone());
                    }
                }
            }

            if budget.exceeded {
                break;
            }
        }

        let duration = eval_start.elapsed();
        let total_duration = call_start.elapsed();
        let matched = !events.is_empty();

        counter!("waf_runs_total", 1);
        if matched {
            counter!("waf_matches_total", 1);
        }
        if budget.exceeded {
            counter!("waf_timeouts_total", 1);
        }
        histogram!("waf_run_duration_seconds", duration.as_secs_f64());

        Ok(WafResult {
            matched,
            timeout: budget.exceeded,
            triggers: Value::Array(events),
            actions,
            duration,
            total_duration,
        })
    }

    /// Addresses submitted so far within this logical request.
    pub fn known_addresses(&self) -> HashSet<String> {
        self.known.keys().cloned().collect()
    }

    fn evaluate_rule(
        &self,
        rule: &CompiledRule,
        obfuscator: &Obfuscator,
        budget: &mut EvalBudget,
    ) -> Option<Value> {
        let mut matches = Vec::with_capacity(rule.conditions.len());
        for condition in &rule.conditions {
            let evidence = self.evaluate_condition(condition, budget)?;
            matches.push(render_match(condition, evidence, obfuscator));
        }

        Some(json!({
            "rule": {
                "id": rule.id,
                "name": rule.name,
                "tags": rule.tags,
            },
            "rule_matches": matches,
        }))
    }

    fn evaluate_condition(
        &self,
        condition: &CompiledCondition,
        budget: &mut EvalBudget,
    ) -> Option<MatchEvidence> {
        for input in &condition.inputs {
            if budget.exceeded {
                return None;
            }
            let Some(root) = self.known.get(&input.address) else {
                continue;
            };
            let Some(target) = walk_key_path(root, &input.key_path) else {
                continue;
            };
            let mut key_path = vec![input.address.clone()];
            key_path.extend(input.key_path.iter().cloned());
            if let Some(evidence) = scan_value(target, key_path, &condition.check, budget) {
                return Some(evidence);
            }
        }
        None
    }
}

fn rule_touches(rule: &CompiledRule, new_addresses: &HashSet<String>) -> bool {
    rule.conditions
        .iter()
        .flat_map(|c| c.inputs.iter())
        .any(|input| new_addresses.contains(&input.address))
}

fn walk_key_path<'a>(mut value: &'a WafObject, key_path: &[String]) -> Option<&'a WafObject> {
    for key in key_path {
        value = match value {
            WafObject::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)?,
            WafObject::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// Depth-first scan of string/number leaves for a condition match.
fn scan_value(
    value: &WafObject,
    key_path: Vec<String>,
    check: &ConditionCheck,
    budget: &mut EvalBudget,
) -> Option<MatchEvidence> {
    if budget.check() {
        return None;
    }
    match value {
        WafObject::String(s) => check_leaf(s, key_path, check),
        WafObject::Signed(n) => check_leaf(&n.to_string(), key_path, check),
        WafObject::Unsigned(n) => check_leaf(&n.to_string(), key_path, check),
        WafObject::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let mut child_path = key_path.clone();
                child_path.push(i.to_string());
                if let Some(evidence) = scan_value(item, child_path, check, budget) {
                    return Some(evidence);
                }
                if budget.exceeded {
                    return None;
                }
            }
            None
        }
        WafObject::Map(entries) => {
            for (key, item) in entries {
                let mut child_path = key_path.clone();
                child_path.push(key.clone());
                if let Some(evidence) = scan_value(item, child_path, check, budget) {
                    return Some(evidence);
                }
                if budget.exceeded {
                    return None;
                }
            }
            None
        }
        WafObject::Bool(_) | WafObject::Invalid => None,
    }
}

fn check_leaf(value: &str, key_path: Vec<String>, check: &ConditionCheck) -> Option<MatchEvidence> {
    match check {
        ConditionCheck::Regex(re) => re.find(value).map(|m| MatchEvidence {
            key_path,
            value: value.to_string(),
            highlight: vec![m.as_str().to_string()],
        }),
        ConditionCheck::PhraseMatch(phrases) => phrases
            .iter()
            .find(|phrase| value.contains(phrase.as_str()))
            .map(|phrase| MatchEvidence {
                key_path,
                value: value.to_string(),
                highlight: vec![phrase.clone()],
            }),
        ConditionCheck::ExactMatch(candidates) => {
            candidates.iter().any(|c| c == value).then(|| MatchEvidence {
                key_path,
                value: value.to_string(),
                highlight: vec![value.to_string()],
            })
        }
        ConditionCheck::IpMatch(nets) => {
            let ip: IpAddr = value.parse().ok()?;
            nets.iter().any(|net| net.contains(&ip)).then(|| MatchEvidence {
                key_path,
                value: value.to_string(),
                highlight: vec![value.to_string()],
            })
        }
    }
}

fn render_match(
    condition: &CompiledCondition,
    evidence: MatchEvidence,
    obfuscator: &Obfuscator,
) -> Value {
    let sensitive = obfuscator.is_sensitive(&evidence.key_path, &evidence.value);
    let (value, highlight) = if sensitive {
        (REDACTED.to_string(), vec![REDACTED.to_string()])
    } else {
        (evidence.value, evidence.highlight)
    };

    let address = evidence.key_path.first().cloned().unwrap_or_default();
    let key_path: Vec<&String> = evidence.key_path.iter().skip(1).collect();
    json!({
        "operator": condition.operator,
        "parameters": [{
            "address": address,
            "key_path": key_path,
            "value": value,
            "highlight": highlight,
        }],
    })
}
