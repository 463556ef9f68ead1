use crate::remoteconfig::protocol::ConfigMetadata;
use anyhow::bail;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// A registered product callback.
///
/// `content` is `Some(config)` for an applied configuration and `None` when
/// the control service stopped referencing it (removal sentinel). Errors
/// mark the config's apply state without affecting other configs.
pub type ProductCallback =
    dyn Fn(Option<&ConfigMetadata>, Option<Value>) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchMode {
    /// Callback runs once per config as it is applied.
    Immediate,
    /// Contributions accumulate per target path and a single merged
    /// callback invocation happens at dispatch time.
    MergeFirst,
}

/// A product listener: the dispatch strategy plus the callback it feeds.
///
/// One listener may be registered under several products; merge-first
/// listeners coalesce all their pending contributions into one dispatch.
pub struct ProductListener {
    mode: DispatchMode,
    callback: Arc<ProductCallback>,
    /// Merge accumulator, keyed by target path. One lock covers both
    /// append and drain so concurrent contributions cannot be lost.
    configs: Mutex<HashMap<String, serde_json::Map<String, Value>>>,
}

impl std::fmt::Debug for ProductListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductListener")
            .field("mode", &self.mode)
            .finish()
    }
}

impl ProductListener {
    /// Listener invoking the callback once per applied config.
    pub fn immediate<F>(callback: F) -> Arc<Self>
    where
        F: Fn(Option<&ConfigMetadata>, Option<Value>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            mode: DispatchMode::Immediate,
            callback: Arc::new(callback),
            configs: Mutex::new(HashMap::new()),
        })
    }

    /// Listener accumulating contributions until `dispatch`.
    pub fn merge_first<F>(callback: F) -> Arc<Self>
    where
        F: Fn(Option<&ConfigMetadata>, Option<Value>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            mode: DispatchMode::MergeFirst,
            callback: Arc::new(callback),
            configs: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.mode == DispatchMode::MergeFirst
    }

    /// Immediate-mode invocation.
    pub fn publish(
        &self,
        metadata: Option<&ConfigMetadata>,
        content: Option<Value>,
    ) -> anyhow::Result<()> {
        (self.callback)(metadata, content)
    }

    /// Merge-mode contribution for one target path. `None` removes the
    /// target's accumulated entry.
    pub fn append(&self, target: &str, content: Option<&Value>) -> anyhow::Result<()> {
        let mut configs = self.lock_configs();
        match content {
            None => {
                configs.remove(target);
                Ok(())
            }
            Some(Value::Object(map)) => {
                let entry = configs.entry(target.to_string()).or_default();
                for (key, value) in map {
                    entry.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            Some(other) => {
                bail!("target {target} config has unsupported type {other}")
            }
        }
    }

    /// Merge all accumulated targets and invoke the callback exactly once.
    ///
    /// List values concatenate across targets, object values last-write-win
    /// per key, anything else is logged and dropped.
    pub fn dispatch(&self) -> anyhow::Result<()> {
        let merged = {
            let configs = self.lock_configs();
            let mut result = serde_json::Map::new();
            for (target, config) in configs.iter() {
                for (key, value) in config {
                    match value {
                        Value::Array(items) => {
                            let slot = result
                                .entry(key.clone())
                                .or_insert_with(|| Value::Array(Vec::new()));
                            if let Value::Array(existing) = slot {
                                existing.extend(items.iter().cloned());
                            } else {
                                *slot = Value::Array(items.clone());
                            }
                        }
                        Value::Object(_) => {
                            result.insert(key.clone(), value.clone());
                        }
                        other => {
                            debug!(target = %target, key = %key, value = %other, "Dropping invalid merge value");
                        }
                    }
                }
            }
            result
        };

        (self.callback)(None, Some(Value::Object(merged)))
    }

    fn lock_configs(&self) -> MutexGuard<'_, HashMap<String, serde_json::Map<String, Value>>> {
        match self.configs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn collecting_listener(
        mode: fn(
            Box<dyn Fn(Option<&ConfigMetadata>, Option<Value>) -> anyhow::Result<()> + Send + Sync>,
        ) -> Arc<ProductListener>,
    ) -> (Arc<ProductListener>, Arc<StdMutex<Vec<Option<Value>>>>) {
        let seen: Arc<StdMutex<Vec<Option<Value>>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = mode(Box::new(move |_meta, content| {
            sink.lock().unwrap().push(content);
            Ok(())
        }));
        (listener, seen)
    }

    fn merge_listener() -> (Arc<ProductListener>, Arc<StdMutex<Vec<Option<Value>>>>) {
        collecting_listener(|cb| ProductListener::merge_first(cb))
    }

    #[test]
    fn test_merge_concatenates_lists_across_targets() {
        let (listener, seen) = merge_listener();
        listener
            .append("1/ASM_DATA/2", Some(&json!({"a": [1]})))
            .unwrap();
        listener
            .append("1/ASM_FEATURES/2", Some(&json!({"b": [2]})))
            .unwrap();
        listener.dispatch().unwrap();

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let merged = calls[0].as_ref().unwrap();
        assert_eq!(merged["a"], json!([1]));
        assert_eq!(merged["b"], json!([2]));
    }

    #[test]
    fn test_merge_same_key_lists_concatenate() {
        let (listener, seen) = merge_listener();
        listener
            .append("t/one", Some(&json!({"rules_data": [1, 2]})))
            .unwrap();
        listener
            .append("t/two", Some(&json!({"rules_data": [3]})))
            .unwrap();
        listener.dispatch().unwrap();

        let calls = seen.lock().unwrap();
        let merged = calls[0].as_ref().unwrap();
        let mut items: Vec<i64> = merged["rules_data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        items.sort_unstable();
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_scalar_values_are_dropped() {
        let (listener, seen) = merge_listener();
        listener
            .append("t/one", Some(&json!({"flag": true, "keep": {"x": 1}})))
            .unwrap();
        listener.dispatch().unwrap();

        let calls = seen.lock().unwrap();
        let merged = calls[0].as_ref().unwrap();
        assert!(merged.get("flag").is_none());
        assert_eq!(merged["keep"], json!({"x": 1}));
    }

    #[test]
    fn test_append_non_object_is_an_error() {
        let (listener, _) = merge_listener();
        assert!(listener.append("t/one", Some(&json!([1, 2]))).is_err());
    }

    #[test]
    fn test_removal_drops_accumulated_target() {
        let (listener, seen) = merge_listener();
        listener
            .append("t/one", Some(&json!({"a": [1]})))
            .unwrap();
        listener
            .append("t/two", Some(&json!({"b": [2]})))
            .unwrap();
        listener.append("t/one", None).unwrap();
        listener.dispatch().unwrap();

        let calls = seen.lock().unwrap();
        let merged = calls[0].as_ref().unwrap();
        assert!(merged.get("a").is_none());
        assert_eq!(merged["b"], json!([2]));
    }

    #[test]
    fn test_immediate_listener_invokes_per_publish() {
        let (listener, seen) = collecting_listener(|cb| ProductListener::immediate(cb));
        listener.publish(None, Some(json!({"one": 1}))).unwrap();
        listener.publish(None, None).unwrap();

        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Some(json!({"one": 1})));
        assert_eq!(calls[1], None);
    }
}
