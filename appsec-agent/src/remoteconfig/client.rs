use crate::config::RemoteConfigSettings;
use crate::error::{AppSecError, Result};
use crate::remoteconfig::protocol::{
    parse_config_path, ApplyState, CachedTargetFile, ClientGetConfigsResponse, ConfigMetadata,
    SignedTargets, TargetFile, TargetFileHash,
};
use crate::remoteconfig::publishers::ProductListener;
use crate::remoteconfig::transport::ConfigTransport;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use metrics::counter;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Process-wide registry of product listeners. Mutated by setup code while
/// the poller thread reads snapshots of it.
pub type ProductRegistry = Arc<DashMap<String, Arc<ProductListener>>>;

/// Remote configuration client: one instance per process, driven by the
/// poller. Builds the signed request envelope, verifies the response and
/// applies changed configurations through the registered listeners.
pub struct RemoteConfigClient {
    transport: Arc<dyn ConfigTransport>,
    settings: RemoteConfigSettings,
    client_id: String,
    runtime_id: String,
    products: ProductRegistry,
    applied_configs: HashMap<String, ConfigMetadata>,
    cached_target_files: HashMap<String, CachedTargetFile>,
    targets_version: u64,
    backend_state: Option<String>,
    last_error: Option<String>,
}

impl RemoteConfigClient {
    pub fn new(transport: Arc<dyn ConfigTransport>, settings: RemoteConfigSettings) -> Self {
        Self {
            transport,
            settings,
            client_id: Uuid::new_v4().to_string(),
            runtime_id: Uuid::new_v4().to_string(),
            products: Arc::new(DashMap::new()),
            applied_configs: HashMap::new(),
            cached_target_files: HashMap::new(),
            targets_version: 0,
            backend_state: None,
            last_error: None,
        }
    }

    /// Shared handle to the product registry, safe to mutate from other
    /// threads while the poller is running.
    pub fn registry(&self) -> ProductRegistry {
        Arc::clone(&self.products)
    }

    pub fn transport(&self) -> Arc<dyn ConfigTransport> {
        Arc::clone(&self.transport)
    }

    pub fn register_product(&self, product: &str, listener: Arc<ProductListener>) {
        self.products.insert(product.to_string(), listener);
    }

    pub fn unregister_product(&self, product: &str) {
        self.products.remove(product);
    }

    /// Currently applied configuration state, for reporting/tests.
    pub fn applied_configs(&self) -> &HashMap<String, ConfigMetadata> {
        &self.applied_configs
    }

    /// One poll cycle: request, verify, apply. Transport and verification
    /// errors abort the cycle and surface here; the next tick retries.
    pub async fn update(&mut self) -> Result<()> {
        let payload = self.build_payload();
        let response = self.transport.send_request(payload).await?;
        let parsed: ClientGetConfigsResponse = serde_json::from_value(response)
            .map_err(|e| AppSecError::RemoteConfigTransport(format!("malformed response: {e}")))?;

        counter!("remoteconfig_poll_cycles_total", 1);
        match self.process_response(parsed) {
            Ok(()) => {
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                counter!("remoteconfig_poll_failures_total", 1);
                Err(e)
            }
        }
    }

    /// Request payload carrying known products, apply states and cached
    /// target hashes.
    pub fn build_payload(&self) -> Value {
        let mut products: Vec<String> = self.products.iter().map(|e| e.key().clone()).collect();
        products.sort();

        let config_states: Vec<Value> = self
            .applied_configs
            .values()
            .map(|config| {
                json!({
                    "id": config.id,
                    "version": config.tuf_version,
                    "product": config.product_name,
                    "apply_state": config.apply_state,
                    "apply_error": config.apply_error,
                })
            })
            .collect();

        let mut cached: Vec<&CachedTargetFile> = self.cached_target_files.values().collect();
        cached.sort_by(|a, b| a.path.cmp(&b.path));

        json!({
            "client": {
                "id": self.client_id,
                "products": products,
                "is_tracer": true,
                "client_tracer": {
                    "runtime_id": self.runtime_id,
                    "language": "rust",
                    "tracer_version": env!("CARGO_PKG_VERSION"),
                    "service": self.settings.service,
                    "env": self.settings.env,
                    "app_version": self.settings.app_version,
                },
                "state": {
                    "root_version": 1,
                    "targets_version": self.targets_version,
                    "config_states": config_states,
                    "has_error": self.last_error.is_some(),
                    "error": self.last_error.clone().unwrap_or_default(),
                    "backend_client_state": self.backend_state.clone().unwrap_or_default(),
                },
            },
            "cached_target_files": cached,
        })
    }

    /// Verify and apply one decoded poll response.
    pub fn process_response(&mut self, payload: ClientGetConfigsResponse) -> Result<()> {
        let Some(targets_b64) = payload.targets.clone().filter(|t| !t.is_empty()) else {
            // No signed targets means no change set this cycle.
            return Ok(());
        };

        let signed = decode_targets(&targets_b64)?;
        self.validate_config_exists_in_target_paths(
            &payload.client_configs,
            &payload.target_files,
        )?;

        let mut client_configs: HashMap<String, ConfigMetadata> = HashMap::new();
        for path in &payload.client_configs {
            let description = signed.signed.targets.get(path).ok_or_else(|| {
                AppSecError::RemoteConfigVerification(format!(
                    "client config {path} missing from signed targets"
                ))
            })?;
            let (product_name, id) = parse_config_path(path).ok_or_else(|| {
                AppSecError::RemoteConfigVerification(format!("unparseable config path {path}"))
            })?;
            let sha256_hash = description.sha256().ok_or_else(|| {
                AppSecError::RemoteConfigVerification(format!("no sha256 declared for {path}"))
            })?;
            client_configs.insert(
                path.clone(),
                ConfigMetadata {
                    id,
                    product_name,
                    sha256_hash: sha256_hash.to_string(),
                    length: description.length,
                    tuf_version: description.tuf_version(),
                    apply_state: ApplyState::Unacknowledged,
                    apply_error: None,
                },
            );
        }

        let mut pending_dispatch: Vec<Arc<ProductListener>> = Vec::new();
        self.remove_previously_applied_configurations(&client_configs, &mut pending_dispatch);

        let mut applied_configs = HashMap::new();
        self.load_new_configurations(
            &mut applied_configs,
            client_configs,
            &payload,
            &mut pending_dispatch,
        )?;

        for listener in pending_dispatch {
            if let Err(e) = listener.dispatch() {
                warn!(error = %e, "Merged config dispatch failed");
            }
        }

        self.applied_configs = applied_configs;
        self.cached_target_files = self
            .applied_configs
            .iter()
            .map(|(path, config)| {
                (
                    path.clone(),
                    CachedTargetFile {
                        path: path.clone(),
                        length: config.length,
                        hashes: vec![TargetFileHash {
                            algorithm: "sha256".to_string(),
                            hash: config.sha256_hash.clone(),
                        }],
                    },
                )
            })
            .collect();
        self.targets_version = signed.signed.version;
        self.backend_state = signed
            .signed
            .custom
            .as_ref()
            .and_then(|c| c.opaque_backend_state.clone());

        Ok(())
    }

    /// Strict gate: every referenced config path must be present among the
    /// pushed target files or the local cache, else the whole cycle aborts.
    pub fn validate_config_exists_in_target_paths(
        &self,
        client_configs: &[String],
        target_files: &[TargetFile],
    ) -> Result<()> {
        for path in client_configs {
            let in_payload = target_files.iter().any(|f| &f.path == path);
            let in_cache = self.cached_target_files.contains_key(path);
            if !in_payload && !in_cache {
                return Err(AppSecError::RemoteConfigVerification(format!(
                    "client config {path} not found in target files or cache"
                )));
            }
        }
        Ok(())
    }

    /// Decode and hash-verify one target file.
    ///
    /// `Ok(None)` means the raw content is not in this payload (nothing to
    /// apply); a hash mismatch is a verification failure that aborts the
    /// cycle; base64/JSON failures are per-config errors handled by the
    /// caller.
    fn extract_target_file(
        &self,
        payload: &ClientGetConfigsResponse,
        target: &str,
        config: &ConfigMetadata,
    ) -> Result<Option<Value>> {
        let Some(file) = payload.target_files.iter().find(|f| f.path == target) else {
            debug!(target = %target, "Target file content not in payload");
            return Ok(None);
        };

        let raw = BASE64.decode(file.raw.as_bytes()).map_err(|e| {
            AppSecError::CallbackApplication {
                product: config.product_name.clone(),
                message: format!("invalid base64 content for {target}: {e}"),
            }
        })?;

        let digest = hex_digest(&raw);
        if digest != config.sha256_hash {
            return Err(AppSecError::RemoteConfigVerification(format!(
                "sha256 mismatch for {target}: expected {} got {digest}",
                config.sha256_hash
            )));
        }

        let content = serde_json::from_slice(&raw).map_err(|e| {
            AppSecError::CallbackApplication {
                product: config.product_name.clone(),
                message: format!("target {target} is not valid JSON: {e}"),
            }
        })?;
        Ok(Some(content))
    }

    /// Apply every new or changed configuration. Per-config callback and
    /// extraction failures mark that config ERROR; verification failures
    /// propagate and abort the cycle.
    fn load_new_configurations(
        &mut self,
        applied_configs: &mut HashMap<String, ConfigMetadata>,
        client_configs: HashMap<String, ConfigMetadata>,
        payload: &ClientGetConfigsResponse,
        pending_dispatch: &mut Vec<Arc<ProductListener>>,
    ) -> Result<()> {
        for (target, mut config) in client_configs {
            if let Some(previous) = self.applied_configs.get(&target) {
                if previous.sha256_hash == config.sha256_hash {
                    // Unchanged config: carry the recorded state forward
                    // without re-applying.
                    applied_configs.insert(target, previous.clone());
                    continue;
                }
            }

            let Some(listener) = self.products.get(&config.product_name).map(|e| Arc::clone(e.value()))
            else {
                // Unknown product: forward compatibility, skip silently.
                debug!(product = %config.product_name, target = %target, "No listener registered");
                continue;
            };

            match self.extract_target_file(payload, &target, &config) {
                Ok(Some(content)) => {
                    match Self::apply_callback(pending_dispatch, &listener, content, &target, &config)
                    {
                        Ok(()) => {
                            config.apply_state = ApplyState::Acknowledged;
                            counter!("remoteconfig_configs_applied_total", 1);
                        }
                        Err(e) => {
                            warn!(target = %target, error = %e, "Product callback failed");
                            config.apply_state = ApplyState::Error;
                            config.apply_error = Some(e.to_string());
                            counter!("remoteconfig_configs_failed_total", 1);
                        }
                    }
                    applied_configs.insert(target, config);
                }
                Ok(None) => {}
                Err(e @ AppSecError::RemoteConfigVerification(_)) => return Err(e),
                Err(e) => {
                    warn!(target = %target, error = %e, "Failed to extract target file");
                    config.apply_state = ApplyState::Error;
                    config.apply_error = Some(e.to_string());
                    applied_configs.insert(target, config);
                }
            }
        }
        Ok(())
    }

    /// Route one config through its listener. Merge listeners only
    /// accumulate here; they are queued for a single dispatch at the end of
    /// the cycle (coalesced by listener identity).
    fn apply_callback(
        pending_dispatch: &mut Vec<Arc<ProductListener>>,
        listener: &Arc<ProductListener>,
        content: Value,
        target: &str,
        config: &ConfigMetadata,
    ) -> anyhow::Result<()> {
        if listener.is_merge() {
            listener.append(target, Some(&content))?;
            if !pending_dispatch.iter().any(|l| Arc::ptr_eq(l, listener)) {
                pending_dispatch.push(Arc::clone(listener));
            }
            Ok(())
        } else {
            listener.publish(Some(config), Some(content))
        }
    }

    /// Dispatch removals for configs the control service stopped
    /// referencing, so listeners can clean up.
    fn remove_previously_applied_configurations(
        &self,
        client_configs: &HashMap<String, ConfigMetadata>,
        pending_dispatch: &mut Vec<Arc<ProductListener>>,
    ) {
        for (target, config) in &self.applied_configs {
            if client_configs.contains_key(target) {
                continue;
            }
            let Some(listener) = self.products.get(&config.product_name).map(|e| Arc::clone(e.value()))
            else {
                continue;
            };
            debug!(target = %target, "Dispatching config removal");
            if listener.is_merge() {
                if let Err(e) = listener.append(target, None) {
                    warn!(target = %target, error = %e, "Removal append failed");
                }
                if !pending_dispatch.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                    pending_dispatch.push(listener);
                }
            } else if let Err(e) = listener.publish(Some(config), None) {
                warn!(target = %target, error = %e, "Removal callback failed");
            }
        }
    }
}

fn decode_targets(targets_b64: &str) -> Result<SignedTargets> {
    let raw = BASE64.decode(targets_b64.as_bytes()).map_err(|e| {
        AppSecError::RemoteConfigVerification(format!("targets is not valid base64: {e}"))
    })?;
    serde_json::from_slice(&raw).map_err(|e| {
        AppSecError::RemoteConfigVerification(format!("targets is not a signed envelope: {e}"))
    })
}

fn hex_digest(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
