use crate::config::RemoteConfigSettings;
use crate::error::Result;
use crate::remoteconfig::client::{ProductRegistry, RemoteConfigClient};
use crate::remoteconfig::publishers::ProductListener;
use crate::remoteconfig::transport::AgentTransport;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

struct PollerState {
    worker: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Pid that spawned the worker; a mismatch means we are a forked child
    /// holding an inherited, dead task handle.
    spawn_pid: u32,
}

/// Background scheduler driving the remote configuration client.
///
/// Owned by the process bootstrap with an explicit enable/disable
/// lifecycle; one cycle runs at a time and a slow cycle delays the next
/// tick instead of overlapping it.
pub struct RemoteConfigPoller {
    client: Arc<Mutex<RemoteConfigClient>>,
    registry: ProductRegistry,
    settings: RemoteConfigSettings,
    state: Mutex<PollerState>,
}

impl RemoteConfigPoller {
    pub fn new(client: RemoteConfigClient, settings: RemoteConfigSettings) -> Self {
        let registry = client.registry();
        Self {
            client: Arc::new(Mutex::new(client)),
            registry,
            settings,
            state: Mutex::new(PollerState {
                worker: None,
                shutdown_tx: None,
                spawn_pid: 0,
            }),
        }
    }

    /// Build a poller wired to the HTTP agent transport from settings.
    pub fn from_settings(settings: RemoteConfigSettings) -> Result<Self> {
        let transport = Arc::new(AgentTransport::new(&settings.agent_url)?);
        let client = RemoteConfigClient::new(transport, settings.clone());
        Ok(Self::new(client, settings))
    }

    /// Register a product listener. Safe while the poller is running; the
    /// next cycle picks it up.
    pub fn register_product(&self, product: &str, listener: Arc<ProductListener>) {
        self.registry.insert(product.to_string(), listener);
    }

    pub fn unregister_product(&self, product: &str) {
        self.registry.remove(product);
    }

    /// Ask the agent whether remote configuration is served at all.
    pub async fn enabled_in_agent(&self) -> bool {
        let transport = self.client.lock().await.transport();
        match transport.agent_info().await {
            Ok(info) => info.supports_remote_config(),
            Err(e) => {
                debug!(error = %e, "Agent info check failed");
                false
            }
        }
    }

    /// Start the background poll loop. Returns false without scheduling
    /// when the feature is disabled or the agent does not serve remote
    /// configuration. Idempotent while already running in this process.
    pub async fn enable(&self) -> Result<bool> {
        if !self.settings.enabled {
            info!("Remote configuration disabled, not starting poller");
            return Ok(false);
        }
        if !self.enabled_in_agent().await {
            info!("Agent does not expose remote configuration, not starting poller");
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        let current_pid = std::process::id();
        if state.worker.is_some() {
            if state.spawn_pid == current_pid {
                debug!("Remote config poller already running");
                return Ok(true);
            }
            // Forked child: the inherited worker belongs to the parent and
            // will never run here. Drop the stale handle and restart.
            warn!(
                parent_pid = state.spawn_pid,
                pid = current_pid,
                "Detected fork, restarting remote config poller"
            );
            state.worker = None;
            state.shutdown_tx = None;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = Arc::clone(&self.client);
        let period = self.settings.poll_interval();

        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // A slow cycle delays the next tick; cycles never overlap.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                let mut client = client.lock().await;
                if let Err(e) = client.update().await {
                    // One failed cycle never stops subsequent ones.
                    warn!(error = %e, "Remote config poll cycle failed");
                }
            }
            debug!("Remote config poll loop stopped");
        });

        state.worker = Some(worker);
        state.shutdown_tx = Some(shutdown_tx);
        state.spawn_pid = current_pid;
        counter!("remoteconfig_poller_starts_total", 1);
        info!(interval_seconds = self.settings.poll_interval_seconds, "Remote config poller started");
        Ok(true)
    }

    /// Stop the background loop. Idempotent and callable from any task; an
    /// in-flight cycle gets up to the shutdown budget to finish before the
    /// task is aborted.
    pub async fn disable(&self) {
        let (worker, shutdown_tx) = {
            let mut state = self.state.lock().await;
            (state.worker.take(), state.shutdown_tx.take())
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }

        let Some(mut worker) = worker else {
            return;
        };

        let budget = self.settings.shutdown_timeout();
        match tokio::time::timeout(budget, &mut worker).await {
            Ok(_) => info!("Remote config poller stopped"),
            Err(_) => {
                warn!("Remote config poller did not stop in time, aborting");
                worker.abort();
            }
        }
    }

    /// True when a worker spawned by this process is running.
    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state
            .worker
            .as_ref()
            .map(|w| state.spawn_pid == std::process::id() && !w.is_finished())
            .unwrap_or(false)
    }

    /// Run exactly one poll cycle inline.
    pub async fn periodic(&self) -> Result<()> {
        self.client.lock().await.update().await
    }

    /// Direct access to the client, for state inspection in tests and
    /// bootstrap wiring.
    pub fn client(&self) -> Arc<Mutex<RemoteConfigClient>> {
        Arc::clone(&self.client)
    }
}
