//! C9: periodic liveness probes per registered server (spec.md §4.9).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Method;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::stdio::{ProcessState, StdioSessionManager};
use crate::storage::{Health, StorageManager};

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Event published whenever a health probe changes the registered-servers
/// view, consumed by UIs (spec.md §4.9, out of scope for this crate but
/// wired here as the documented extension point).
#[derive(Debug, Clone)]
pub struct RegistryUpdated;

/// Runs periodic probes for every registered server and persists the
/// resulting [`Health`] classification.
pub struct HealthMonitor {
    storage: Arc<StorageManager>,
    http_client: reqwest::Client,
    /// Shared with the [`crate::gateway::Gateway`] that registers and
    /// deregisters stdio servers at runtime, so probes always see the
    /// current set without reconstructing the monitor.
    stdio_managers: Arc<DashMap<String, Arc<StdioSessionManager>>>,
    updates: broadcast::Sender<RegistryUpdated>,
}

impl HealthMonitor {
    pub fn new(storage: Arc<StorageManager>, stdio_managers: Arc<DashMap<String, Arc<StdioSessionManager>>>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_PROBE_TIMEOUT)
            .build()
            .expect("reqwest client with only a timeout configured cannot fail to build");
        let (updates, _) = broadcast::channel(64);
        Self { storage, http_client, stdio_managers, updates }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryUpdated> {
        self.updates.subscribe()
    }

    /// Probe one server and return its classification without persisting.
    /// Exposed separately from [`Self::probe_and_persist`] so tests can
    /// assert on classification without a storage dependency.
    pub async fn probe(&self, config: &ServerConfig) -> Health {
        match config {
            ServerConfig::Http { url, .. } => self.probe_http(url).await,
            ServerConfig::Stdio { name, .. } => self.probe_stdio(name),
        }
    }

    async fn probe_http(&self, url: &str) -> Health {
        match self.http_client.request(Method::OPTIONS, url).send().await {
            Ok(response) if response.status().is_server_error() => Health::Down,
            Ok(_) => Health::Up,
            Err(e) => {
                debug!(url, error = %e, "health probe failed");
                Health::Down
            }
        }
    }

    fn probe_stdio(&self, name: &str) -> Health {
        let Some(manager) = self.stdio_managers.get(name) else { return Health::Unknown };
        if manager.is_isolated() {
            return if manager.has_running_isolated_session() { Health::Up } else { Health::Unknown };
        }
        match manager.shared_state() {
            Some(ProcessState::Running) => Health::Up,
            Some(ProcessState::Crashed) | Some(ProcessState::Terminated) => Health::Down,
            _ => Health::Unknown,
        }
    }

    /// Probe every registered server and persist the result, invalidating
    /// the registered-servers cache and publishing a [`RegistryUpdated`]
    /// event.
    pub async fn probe_and_persist(&self) {
        let servers = match self.storage.get_servers().await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(error = %e, "health monitor failed to list registered servers");
                return;
            }
        };

        for mut view in servers {
            let health = self.probe(&view.config).await;
            view.health = health;
            view.last_health_check = Some(chrono::Utc::now());
            if let Err(e) = self.storage.update_server_view(view).await {
                warn!(error = %e, "health monitor failed to persist server view");
            }
        }

        let _ = self.updates.send(RegistryUpdated);
    }

    /// Spawn the periodic probe loop at `interval` (spec.md §4.9 default 30s).
    pub fn spawn(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.probe_and_persist().await;
            }
        })
    }
}
