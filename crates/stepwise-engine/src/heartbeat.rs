use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stepwise_core::config::RegistryConfig;
use stepwise_core::traits::RegistryStore;
use stepwise_core::types::RegistryEntry;

/// Keeps one workflow instance registered while it is alive.
///
/// Registers on start, refreshes the entry every `interval`, re-registers
/// when a refresh finds the entry gone (pruned after a stall, for example)
/// and deregisters once cancelled.
pub struct WorkflowHeartbeat {
    store: Arc<dyn RegistryStore>,
    entry: RegistryEntry,
    interval: Duration,
    cancel: CancellationToken,
}

impl WorkflowHeartbeat {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        entry: RegistryEntry,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            entry,
            interval,
            cancel,
        }
    }

    /// Build the entry from the engine's `[registry]` settings.
    pub fn from_config(
        store: Arc<dyn RegistryStore>,
        workflow_name: &str,
        version: &str,
        config: &RegistryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let mut entry = RegistryEntry::new(workflow_name, version, config.ttl_secs);
        entry.endpoint = config.endpoint.clone();
        Self::new(
            store,
            entry,
            Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            cancel,
        )
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.entry.capabilities = capabilities;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.entry.instance_id
    }

    /// Run the heartbeat loop. Blocks until cancelled.
    pub async fn run(mut self) {
        info!(
            instance_id = %self.entry.instance_id,
            workflow = %self.entry.workflow_name,
            interval_secs = self.interval.as_secs(),
            ttl_secs = self.entry.ttl_secs,
            "Heartbeat started"
        );
        self.register().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.cancel.cancelled() => {
                    info!(instance_id = %self.entry.instance_id, "Heartbeat shutting down");
                    break;
                }
            }

            match self.store.heartbeat(&self.entry.instance_id, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(instance_id = %self.entry.instance_id, "Registry entry missing, re-registering");
                    self.register().await;
                }
                Err(e) => {
                    error!(instance_id = %self.entry.instance_id, error = %e, "Heartbeat failed");
                }
            }
        }

        match self.store.deregister(&self.entry.instance_id).await {
            Ok(_) => info!(instance_id = %self.entry.instance_id, "Deregistered"),
            Err(e) => warn!(instance_id = %self.entry.instance_id, error = %e, "Deregistration failed"),
        }
    }

    async fn register(&mut self) {
        let now = Utc::now();
        self.entry.registered_at = now;
        self.entry.last_heartbeat = now;
        if let Err(e) = self.store.register(&self.entry).await {
            error!(instance_id = %self.entry.instance_id, error = %e, "Registration failed");
        }
    }
}
