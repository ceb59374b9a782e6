use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use stepwise_core::error::Result;
use stepwise_core::traits::RegistryStore;
use stepwise_core::types::RegistryEntry;

/// Score how well an instance covers a set of required capabilities.
///
/// Each match is worth 5; covering every requirement earns a flat 20
/// instead. Matching is case-insensitive.
pub fn match_score(entry: &RegistryEntry, required: &[String]) -> f64 {
    if required.is_empty() {
        return 0.0;
    }
    let matched = required
        .iter()
        .filter(|r| entry.capabilities.iter().any(|c| c.eq_ignore_ascii_case(r)))
        .count();
    if matched == required.len() {
        20.0
    } else {
        matched as f64 * 5.0
    }
}

/// Discovery and routing over live registry entries.
pub struct Orchestrator {
    store: Arc<dyn RegistryStore>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    /// Live instances of a workflow, most recently refreshed first.
    pub async fn discover(&self, workflow_name: &str) -> Result<Vec<RegistryEntry>> {
        let mut live: Vec<RegistryEntry> = self
            .store
            .list_live(Utc::now())
            .await?
            .into_iter()
            .filter(|e| e.workflow_name == workflow_name)
            .collect();
        live.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        debug!(workflow = %workflow_name, instances = live.len(), "Discovered workflow instances");
        Ok(live)
    }

    /// The live instance that best covers `capabilities`, if any scores
    /// above zero. Ties go to the most recently refreshed instance.
    pub async fn route(&self, capabilities: &[String]) -> Result<Option<RegistryEntry>> {
        let mut live = self.store.list_live(Utc::now()).await?;
        live.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));

        let best = live
            .into_iter()
            .map(|e| {
                let score = match_score(&e, capabilities);
                (e, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .fold(None::<(RegistryEntry, f64)>, |best, (e, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((e, score)),
            });

        if let Some((ref entry, score)) = best {
            info!(
                instance_id = %entry.instance_id,
                workflow = %entry.workflow_name,
                score,
                "Routing to workflow instance"
            );
        }
        Ok(best.map(|(e, _)| e))
    }

    /// Drop expired entries from the registry.
    pub async fn prune(&self) -> Result<usize> {
        let removed = self.store.prune_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "Pruned expired registry entries");
        }
        Ok(removed)
    }
}
