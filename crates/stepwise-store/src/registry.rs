use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::params;
use tracing::debug;

use stepwise_core::error::Result;
use stepwise_core::traits::RegistryStore;
use stepwise_core::types::RegistryEntry;

use crate::runs::ts;
use crate::store::{db_err, parse_ts, SqliteStore};

type EntryRow = (String, String, String, Option<String>, String, String, String, i64);

impl SqliteStore {
    fn all_entries(&self) -> Result<Vec<RegistryEntry>> {
        let rows: Vec<EntryRow> = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare(
                    "SELECT instance_id, workflow_name, version, endpoint, capabilities,
                            registered_at, last_heartbeat, ttl_secs
                     FROM registry ORDER BY registered_at ASC",
                )
                .map_err(db_err)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                })
                .map_err(db_err)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        rows.into_iter()
            .map(
                |(instance_id, workflow_name, version, endpoint, caps, registered, heartbeat, ttl)| {
                    Ok(RegistryEntry {
                        instance_id,
                        workflow_name,
                        version,
                        endpoint,
                        capabilities: serde_json::from_str(&caps)?,
                        registered_at: parse_ts(&registered)?,
                        last_heartbeat: parse_ts(&heartbeat)?,
                        ttl_secs: ttl.max(0) as u64,
                    })
                },
            )
            .collect()
    }
}

impl RegistryStore for SqliteStore {
    fn register(&self, entry: &RegistryEntry) -> BoxFuture<'_, Result<()>> {
        let entry = entry.clone();

        Box::pin(async move {
            let capabilities = serde_json::to_string(&entry.capabilities)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO registry
                    (instance_id, workflow_name, version, endpoint, capabilities,
                     registered_at, last_heartbeat, ttl_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.instance_id,
                    entry.workflow_name,
                    entry.version,
                    entry.endpoint,
                    capabilities,
                    ts(&entry.registered_at),
                    ts(&entry.last_heartbeat),
                    entry.ttl_secs as i64,
                ],
            )
            .map_err(db_err)?;
            debug!(instance = %entry.instance_id, workflow = %entry.workflow_name, "Instance registered");
            Ok(())
        })
    }

    fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> BoxFuture<'_, Result<bool>> {
        let instance_id = instance_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE registry SET last_heartbeat = ?2 WHERE instance_id = ?1",
                    params![instance_id, ts(&at)],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }

    fn deregister(&self, instance_id: &str) -> BoxFuture<'_, Result<bool>> {
        let instance_id = instance_id.to_string();

        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "DELETE FROM registry WHERE instance_id = ?1",
                    params![instance_id],
                )
                .map_err(db_err)?;
            Ok(changed > 0)
        })
    }

    fn list_live(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<RegistryEntry>>> {
        Box::pin(async move {
            Ok(self
                .all_entries()?
                .into_iter()
                .filter(|e| e.is_live(now))
                .collect())
        })
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let expired: Vec<String> = self
                .all_entries()?
                .into_iter()
                .filter(|e| !e.is_live(now))
                .map(|e| e.instance_id)
                .collect();

            let conn = self.lock()?;
            for id in &expired {
                conn.execute("DELETE FROM registry WHERE instance_id = ?1", params![id])
                    .map_err(db_err)?;
            }
            if !expired.is_empty() {
                debug!(count = expired.len(), "Pruned expired registry entries");
            }
            Ok(expired.len())
        })
    }
}
