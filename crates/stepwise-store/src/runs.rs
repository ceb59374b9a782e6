use chrono::{SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::RunStore;
use stepwise_core::types::{RunId, RunRecord, RunStatus, StateSnapshot};

use crate::store::{db_err, parse_ts, SqliteStore};

pub(crate) fn ts(dt: &chrono::DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

type RunRow = (String, String, String, String, Option<String>, String, String);

fn read_run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_record(row: RunRow) -> Result<RunRecord> {
    let (run_id, workflow_name, status, inputs, error, created_at, updated_at) = row;
    let status = RunStatus::parse(&status)
        .ok_or_else(|| StepwiseError::Database(format!("unknown run status '{}'", status)))?;
    Ok(RunRecord {
        run_id: RunId(run_id),
        workflow_name,
        status,
        inputs: serde_json::from_str(&inputs)?,
        error,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

impl RunStore for SqliteStore {
    fn add(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();

        Box::pin(async move {
            let inputs = serde_json::to_string(&record.inputs)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO runs (run_id, workflow_name, status, inputs, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.run_id.as_str(),
                    record.workflow_name,
                    record.status.as_str(),
                    inputs,
                    record.error,
                    ts(&record.created_at),
                    ts(&record.updated_at),
                ],
            )
            .map_err(db_err)?;
            debug!(run_id = %record.run_id, workflow = %record.workflow_name, "Run recorded");
            Ok(())
        })
    }

    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>> {
        let run_id = run_id.clone();

        Box::pin(async move {
            let row = {
                let conn = self.lock()?;
                conn.query_row(
                    "SELECT run_id, workflow_name, status, inputs, error, created_at, updated_at
                     FROM runs WHERE run_id = ?1",
                    params![run_id.as_str()],
                    read_run_row,
                )
                .optional()
                .map_err(db_err)?
            };
            row.map(into_record).transpose()
        })
    }

    fn update_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();

        Box::pin(async move {
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE runs SET status = ?2, error = COALESCE(?3, error), updated_at = ?4
                     WHERE run_id = ?1",
                    params![run_id.as_str(), status.as_str(), error, ts(&Utc::now())],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(StepwiseError::RunNotFound(run_id.to_string()));
            }
            debug!(run_id = %run_id, status = %status, "Run status updated");
            Ok(())
        })
    }

    fn list_by_workflow(
        &self,
        workflow_name: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RunRecord>>> {
        let workflow_name = workflow_name.to_string();

        Box::pin(async move {
            let rows = {
                let conn = self.lock()?;
                let mut stmt = conn
                    .prepare(
                        "SELECT run_id, workflow_name, status, inputs, error, created_at, updated_at
                         FROM runs
                         WHERE workflow_name = ?1
                         ORDER BY created_at DESC, rowid DESC
                         LIMIT ?2",
                    )
                    .map_err(db_err)?;
                let mapped = stmt
                    .query_map(params![workflow_name, limit as i64], read_run_row)
                    .map_err(db_err)?;
                mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
            };
            rows.into_iter().map(into_record).collect()
        })
    }

    fn save_state(&self, snapshot: &StateSnapshot) -> BoxFuture<'_, Result<()>> {
        let snapshot = snapshot.clone();

        Box::pin(async move {
            let state = serde_json::to_string(&snapshot.state)?;
            let conn = self.lock()?;
            conn.execute(
                "INSERT INTO state_snapshots (run_id, node_id, sequence, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot.run_id.as_str(),
                    snapshot.node_id,
                    snapshot.sequence as i64,
                    state,
                    ts(&snapshot.created_at),
                ],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_latest_state(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StateSnapshot>>> {
        let run_id = run_id.clone();

        Box::pin(async move {
            let mut history = self.query_snapshots(&run_id, true)?;
            Ok(history.pop())
        })
    }

    fn get_state_history(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<StateSnapshot>>> {
        let run_id = run_id.clone();

        Box::pin(async move { self.query_snapshots(&run_id, false) })
    }
}

impl SqliteStore {
    fn query_snapshots(&self, run_id: &RunId, latest_only: bool) -> Result<Vec<StateSnapshot>> {
        let sql = if latest_only {
            "SELECT node_id, sequence, state, created_at FROM state_snapshots
             WHERE run_id = ?1 ORDER BY sequence DESC, id DESC LIMIT 1"
        } else {
            "SELECT node_id, sequence, state, created_at FROM state_snapshots
             WHERE run_id = ?1 ORDER BY sequence ASC, id ASC"
        };

        let rows: Vec<(String, i64, String, String)> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(sql).map_err(db_err)?;
            let mapped = stmt
                .query_map(params![run_id.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(db_err)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        rows.into_iter()
            .map(|(node_id, sequence, state, created_at)| {
                Ok(StateSnapshot {
                    run_id: run_id.clone(),
                    node_id,
                    sequence: sequence as u64,
                    state: serde_json::from_str(&state)?,
                    created_at: parse_ts(&created_at)?,
                })
            })
            .collect()
    }
}
