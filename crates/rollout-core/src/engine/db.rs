//! Persistent storage for run records and the readiness-signal backlog, using redb.
//!
//! # Table design
//!
//! `RUNS` maps a run id (`proposed-change-42`) to its JSON-encoded
//! [`RunRecord`]. Updates are read-modify-write inside one write
//! transaction, so concurrent device processes of the same run never lose
//! each other's transitions.
//!
//! `SIGNALS` uses a 24-byte composite key:
//! ```text
//! [ received_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//! Because the timestamp occupies the high bytes in big-endian encoding,
//! byte ordering equals arrival ordering. A single range scan
//! `since_lower_bound(cutoff)..` returns every signal received after
//! `cutoff`, oldest first.

use std::{path::Path, time::Duration};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{Result, RolloutError};

use super::run::{CoordinatorState, RunRecord, SignalEntry};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

/// Key: run id. Value: JSON-encoded RunRecord.
const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Key: 24-byte composite (received_at_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded SignalEntry
const SIGNALS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("signals");

fn db_err(e: impl std::fmt::Display) -> RolloutError {
    RolloutError::RunDb(e.to_string())
}

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn signal_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Lower bound for a range scan returning all signals received at or after `since`.
///
/// The UUID suffix is all zeros, which sorts before any UUID with the same
/// timestamp.
fn since_lower_bound(since: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = since.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// RunDb
// ---------------------------------------------------------------------------

/// Persistent store for [`RunRecord`]s and [`SignalEntry`]s.
pub struct RunDb {
    db: Database,
}

impl RunDb {
    /// Open or create the redb database at `path`.
    ///
    /// Creates both tables if they don't already exist.
    pub fn open(path: &Path) -> Result<Self> {
        crate::io::ensure_parent(path)?;
        let db = Database::create(path).map_err(db_err)?;
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(RUNS).map_err(db_err)?;
        wt.open_table(SIGNALS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// Insert or overwrite a run record.
    pub fn put(&self, record: &RunRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(RUNS).map_err(db_err)?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<RunRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RUNS).map_err(db_err)?;
        match table.get(id).map_err(db_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// Apply `f` to the stored record for `id` and persist the result
    /// atomically. Returns the updated record.
    pub fn update<F>(&self, id: &str, f: F) -> Result<RunRecord>
    where
        F: FnOnce(&mut RunRecord),
    {
        let wt = self.db.begin_write().map_err(db_err)?;
        let record = {
            let mut table = wt.open_table(RUNS).map_err(db_err)?;
            let mut record: RunRecord = {
                let current = table
                    .get(id)
                    .map_err(db_err)?
                    .ok_or_else(|| RolloutError::RunNotFound(id.to_string()))?;
                serde_json::from_slice(current.value())?
            };
            f(&mut record);
            record.updated_at = Utc::now();
            let value = serde_json::to_vec(&record)?;
            table.insert(id, value.as_slice()).map_err(db_err)?;
            record
        };
        wt.commit().map_err(db_err)?;
        Ok(record)
    }

    /// List all runs, sorted by `created_at` descending (newest first).
    pub fn list_all(&self) -> Result<Vec<RunRecord>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(RUNS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let record: RunRecord = serde_json::from_slice(v.value())?;
            result.push(record);
        }
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(result)
    }

    /// Runs that have not reached a terminal state, oldest first.
    pub fn list_unfinished(&self) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<_> = self
            .list_all()?
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .collect();
        runs.reverse();
        Ok(runs)
    }

    /// On startup, mark every unfinished run last touched before `max_age`
    /// ago as `Failed`.
    ///
    /// Returns the ids of the abandoned runs.
    pub fn abandon_stale(&self, max_age: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(db_err)?;

        let mut abandoned = Vec::new();
        for record in self.list_unfinished()? {
            if record.updated_at < cutoff {
                self.update(&record.id, |r| {
                    r.state = CoordinatorState::Failed {
                        reason: "abandoned after restart".into(),
                    };
                })?;
                abandoned.push(record.id);
            }
        }
        Ok(abandoned)
    }

    // -----------------------------------------------------------------------
    // Signal backlog
    // -----------------------------------------------------------------------

    pub fn record_signal(&self, entry: &SignalEntry) -> Result<()> {
        let key = signal_key(entry.received_at, entry.id);
        let value = serde_json::to_vec(entry)?;
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(SIGNALS).map_err(db_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(db_err)?;
        }
        wt.commit().map_err(db_err)?;
        Ok(())
    }

    /// Signals received at or after `since`, in arrival order.
    pub fn signals_since(&self, since: DateTime<Utc>) -> Result<Vec<SignalEntry>> {
        let lower = since_lower_bound(since);
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SIGNALS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in table.range(lower.as_slice()..).map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Delete signals received before `before`. Returns the number removed.
    pub fn prune_signals(&self, before: DateTime<Utc>) -> Result<usize> {
        let upper = since_lower_bound(before);
        let wt = self.db.begin_write().map_err(db_err)?;
        let removed = {
            let mut table = wt.open_table(SIGNALS).map_err(db_err)?;
            let keys: Vec<Vec<u8>> = {
                let mut keys = Vec::new();
                for entry in table.range(..upper.as_slice()).map_err(db_err)? {
                    let (k, _) = entry.map_err(db_err)?;
                    keys.push(k.value().to_vec());
                }
                keys
            };
            for key in &keys {
                table.remove(key.as_slice()).map_err(db_err)?;
            }
            keys.len()
        };
        wt.commit().map_err(db_err)?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
