//! Atomic mutator: the only path through which tables are written.
//!
//! Every mutation reads the current table, hands it to a closure, and
//! writes the result back under an exclusive lock scoped to that one
//! table. Two lock strategies are supported:
//!
//! - [`LockMode::Advisory`]: an `fs2` advisory file lock held for the
//!   duration of the read-modify-write. Blocks other processes on the
//!   same table; polls up to `lock_timeout` before giving up.
//! - [`LockMode::CompareAndSwap`]: no OS lock. The raw snapshot is read
//!   before and after the closure runs; if it changed, the write is
//!   rejected with [`SwarmError::Contention`] and the caller retries.
//!
//! Cross-table operations always acquire locks in the fixed order
//! `agents` -> `work_claims` -> `coordination_log` to prevent deadlock.

use crate::config::{KernelConfig, LockMode};
use crate::error::SwarmError;
use crate::store::{StateStore, Table};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::OpenOptions;
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct AtomicMutator {
    store: StateStore,
    lock_mode: LockMode,
    lock_timeout: Duration,
}

/// Fixed cross-table lock acquisition order. Any operation that touches
/// more than one table must request locks in this relative order.
pub const TABLE_LOCK_ORDER: [Table; 3] = [Table::Agents, Table::WorkClaims, Table::CoordinationLog];

impl AtomicMutator {
    pub fn new(store: StateStore, config: &KernelConfig) -> Self {
        Self {
            store,
            lock_mode: config.lock_mode,
            lock_timeout: config.lock_timeout,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Read-modify-write `table`: `f` receives the current rows and
    /// returns the new rows plus an arbitrary result value.
    pub fn with_table<T, R>(
        &self,
        table: Table,
        f: impl FnOnce(Vec<T>) -> Result<(Vec<T>, R), SwarmError>,
    ) -> Result<R, SwarmError>
    where
        T: Serialize + DeserializeOwned,
    {
        match self.lock_mode {
            LockMode::Advisory => self.with_table_locked(table, f),
            LockMode::CompareAndSwap => self.with_table_cas(table, f),
        }
    }

    fn with_table_locked<T, R>(
        &self,
        table: Table,
        f: impl FnOnce(Vec<T>) -> Result<(Vec<T>, R), SwarmError>,
    ) -> Result<R, SwarmError>
    where
        T: Serialize + DeserializeOwned,
    {
        let lock_path = self.store.lock_path(table);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => {
                    return Err(SwarmError::LockTimeout {
                        table: table.file_name().to_string(),
                        waited_ms: self.lock_timeout.as_millis() as u64,
                    })
                }
            }
        }

        let result = (|| {
            let rows: Vec<T> = self.store.read_table_typed(table)?;
            let (new_rows, r) = f(rows)?;
            self.store.write_table(table, &new_rows)?;
            Ok(r)
        })();

        let _ = FileExt::unlock(&lock_file);
        result
    }

    fn with_table_cas<T, R>(
        &self,
        table: Table,
        f: impl FnOnce(Vec<T>) -> Result<(Vec<T>, R), SwarmError>,
    ) -> Result<R, SwarmError>
    where
        T: Serialize + DeserializeOwned,
    {
        let before_raw = self.store.read_table_raw(table)?;
        let rows: Vec<T> = serde_json::from_str(&before_raw).map_err(|e| SwarmError::Corrupt {
            table: table.file_name().to_string(),
            message: e.to_string(),
        })?;
        let (new_rows, r) = f(rows)?;

        let after_raw = self.store.read_table_raw(table)?;
        if after_raw != before_raw {
            return Err(SwarmError::Contention { table: table.file_name().to_string() });
        }
        self.store.write_table(table, &new_rows)?;
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agent, AgentStatus};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn agent(id: &str) -> Agent {
        Agent {
            agent_id: id.to_string(),
            team: "core".to_string(),
            specialization: "generalist".to_string(),
            capacity: 100,
            max_concurrent_work: 3,
            status: AgentStatus::Active,
            last_heartbeat_ns: 0,
            capabilities: BTreeSet::new(),
        }
    }

    #[test]
    fn advisory_mode_serializes_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let cfg = KernelConfig::for_dir(dir.path());
        let mutator = Arc::new(AtomicMutator::new(store, &cfg));

        let mut handles = Vec::new();
        for i in 0..8 {
            let mutator = Arc::clone(&mutator);
            handles.push(std::thread::spawn(move || {
                mutator
                    .with_table::<Agent, ()>(Table::Agents, |mut rows| {
                        rows.push(agent(&format!("agent_{i}")));
                        Ok((rows, ()))
                    })
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let rows = mutator.store().read_agents().unwrap();
        assert_eq!(rows.len(), 8);
    }

    #[test]
    fn cas_mode_rejects_writes_after_concurrent_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let mut cfg = KernelConfig::for_dir(dir.path());
        cfg.lock_mode = LockMode::CompareAndSwap;
        let mutator = AtomicMutator::new(store, &cfg);

        let err = mutator
            .with_table::<Agent, ()>(Table::Agents, |rows| {
                // Simulate a racing writer mutating the table mid-closure.
                mutator.store().write_table(Table::Agents, &[agent("intruder")]).unwrap();
                Ok((rows, ()))
            })
            .unwrap_err();
        assert!(matches!(err, SwarmError::Contention { .. }));
    }
}
