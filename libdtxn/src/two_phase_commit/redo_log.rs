// Copyright 2023 Bitwise IO, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::engine::{statement, WriteSet};
use crate::error::TransactionError;
use crate::ids::Dtid;
use crate::stats::{Outcome, TransactionStats};
use crate::storage::codec;
use crate::storage::{StorageBackend, StorageError, Table, WriteBatch};
use crate::time::{self, TimeSource};

use super::{MetadataStore, PreparedTransaction, RedoState, TransactionState};

const MAX_REPLAY_ATTEMPTS: usize = 3;

/// The outcome of reloading the redo log after gaining the primary role.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResurrectReport {
    /// Entries loaded back into the prepared pool.
    pub prepared: Vec<Dtid>,
    /// Entries which previously failed to replay.
    pub failed: Vec<Dtid>,
    /// Entries whose dtid is coordinated by this node and already decided.
    pub decided: Vec<(Dtid, TransactionState)>,
}

struct Pool {
    // Closed while the node is not primary; prepares then stay durable only.
    open: bool,
    entries: HashMap<Dtid, PreparedTransaction>,
}

/// Durable redo entries of the local transactions prepared on this node.
///
/// The entries themselves live in the [`Table::Redo`] table. While the node is primary they are
/// also held in an in-memory pool, which is what the health watcher inspects.
///
/// Each entry claims the rows it writes in [`Table::RowLock`], in the same atomic write which
/// stores it. A claimed row can not be written by any other transaction until the entry is
/// committed or rolled back, so the decision can always be applied.
pub struct RedoLog {
    backend: Arc<dyn StorageBackend>,
    time_source: Arc<dyn TimeSource>,
    stats: Arc<TransactionStats>,
    pool: Mutex<Pool>,
}

impl RedoLog {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        time_source: Arc<dyn TimeSource>,
        stats: Arc<TransactionStats>,
    ) -> Self {
        RedoLog {
            backend,
            time_source,
            stats,
            pool: Mutex::new(Pool {
                open: true,
                entries: HashMap::new(),
            }),
        }
    }

    /// Durably records `writes` under `dtid` and claims every row they touch.
    ///
    /// # Errors
    ///
    /// [`TransactionError::ConstraintViolation`] if an entry for `dtid` already exists, or a
    /// row inserted by `writes` was inserted concurrently. [`TransactionError::RowLocked`] if
    /// another prepared transaction claims one of the rows, and
    /// [`TransactionError::WriteConflict`] if one changed since it was read.
    pub fn prepare(&self, dtid: &Dtid, writes: WriteSet) -> Result<(), TransactionError> {
        let preconditions = writes.preconditions();
        let claims: Vec<_> = writes.reads.iter().map(|image| image.claim(dtid)).collect();
        let entry = PreparedTransaction::new(dtid.clone(), self.time_source.now(), writes);
        let batch = WriteBatch::new()
            .require_absent(Table::Redo, dtid.as_str())
            .require(preconditions)
            .put(Table::Redo, dtid.as_str(), codec::encode(&entry)?)
            .extend(claims);

        match self.backend.write(batch) {
            Ok(()) => {
                debug!(
                    "prepared {} with {} statements",
                    dtid,
                    entry.statements.len()
                );
                let mut pool = self.pool.lock();
                if pool.open {
                    pool.entries.insert(dtid.clone(), entry);
                }
                Ok(())
            }
            Err(StorageError::PreconditionFailed {
                table: Table::Redo, ..
            }) => Err(TransactionError::ConstraintViolation(format!(
                "redo entry for dtid {} already exists",
                dtid
            ))),
            Err(err) => Err(statement::write_conflict(&entry.reads, err)),
        }
    }

    /// Applies the entry's writes and deletes the entry in one atomic write.
    ///
    /// Succeeds without doing anything if no entry exists, since the entry is only ever removed
    /// once it has been resolved.
    pub fn commit_prepared(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        for _ in 0..MAX_REPLAY_ATTEMPTS {
            let bytes = match self.backend.get(Table::Redo, dtid.as_str())? {
                Some(bytes) => bytes,
                None => {
                    self.pool.lock().entries.remove(dtid);
                    debug!("{} has no redo entry; already resolved", dtid);
                    return Ok(());
                }
            };
            let entry: PreparedTransaction = codec::decode(&bytes).map_err(|err| {
                TransactionError::Internal(format!("unreadable redo entry for {}: {}", dtid, err))
            })?;

            if entry.state == RedoState::Failed {
                return Err(TransactionError::invalid_state(format!(
                    "redo entry for {} previously failed and must be rolled back",
                    dtid
                )));
            }

            let mutations = match entry.mutations() {
                Some(mutations) => mutations,
                None => {
                    error!("redo entry for {} can not be replayed", dtid);
                    self.mark_failed(entry, bytes)?;
                    return Err(TransactionError::Internal(format!(
                        "redo entry for {} contains statements which can not be replayed",
                        dtid
                    )));
                }
            };

            let batch = WriteBatch::new()
                .require_equals(Table::Redo, dtid.as_str(), bytes.clone())
                .require(entry.reads.iter().map(|image| image.unchanged()))
                .extend(mutations)
                .extend(entry.reads.iter().map(|image| image.release()))
                .delete(Table::Redo, dtid.as_str());

            match self.backend.write(batch) {
                Ok(()) => {
                    self.pool.lock().entries.remove(dtid);
                    self.stats.record_prepared(Outcome::CommitPrepared);
                    debug!("committed prepared transaction {}", dtid);
                    return Ok(());
                }
                Err(StorageError::PreconditionFailed {
                    table: Table::Redo, ..
                }) => {
                    debug!("redo entry for {} changed during replay; retrying", dtid)
                }
                Err(StorageError::PreconditionFailed { table, key }) => {
                    error!(
                        "row {} of {} changed while claimed by prepared transaction {}",
                        key, table, dtid
                    );
                    self.mark_failed(entry, bytes)?;
                    return Err(TransactionError::Internal(format!(
                        "rows claimed by {} were changed by another writer",
                        dtid
                    )));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(TransactionError::invalid_state(format!(
            "redo entry for {} kept changing during replay",
            dtid
        )))
    }

    /// Discards the entry for `dtid` and releases the rows it claims. Succeeds whether or not
    /// an entry exists.
    pub fn rollback_prepared(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        let owner = dtid.as_str().as_bytes();
        for _ in 0..MAX_REPLAY_ATTEMPTS {
            // Claims are found by owner so entries which can not be decoded still release them.
            let claimed: Vec<String> = self
                .backend
                .scan(Table::RowLock, "")?
                .into_iter()
                .filter(|(_, value)| value.as_slice() == owner)
                .map(|(key, _)| key)
                .collect();

            let mut batch = WriteBatch::new();
            for key in &claimed {
                batch = batch
                    .require_equals(Table::RowLock, key.as_str(), owner.to_vec())
                    .delete(Table::RowLock, key.as_str());
            }
            let batch = batch.delete(Table::Redo, dtid.as_str());

            match self.backend.write(batch) {
                Ok(()) => {
                    self.pool.lock().entries.remove(dtid);
                    self.stats.record_prepared(Outcome::RollbackPrepared);
                    debug!(
                        "rolled back prepared transaction {}, releasing {} rows",
                        dtid,
                        claimed.len()
                    );
                    return Ok(());
                }
                Err(StorageError::PreconditionFailed { .. }) => {
                    debug!("claims of {} changed during rollback; retrying", dtid)
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(TransactionError::invalid_state(format!(
            "claims of {} kept changing during rollback",
            dtid
        )))
    }

    fn mark_failed(
        &self,
        mut entry: PreparedTransaction,
        current: Vec<u8>,
    ) -> Result<(), TransactionError> {
        entry.state = RedoState::Failed;
        let batch = WriteBatch::new()
            .require_equals(Table::Redo, entry.dtid.as_str(), current)
            .put(Table::Redo, entry.dtid.as_str(), codec::encode(&entry)?);

        match self.backend.write(batch) {
            // Someone else resolved or marked the entry first.
            Ok(()) | Err(StorageError::PreconditionFailed { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        let mut pool = self.pool.lock();
        if let Some(pooled) = pool.entries.get_mut(&entry.dtid) {
            pooled.state = RedoState::Failed;
        }
        Ok(())
    }

    /// Returns every durable entry, ordered by dtid. Unreadable entries are skipped.
    pub fn entries(&self) -> Result<Vec<PreparedTransaction>, TransactionError> {
        Ok(self
            .backend
            .scan(Table::Redo, "")?
            .into_iter()
            .filter_map(|(dtid, bytes)| match codec::decode(&bytes) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("skipping unreadable redo entry for {}: {}", dtid, err);
                    None
                }
            })
            .collect())
    }

    /// Reloads the prepared pool from the durable entries.
    ///
    /// Outstanding entries are kept, never discarded. Entries whose dtid is coordinated by this
    /// node are matched against `metadata` so the report shows which ones already have a
    /// decision waiting to be delivered.
    pub fn resurrect(&self, metadata: &MetadataStore) -> Result<ResurrectReport, TransactionError> {
        let entries = self.entries()?;
        let mut report = ResurrectReport::default();

        let mut pooled = HashMap::with_capacity(entries.len());
        for entry in entries {
            match entry.state {
                RedoState::Prepared => report.prepared.push(entry.dtid.clone()),
                RedoState::Failed => {
                    error!("redo entry for {} is marked as failed", entry.dtid);
                    report.failed.push(entry.dtid.clone());
                }
            }

            match metadata.read_transaction(&entry.dtid) {
                Ok(Some(txn)) if txn.state.is_decided() => {
                    report.decided.push((entry.dtid.clone(), txn.state))
                }
                Ok(_) => (),
                Err(err) => warn!("unable to read decision for {}: {}", entry.dtid, err),
            }

            pooled.insert(entry.dtid.clone(), entry);
        }
        *self.pool.lock() = Pool {
            open: true,
            entries: pooled,
        };

        info!(
            "resurrected {} prepared transactions ({} failed, {} decided)",
            report.prepared.len(),
            report.failed.len(),
            report.decided.len()
        );
        Ok(report)
    }

    /// Empties and closes the prepared pool, returning the number of entries released.
    ///
    /// Durable entries and their row claims are not touched. Entries prepared while the pool is
    /// closed are only loaded by the next [`resurrect`](Self::resurrect).
    pub fn release(&self) -> usize {
        let mut pool = self.pool.lock();
        pool.open = false;
        let released = pool.entries.len();
        pool.entries.clear();
        released
    }

    pub fn prepared_count(&self) -> usize {
        self.pool.lock().entries.len()
    }

    /// Counts the pooled entries older than `abandon_age`.
    pub fn unresolved_prepares(&self, abandon_age: Duration) -> usize {
        let now = self.time_source.now();
        self.pool
            .lock()
            .entries
            .values()
            .filter(|entry| time::age(now, entry.time_created()) > abandon_age)
            .count()
    }
}
