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

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::WriteSet;
use crate::error::TransactionError;
use crate::ids::{CallerId, Dtid};
use crate::storage::codec;
use crate::storage::{StorageBackend, StorageError, Table, WriteBatch};
use crate::target::Target;
use crate::time::{self, TimeSource};

use super::TransactionMetadata;
use super::TransactionState;
use super::Transition;

// A state row only changes on its single decision and on conclusion, so losing a
// compare-and-set more than a couple of times means something is rewriting it in a loop.
const MAX_TRANSITION_ATTEMPTS: usize = 8;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StateRow {
    state: TransactionState,
    time_created: u64,
}

/// The durable record of distributed transaction decisions coordinated by this node.
///
/// Each dtid owns one state row and one participants row. Every operation touches only the rows
/// of its own dtid, so unrelated transactions never contend.
pub struct MetadataStore {
    backend: Arc<dyn StorageBackend>,
    time_source: Arc<dyn TimeSource>,
    abandon_age: Duration,
}

impl MetadataStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        time_source: Arc<dyn TimeSource>,
        abandon_age: Duration,
    ) -> Self {
        MetadataStore {
            backend,
            time_source,
            abandon_age,
        }
    }

    pub fn abandon_age(&self) -> Duration {
        self.abandon_age
    }

    /// Records a new distributed transaction in the PREPARE state.
    ///
    /// # Errors
    ///
    /// [`TransactionError::ConstraintViolation`] if the dtid already exists; the existing record,
    /// participants included, is left untouched.
    pub fn create_transaction(
        &self,
        dtid: &Dtid,
        participants: &[Target],
    ) -> Result<(), TransactionError> {
        let row = StateRow {
            state: TransactionState::Prepare,
            time_created: time::to_unix_nanos(self.time_source.now()),
        };

        let batch = WriteBatch::new()
            .require_absent(Table::TransactionState, dtid.as_str())
            .put(
                Table::TransactionState,
                dtid.as_str(),
                codec::encode(&row)?,
            )
            .put(
                Table::Participants,
                dtid.as_str(),
                codec::encode(&participants)?,
            );

        match self.backend.write(batch) {
            Ok(()) => {
                debug!(
                    "created distributed transaction {} with {} participants",
                    dtid,
                    participants.len()
                );
                Ok(())
            }
            Err(StorageError::PreconditionFailed { .. }) => Err(
                TransactionError::ConstraintViolation(format!("dtid {} already exists", dtid)),
            ),
            Err(err) => Err(err.into()),
        }
    }

    /// Records the COMMIT decision.
    ///
    /// `local_writes` are the coordinator's own local changes; they become durable in the same
    /// atomic write as the decision, under the same row checks as a local commit. If one of
    /// the rows was changed or claimed since it was read, no decision is recorded.
    pub fn start_commit(
        &self,
        caller: &CallerId,
        dtid: &Dtid,
        local_writes: &WriteSet,
    ) -> Result<(), TransactionError> {
        self.transition(caller, dtid, TransactionState::Commit, local_writes)
    }

    /// Records the ROLLBACK decision. Fails if COMMIT has already been decided.
    pub fn set_rollback(&self, caller: &CallerId, dtid: &Dtid) -> Result<(), TransactionError> {
        self.transition(caller, dtid, TransactionState::Rollback, &WriteSet::default())
    }

    fn transition(
        &self,
        caller: &CallerId,
        dtid: &Dtid,
        to: TransactionState,
        local_writes: &WriteSet,
    ) -> Result<(), TransactionError> {
        let mutations = local_writes.mutations().ok_or_else(|| {
            TransactionError::Internal(format!("local writes of {} include a non-write", dtid))
        })?;

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self
                .backend
                .get(Table::TransactionState, dtid.as_str())?
                .ok_or_else(|| {
                    TransactionError::NotFound(format!("distributed transaction {}", dtid))
                })?;
            let mut row: StateRow = codec::decode(&current)?;

            let transition = row.state.transition(to).map_err(|err| {
                TransactionError::IllegalStateTransition {
                    dtid: dtid.clone(),
                    caller: caller.clone(),
                    from: err.from,
                    to: err.to,
                }
            })?;

            let mut batch =
                WriteBatch::new().require_equals(Table::TransactionState, dtid.as_str(), current);
            if let Transition::Changed(state) = transition {
                row.state = state;
                batch = batch.put(
                    Table::TransactionState,
                    dtid.as_str(),
                    codec::encode(&row)?,
                );
            }
            batch = batch
                .require(local_writes.preconditions())
                .extend(mutations.iter().cloned());

            if batch.is_empty() {
                return Ok(());
            }

            match self.backend.write(batch) {
                Ok(()) => {
                    debug!("distributed transaction {} is now {}", dtid, to);
                    return Ok(());
                }
                Err(StorageError::PreconditionFailed {
                    table: Table::TransactionState,
                    ..
                }) => {
                    debug!("state of {} changed concurrently; retrying", dtid);
                }
                Err(err) => return Err(local_writes.conflict(err)),
            }
        }

        Err(TransactionError::invalid_state(format!(
            "state of {} kept changing while transitioning to {}",
            dtid, to
        )))
    }

    /// Returns the record of `dtid`, or `None` if it never existed or was concluded.
    pub fn read_transaction(
        &self,
        dtid: &Dtid,
    ) -> Result<Option<TransactionMetadata>, TransactionError> {
        let state = match self.backend.get(Table::TransactionState, dtid.as_str())? {
            Some(state) => state,
            None => return Ok(None),
        };
        // Both rows are deleted together, so a missing participants row means the transaction
        // was concluded between the two reads.
        let participants = match self.backend.get(Table::Participants, dtid.as_str())? {
            Some(participants) => participants,
            None => return Ok(None),
        };

        Ok(Some(assemble(dtid.clone(), &state, &participants)?))
    }

    /// Removes the record of `dtid`. Concluding an unknown dtid succeeds.
    pub fn conclude_transaction(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        self.backend.write(
            WriteBatch::new()
                .delete(Table::TransactionState, dtid.as_str())
                .delete(Table::Participants, dtid.as_str()),
        )?;
        debug!("concluded distributed transaction {}", dtid);
        Ok(())
    }

    /// Returns every record, regardless of age, ordered by creation time.
    pub fn transactions(&self) -> Result<Vec<TransactionMetadata>, TransactionError> {
        let mut transactions = self.scan(|_| true)?;
        transactions.sort_by(|a, b| {
            a.time_created
                .cmp(&b.time_created)
                .then_with(|| a.dtid.cmp(&b.dtid))
        });
        Ok(transactions)
    }

    /// Returns the records older than the abandon age.
    ///
    /// Decided records (COMMIT or ROLLBACK) come first since they block participants from
    /// finishing; undecided (PREPARE) records follow. Within each group records are ordered by
    /// creation time.
    pub fn unresolved_transactions(&self) -> Result<Vec<TransactionMetadata>, TransactionError> {
        self.unresolved_transactions_older_than(self.abandon_age)
    }

    pub fn unresolved_transactions_older_than(
        &self,
        abandon_age: Duration,
    ) -> Result<Vec<TransactionMetadata>, TransactionError> {
        let now = self.time_source.now();
        let mut unresolved = self.scan(|row| {
            time::age(now, time::from_unix_nanos(row.time_created)) > abandon_age
        })?;
        unresolved.sort_by_key(|metadata| {
            (
                !metadata.state.is_decided(),
                metadata.time_created,
                metadata.dtid.clone(),
            )
        });
        Ok(unresolved)
    }

    // Records which can not be read, or which disappear mid-scan, are skipped.
    fn scan<F>(&self, filter: F) -> Result<Vec<TransactionMetadata>, TransactionError>
    where
        F: Fn(&StateRow) -> bool,
    {
        let mut found = Vec::new();
        for (key, state) in self.backend.scan(Table::TransactionState, "")? {
            let dtid = Dtid::new(key);
            let row: StateRow = match codec::decode(&state) {
                Ok(row) => row,
                Err(err) => {
                    warn!("skipping unreadable state of {}: {}", dtid, err);
                    continue;
                }
            };
            if !filter(&row) {
                continue;
            }

            match self.backend.get(Table::Participants, dtid.as_str()) {
                Ok(Some(participants)) => match codec::decode(&participants) {
                    Ok(participants) => found.push(TransactionMetadata {
                        dtid,
                        state: row.state,
                        time_created: time::from_unix_nanos(row.time_created),
                        participants,
                    }),
                    Err(err) => warn!("skipping unreadable participants of {}: {}", dtid, err),
                },
                Ok(None) => debug!("{} was concluded during scan", dtid),
                Err(err) => warn!("unable to read participants of {}: {}", dtid, err),
            }
        }
        Ok(found)
    }
}

fn assemble(
    dtid: Dtid,
    state: &[u8],
    participants: &[u8],
) -> Result<TransactionMetadata, StorageError> {
    let row: StateRow = codec::decode(state)?;
    Ok(TransactionMetadata {
        dtid,
        state: row.state,
        time_created: time::from_unix_nanos(row.time_created),
        participants: codec::decode(participants)?,
    })
}
