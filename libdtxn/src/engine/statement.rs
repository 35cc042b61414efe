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

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TransactionError;
use crate::ids::Dtid;
use crate::storage::codec;
use crate::storage::{data_key, Mutation, Precondition, StorageError, Table};

/// A statement run inside a local transaction.
///
/// Values are bound at execution time, so a recorded write can be replayed verbatim.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statement {
    Insert {
        table: String,
        key: String,
        #[serde(with = "codec::hex_bytes")]
        value: Vec<u8>,
    },
    Update {
        table: String,
        key: String,
        #[serde(with = "codec::hex_bytes")]
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: String,
    },
    /// Reads every row of a table.
    Select {
        table: String,
    },
    /// Holds the transaction open; used for long-running and diagnostic queries.
    Sleep {
        duration: Duration,
    },
}

impl Statement {
    pub fn insert(table: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Statement::Insert {
            table: table.into(),
            key: key.into(),
            value,
        }
    }

    pub fn update(table: impl Into<String>, key: impl Into<String>, value: Vec<u8>) -> Self {
        Statement::Update {
            table: table.into(),
            key: key.into(),
            value,
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Statement::Delete {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn select(table: impl Into<String>) -> Self {
        Statement::Select {
            table: table.into(),
        }
    }

    pub fn sleep(duration: Duration) -> Self {
        Statement::Sleep { duration }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. }
        )
    }

    /// The storage mutation this statement applies on commit, if it is a write.
    pub fn mutation(&self) -> Option<Mutation> {
        match self {
            Statement::Insert { table, key, value } | Statement::Update { table, key, value } => {
                Some(Mutation::Put {
                    table: Table::Data,
                    key: data_key(table, key),
                    value: value.clone(),
                })
            }
            Statement::Delete { table, key } => Some(Mutation::Delete {
                table: Table::Data,
                key: data_key(table, key),
            }),
            Statement::Select { .. } | Statement::Sleep { .. } => None,
        }
    }
}

/// Converts a recorded statement list into storage mutations, or `None` if any statement can
/// not be replayed as a write.
pub(crate) fn mutations(statements: &[Statement]) -> Option<Vec<Mutation>> {
    statements.iter().map(Statement::mutation).collect()
}

/// The committed image of a row at the time a transaction first wrote it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RowImage {
    /// Data key of the row.
    pub key: String,
    /// `None` if the row did not exist.
    #[serde(with = "codec::hex_opt_bytes")]
    pub value: Option<Vec<u8>>,
}

impl RowImage {
    /// Holds while the committed row still matches this image.
    pub(crate) fn unchanged(&self) -> Precondition {
        match &self.value {
            Some(value) => Precondition::Equals {
                table: Table::Data,
                key: self.key.clone(),
                value: value.clone(),
            },
            None => Precondition::Absent {
                table: Table::Data,
                key: self.key.clone(),
            },
        }
    }

    /// Holds while no prepared transaction claims the row.
    pub(crate) fn unclaimed(&self) -> Precondition {
        Precondition::Absent {
            table: Table::RowLock,
            key: self.key.clone(),
        }
    }

    pub(crate) fn claim(&self, dtid: &Dtid) -> Mutation {
        Mutation::Put {
            table: Table::RowLock,
            key: self.key.clone(),
            value: dtid.as_str().as_bytes().to_vec(),
        }
    }

    pub(crate) fn release(&self) -> Mutation {
        Mutation::Delete {
            table: Table::RowLock,
            key: self.key.clone(),
        }
    }
}

/// The writes of an ended transaction, with the committed images they were based on.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WriteSet {
    pub statements: Vec<Statement>,
    /// One image per written row, ordered by key.
    pub reads: Vec<RowImage>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub(crate) fn mutations(&self) -> Option<Vec<Mutation>> {
        mutations(&self.statements)
    }

    /// Conditions for applying the writes directly: every written row is unchanged since it
    /// was read and no prepared transaction claims it.
    pub(crate) fn preconditions(&self) -> Vec<Precondition> {
        self.reads
            .iter()
            .flat_map(|image| [image.unchanged(), image.unclaimed()])
            .collect()
    }

    /// Maps the rejection of a write built from [`preconditions`](Self::preconditions).
    pub(crate) fn conflict(&self, err: StorageError) -> TransactionError {
        write_conflict(&self.reads, err)
    }
}

pub(crate) fn write_conflict(reads: &[RowImage], err: StorageError) -> TransactionError {
    match err {
        StorageError::PreconditionFailed {
            table: Table::RowLock,
            key,
        } => TransactionError::RowLocked(format!(
            "{} is claimed by a prepared transaction",
            key
        )),
        StorageError::PreconditionFailed {
            table: Table::Data,
            key,
        } => {
            let inserted = reads
                .iter()
                .any(|image| image.key == key && image.value.is_none());
            if inserted {
                TransactionError::ConstraintViolation(format!(
                    "key {} was inserted concurrently",
                    key
                ))
            } else {
                TransactionError::WriteConflict(format!("{} changed after it was read", key))
            }
        }
        err => err.into(),
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Row {
    pub key: String,
    pub value: Vec<u8>,
}

/// The result of executing one statement.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueryResult {
    pub rows_affected: u64,
    pub rows: Vec<Row>,
}
