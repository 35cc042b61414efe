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

//! Durable storage for local rows, redo entries and distributed transaction metadata.
//!
//! A [`StorageBackend`] exposes a handful of logical tables of string-keyed rows. Every write is
//! expressed as a [`WriteBatch`]: a set of row preconditions followed by a list of mutations. A
//! backend applies a batch atomically, all of it or none of it, and only when every precondition
//! holds. Single-row compare-and-set and insert-if-absent are built from preconditions, which is
//! all the coordination bookkeeping needs; no lock is ever held across rows of unrelated dtids.

pub(crate) mod codec;
#[cfg(feature = "file-store")]
mod file;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

#[cfg(feature = "file-store")]
pub use file::FileBackend;
pub use memory::MemoryBackend;

/// The logical tables kept by a backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Table {
    /// Committed local rows, keyed by `<table>/<key>`.
    Data,
    /// Decision state and creation time of distributed transactions, keyed by dtid.
    TransactionState,
    /// Immutable participant lists, keyed by dtid.
    Participants,
    /// Redo entries of prepared local transactions, keyed by dtid.
    Redo,
    /// Data rows claimed by a prepared transaction, keyed like [`Table::Data`]; the value is
    /// the owning dtid.
    RowLock,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Table::Data => f.write_str("data"),
            Table::TransactionState => f.write_str("dt_state"),
            Table::Participants => f.write_str("dt_participant"),
            Table::Redo => f.write_str("redo_state"),
            Table::RowLock => f.write_str("row_lock"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put {
        table: Table,
        key: String,
        #[serde(with = "codec::hex_bytes")]
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: String,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Precondition {
    /// The row must not exist.
    Absent { table: Table, key: String },
    /// The row must exist, with any value.
    Present { table: Table, key: String },
    /// The row must exist with exactly this value.
    Equals {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
}

/// An atomic unit of writes.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    preconditions: Vec<Precondition>,
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn require_absent(mut self, table: Table, key: impl Into<String>) -> Self {
        self.preconditions.push(Precondition::Absent {
            table,
            key: key.into(),
        });
        self
    }

    pub fn require_present(mut self, table: Table, key: impl Into<String>) -> Self {
        self.preconditions.push(Precondition::Present {
            table,
            key: key.into(),
        });
        self
    }

    pub fn require_equals(mut self, table: Table, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.preconditions.push(Precondition::Equals {
            table,
            key: key.into(),
            value,
        });
        self
    }

    pub fn require(mut self, preconditions: impl IntoIterator<Item = Precondition>) -> Self {
        self.preconditions.extend(preconditions);
        self
    }

    pub fn put(mut self, table: Table, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.mutations.push(Mutation::Put {
            table,
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(mut self, table: Table, key: impl Into<String>) -> Self {
        self.mutations.push(Mutation::Delete {
            table,
            key: key.into(),
        });
        self
    }

    pub fn extend(mut self, mutations: impl IntoIterator<Item = Mutation>) -> Self {
        self.mutations.extend(mutations);
        self
    }

    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt storage: {0}")]
    Corruption(String),

    #[error("unable to encode or decode row: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("precondition failed on {table} row {key}")]
    PreconditionFailed { table: Table, key: String },
}

/// A durable row store applying [`WriteBatch`]es atomically.
pub trait StorageBackend: Send + Sync {
    /// Returns the current value of a row.
    fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns every row of `table` whose key starts with `prefix`, ordered by key.
    fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Applies a batch atomically.
    ///
    /// # Errors
    ///
    /// [`StorageError::PreconditionFailed`] is returned, and nothing is written, if any
    /// precondition does not hold.
    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// The in-memory image of every table, shared by the backend implementations.
#[derive(Default, Debug)]
pub(crate) struct TableSet {
    tables: BTreeMap<Table, BTreeMap<String, Vec<u8>>>,
}

impl TableSet {
    pub fn get(&self, table: Table, key: &str) -> Option<&Vec<u8>> {
        self.tables.get(&table).and_then(|rows| rows.get(key))
    }

    pub fn scan(&self, table: Table, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.tables
            .get(&table)
            .map(|rows| {
                rows.range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn check(&self, preconditions: &[Precondition]) -> Result<(), StorageError> {
        for precondition in preconditions {
            let (table, key, holds) = match precondition {
                Precondition::Absent { table, key } => (table, key, self.get(*table, key).is_none()),
                Precondition::Present { table, key } => {
                    (table, key, self.get(*table, key).is_some())
                }
                Precondition::Equals { table, key, value } => {
                    (table, key, self.get(*table, key) == Some(value))
                }
            };
            if !holds {
                return Err(StorageError::PreconditionFailed {
                    table: *table,
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn apply(&mut self, mutations: impl IntoIterator<Item = Mutation>) {
        for mutation in mutations {
            match mutation {
                Mutation::Put { table, key, value } => {
                    self.tables.entry(table).or_default().insert(key, value);
                }
                Mutation::Delete { table, key } => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = (Table, &String, &Vec<u8>)> {
        self.tables
            .iter()
            .flat_map(|(table, rows)| rows.iter().map(move |(key, value)| (*table, key, value)))
    }
}

/// Key of a local data row.
pub(crate) fn data_key(table: &str, key: &str) -> String {
    format!("{}/{}", table, key)
}

/// Prefix under which every row of a local table is stored.
pub(crate) fn data_prefix(table: &str) -> String {
    format!("{}/", table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_respects_prefix_boundaries() {
        let mut tables = TableSet::default();
        tables.apply(vec![
            Mutation::Put {
                table: Table::Data,
                key: data_key("t1", "a"),
                value: b"1".to_vec(),
            },
            Mutation::Put {
                table: Table::Data,
                key: data_key("t10", "a"),
                value: b"2".to_vec(),
            },
            Mutation::Put {
                table: Table::Data,
                key: data_key("t1", "b"),
                value: b"3".to_vec(),
            },
        ]);

        let rows = tables.scan(Table::Data, &data_prefix("t1"));
        assert_eq!(
            rows,
            vec![
                ("t1/a".to_string(), b"1".to_vec()),
                ("t1/b".to_string(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn check_reports_first_failed_precondition() {
        let mut tables = TableSet::default();
        tables.apply(vec![Mutation::Put {
            table: Table::Redo,
            key: "aa".into(),
            value: b"x".to_vec(),
        }]);

        assert!(tables
            .check(&[Precondition::Present {
                table: Table::Redo,
                key: "aa".into(),
            }])
            .is_ok());

        match tables.check(&[Precondition::Absent {
            table: Table::Redo,
            key: "aa".into(),
        }]) {
            Err(StorageError::PreconditionFailed { table, key }) => {
                assert_eq!(table, Table::Redo);
                assert_eq!(key, "aa");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert!(tables
            .check(&[Precondition::Equals {
                table: Table::Redo,
                key: "aa".into(),
                value: b"y".to_vec(),
            }])
            .is_err());
    }
}
