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

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::TransactionError;
use crate::ids::{CallerId, TxId};
use crate::storage::{data_key, data_prefix, StorageBackend, Table};

use super::{Row, RowImage, Statement, TransactionInfo, TxOptions, WriteSet};

/// Why an active transaction stopped accepting statements.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum EndReason {
    Committed,
    RolledBack,
    Prepared,
    TimedOut,
    Transition,
}

struct Writes {
    statements: Vec<Statement>,
    // Uncommitted row images keyed by data key; `None` marks a delete.
    pending: BTreeMap<String, Option<Vec<u8>>>,
    // Committed images of the written rows, as first read.
    reads: BTreeMap<String, Option<Vec<u8>>>,
    ended: Option<EndReason>,
}

/// A local transaction between Begin and its end.
pub(crate) struct ActiveTransaction {
    id: TxId,
    caller: CallerId,
    options: TxOptions,
    started: Instant,
    timeout: Duration,
    deadline: Instant,
    writes: Mutex<Writes>,
    end: watch::Sender<Option<EndReason>>,
}

impl ActiveTransaction {
    pub fn new(id: TxId, caller: CallerId, options: TxOptions, timeout: Duration) -> Self {
        let started = Instant::now();
        let (end, _) = watch::channel(None);
        ActiveTransaction {
            id,
            caller,
            options,
            started,
            timeout,
            deadline: started + timeout,
            writes: Mutex::new(Writes {
                statements: Vec::new(),
                pending: BTreeMap::new(),
                reads: BTreeMap::new(),
                ended: None,
            }),
            end,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn caller(&self) -> &CallerId {
        &self.caller
    }

    /// Time since Begin.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Stops the transaction and returns the writes it recorded.
    ///
    /// Only the first end takes effect; later calls fail with the error matching the first
    /// reason.
    pub fn end(&self, reason: EndReason) -> Result<WriteSet, TransactionError> {
        let mut writes = self.writes.lock();
        if let Some(ended) = writes.ended {
            return Err(self.ended_error(ended));
        }
        writes.ended = Some(reason);
        self.end.send_replace(Some(reason));
        Ok(WriteSet {
            statements: writes.statements.clone(),
            reads: writes
                .reads
                .iter()
                .map(|(key, value)| RowImage {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        })
    }

    /// Reverses a [`EndReason::Committed`] or [`EndReason::Prepared`] end after its writes
    /// could not be made durable.
    pub fn reopen(&self) {
        let mut writes = self.writes.lock();
        if matches!(
            writes.ended,
            Some(EndReason::Committed) | Some(EndReason::Prepared)
        ) {
            writes.ended = None;
            self.end.send_replace(None);
        }
    }

    /// Resolves once the transaction has ended, with the reason.
    pub fn ended(&self) -> impl Future<Output = Option<EndReason>> + Send + 'static {
        let mut end = self.end.subscribe();
        async move { end.wait_for(Option::is_some).await.ok().and_then(|reason| *reason) }
    }

    pub fn ended_error(&self, reason: EndReason) -> TransactionError {
        match reason {
            EndReason::TimedOut => TransactionError::DeadlineExceeded(format!(
                "transaction {} exceeded its {:?} timeout",
                self.id, self.timeout
            )),
            EndReason::Transition => TransactionError::DeadlineExceeded(format!(
                "transaction {} was rolled back by a serving role transition",
                self.id
            )),
            EndReason::Prepared => {
                TransactionError::invalid_state(format!("transaction {} is prepared", self.id))
            }
            EndReason::Committed | EndReason::RolledBack => {
                TransactionError::NotFound(format!("transaction {}", self.id))
            }
        }
    }

    /// Records a write, returning the number of rows it affects.
    ///
    /// The committed image of each row is remembered the first time the row is written, so
    /// the commit can check that nobody changed it in the meantime.
    pub fn write(
        &self,
        backend: &dyn StorageBackend,
        statement: Statement,
    ) -> Result<u64, TransactionError> {
        let mut writes = self.writes.lock();
        if let Some(reason) = writes.ended {
            return Err(self.ended_error(reason));
        }

        let (table, key) = match &statement {
            Statement::Insert { table, key, .. }
            | Statement::Update { table, key, .. }
            | Statement::Delete { table, key } => (table, data_key(table, key)),
            Statement::Select { .. } | Statement::Sleep { .. } => {
                return Err(TransactionError::invalid_state("statement is not a write"))
            }
        };

        if let Some(owner) = backend.get(Table::RowLock, &key)? {
            return Err(TransactionError::RowLocked(format!(
                "{} is claimed by prepared transaction {}",
                key,
                String::from_utf8_lossy(&owner)
            )));
        }

        let (visible, committed) = match writes.pending.get(&key) {
            Some(image) => (image.is_some(), None),
            None => {
                let committed = backend.get(Table::Data, &key)?;
                (committed.is_some(), Some(committed))
            }
        };

        let image = match &statement {
            Statement::Insert { .. } if visible => {
                return Err(TransactionError::ConstraintViolation(format!(
                    "{} for key {}",
                    table, key
                )))
            }
            Statement::Update { .. } | Statement::Delete { .. } if !visible => return Ok(0),
            Statement::Insert { value, .. } | Statement::Update { value, .. } => {
                Some(value.clone())
            }
            Statement::Delete { .. } | Statement::Select { .. } | Statement::Sleep { .. } => None,
        };

        if let Some(committed) = committed {
            writes.reads.insert(key.clone(), committed);
        }
        writes.pending.insert(key, image);
        writes.statements.push(statement);
        Ok(1)
    }

    /// Reads a table as this transaction sees it: committed rows overlaid with its own writes.
    pub fn select(
        &self,
        backend: &dyn StorageBackend,
        table: &str,
    ) -> Result<Vec<Row>, TransactionError> {
        let writes = self.writes.lock();
        if let Some(reason) = writes.ended {
            return Err(self.ended_error(reason));
        }

        let prefix = data_prefix(table);
        let mut rows: BTreeMap<String, Vec<u8>> =
            backend.scan(Table::Data, &prefix)?.into_iter().collect();
        for (key, image) in writes.pending.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            match image {
                Some(value) => rows.insert(key.clone(), value.clone()),
                None => rows.remove(key),
            };
        }

        Ok(rows
            .into_iter()
            .map(|(key, value)| Row {
                key: key[prefix.len()..].to_string(),
                value,
            })
            .collect())
    }

    /// Fails if the transaction has ended.
    pub fn check_open(&self) -> Result<(), TransactionError> {
        match self.writes.lock().ended {
            Some(reason) => Err(self.ended_error(reason)),
            None => Ok(()),
        }
    }

    pub fn info(&self, now: Instant) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            caller: self.caller.clone(),
            workload: self.options.workload,
            isolation: self.options.isolation,
            age: now.saturating_duration_since(self.started),
            statements: self.writes.lock().statements.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{MemoryBackend, WriteBatch};

    use super::*;

    fn transaction() -> ActiveTransaction {
        ActiveTransaction::new(
            TxId(1),
            "dev".into(),
            TxOptions::default(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn reads_see_own_writes() {
        let backend = MemoryBackend::new();
        backend
            .write(
                WriteBatch::new()
                    .put(Table::Data, "t1/1", b"a".to_vec())
                    .put(Table::Data, "t1/2", b"b".to_vec()),
            )
            .unwrap();
        let tx = transaction();

        assert_eq!(
            tx.write(&backend, Statement::update("t1", "1", b"A".to_vec()))
                .unwrap(),
            1
        );
        assert_eq!(tx.write(&backend, Statement::delete("t1", "2")).unwrap(), 1);
        assert_eq!(
            tx.write(&backend, Statement::insert("t1", "3", b"c".to_vec()))
                .unwrap(),
            1
        );

        let rows = tx.select(&backend, "t1").unwrap();
        assert_eq!(
            rows,
            vec![
                Row {
                    key: "1".into(),
                    value: b"A".to_vec()
                },
                Row {
                    key: "3".into(),
                    value: b"c".to_vec()
                },
            ]
        );
        // Nothing is visible outside the transaction until commit.
        assert_eq!(backend.get(Table::Data, "t1/1").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn insert_of_visible_key_is_rejected() {
        let backend = MemoryBackend::new();
        let tx = transaction();
        tx.write(&backend, Statement::insert("t1", "1", b"a".to_vec()))
            .unwrap();

        assert!(matches!(
            tx.write(&backend, Statement::insert("t1", "1", b"b".to_vec())),
            Err(TransactionError::ConstraintViolation(_))
        ));

        tx.write(&backend, Statement::delete("t1", "1")).unwrap();
        tx.write(&backend, Statement::insert("t1", "1", b"b".to_vec()))
            .unwrap();
        assert_eq!(tx.end(EndReason::Committed).unwrap().statements.len(), 3);
    }

    /// Test that each written row keeps the committed image it was first based on.
    #[test]
    fn first_read_of_each_written_row_is_kept() {
        let backend = MemoryBackend::new();
        backend
            .write(WriteBatch::new().put(Table::Data, "t1/1", b"a".to_vec()))
            .unwrap();
        let tx = transaction();

        tx.write(&backend, Statement::update("t1", "1", b"b".to_vec()))
            .unwrap();
        tx.write(&backend, Statement::update("t1", "1", b"c".to_vec()))
            .unwrap();
        tx.write(&backend, Statement::insert("t1", "2", b"d".to_vec()))
            .unwrap();

        let writes = tx.end(EndReason::Committed).unwrap();
        assert_eq!(
            writes.reads,
            vec![
                RowImage {
                    key: "t1/1".into(),
                    value: Some(b"a".to_vec()),
                },
                RowImage {
                    key: "t1/2".into(),
                    value: None,
                },
            ]
        );
    }

    #[test]
    fn writes_to_claimed_rows_are_refused() {
        let backend = MemoryBackend::new();
        backend
            .write(WriteBatch::new().put(Table::RowLock, "t1/1", b"aa".to_vec()))
            .unwrap();
        let tx = transaction();

        let err = tx
            .write(&backend, Statement::insert("t1", "1", b"a".to_vec()))
            .unwrap_err();
        assert!(matches!(err, TransactionError::RowLocked(_)));
        assert!(err.to_string().contains("aa"));
        assert!(err.is_retryable());

        tx.write(&backend, Statement::insert("t1", "2", b"b".to_vec()))
            .unwrap();
        assert_eq!(tx.end(EndReason::Committed).unwrap().statements.len(), 1);
    }

    /// Test that writes to missing rows affect nothing and are not recorded.
    #[test]
    fn writes_to_missing_rows_are_not_recorded() {
        let backend = MemoryBackend::new();
        let tx = transaction();

        assert_eq!(
            tx.write(&backend, Statement::update("t1", "1", b"a".to_vec()))
                .unwrap(),
            0
        );
        assert_eq!(tx.write(&backend, Statement::delete("t1", "1")).unwrap(), 0);
        assert!(tx.end(EndReason::Committed).unwrap().is_empty());
    }

    #[test]
    fn only_first_end_counts() {
        let backend = MemoryBackend::new();
        let tx = transaction();
        tx.end(EndReason::TimedOut).unwrap();

        assert!(matches!(
            tx.end(EndReason::Committed),
            Err(TransactionError::DeadlineExceeded(_))
        ));
        assert!(matches!(
            tx.write(&backend, Statement::insert("t1", "1", b"a".to_vec())),
            Err(TransactionError::DeadlineExceeded(_))
        ));
    }

    #[tokio::test]
    async fn ended_resolves_with_reason() {
        let tx = transaction();
        let ended = tx.ended();

        tx.end(EndReason::Prepared).unwrap();
        assert_eq!(ended.await, Some(EndReason::Prepared));

        tx.reopen();
        assert!(tx.check_open().is_ok());
        tx.end(EndReason::RolledBack).unwrap();
        assert_eq!(tx.ended().await, Some(EndReason::RolledBack));

        // A rolled back transaction stays ended.
        tx.reopen();
        assert!(tx.check_open().is_err());
    }
}
