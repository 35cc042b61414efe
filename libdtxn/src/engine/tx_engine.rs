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
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{Config, WorkloadTimeouts};
use crate::error::TransactionError;
use crate::ids::{CallerId, TxId};
use crate::stats::{Outcome, TransactionStats};
use crate::storage::{StorageBackend, WriteBatch};
use crate::target::ServingRole;
use crate::two_phase_commit::ResurrectReport;

use super::transaction::{ActiveTransaction, EndReason};
use super::{QueryResult, Statement, TransactionInfo, TxOptions, WriteSet};

/// What a serving role change did to the local transactions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransitionReport {
    pub from: ServingRole,
    pub to: ServingRole,
    /// True if every transaction finished within the grace period.
    pub drained: bool,
    /// Transactions the watchdog rolled back once the grace period ran out.
    pub rolled_back: usize,
    pub elapsed: Duration,
    /// Set when the node became primary and reloaded its prepared transactions.
    pub resurrected: Option<ResurrectReport>,
}

/// The node's local transaction engine.
///
/// Tracks every active local transaction, enforces the per-workload timeouts and runs the
/// grace-period watchdog on serving role changes. Prepared transactions are not tracked here;
/// once prepared they belong to the redo log.
pub struct TxEngine {
    backend: Arc<dyn StorageBackend>,
    timeouts: WorkloadTimeouts,
    demote_grace: Duration,
    promote_grace: Duration,
    role: RwLock<ServingRole>,
    draining: AtomicBool,
    active: Mutex<HashMap<TxId, Arc<ActiveTransaction>>>,
    active_count: watch::Sender<usize>,
    next_id: AtomicU64,
    transition: tokio::sync::Mutex<()>,
    stats: Arc<TransactionStats>,
}

impl TxEngine {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: &Config,
        stats: Arc<TransactionStats>,
    ) -> Self {
        let (active_count, _) = watch::channel(0);
        TxEngine {
            backend,
            timeouts: config.tx_timeouts(),
            demote_grace: config.demote_grace_period(),
            promote_grace: config.promote_grace_period(),
            role: RwLock::new(config.initial_role()),
            draining: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
            active_count,
            next_id: AtomicU64::new(1),
            transition: tokio::sync::Mutex::new(()),
            stats,
        }
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub fn role(&self) -> ServingRole {
        *self.role.read()
    }

    pub fn require_primary(&self, operation: &'static str) -> Result<(), TransactionError> {
        match self.role() {
            ServingRole::Primary => Ok(()),
            role => Err(TransactionError::NotServing { role, operation }),
        }
    }

    /// Starts a transaction bound to the timeout of its workload class.
    pub fn begin(&self, caller: CallerId, options: TxOptions) -> Result<TxId, TransactionError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(TransactionError::NotServing {
                role: self.role(),
                operation: "begin",
            });
        }

        let id = TxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timeout = self.timeouts.for_workload(options.workload);
        let tx = Arc::new(ActiveTransaction::new(id, caller, options, timeout));

        let mut active = self.active.lock();
        active.insert(id, tx);
        self.active_count.send_replace(active.len());

        debug!(
            "began transaction {} ({}, timeout {:?})",
            id, options.workload, timeout
        );
        Ok(id)
    }

    /// Runs one statement.
    ///
    /// The statement is abandoned, and the transaction rolled back, if the transaction's
    /// deadline passes or the transaction is ended by the watchdog while it runs.
    pub async fn execute(
        &self,
        tx_id: TxId,
        statement: Statement,
    ) -> Result<QueryResult, TransactionError> {
        let tx = self.get(tx_id)?;
        if statement.is_write() {
            self.require_primary("execute")?;
        }

        let ended = tx.ended();
        tokio::select! {
            biased;
            reason = ended => {
                Err(tx.ended_error(reason.unwrap_or(EndReason::RolledBack)))
            }
            _ = tokio::time::sleep_until(tx.deadline()) => {
                self.expire(&tx);
                Err(tx.ended_error(EndReason::TimedOut))
            }
            result = self.run(&tx, statement) => result,
        }
    }

    async fn run(
        &self,
        tx: &ActiveTransaction,
        statement: Statement,
    ) -> Result<QueryResult, TransactionError> {
        match statement {
            Statement::Sleep { duration } => {
                tokio::time::sleep(duration).await;
                tx.check_open()?;
                Ok(QueryResult::default())
            }
            Statement::Select { table } => {
                let rows = tx.select(self.backend.as_ref(), &table)?;
                Ok(QueryResult {
                    rows_affected: 0,
                    rows,
                })
            }
            write => Ok(QueryResult {
                rows_affected: tx.write(self.backend.as_ref(), write)?,
                rows: Vec::new(),
            }),
        }
    }

    /// Applies every write of the transaction in one atomic batch.
    ///
    /// The batch only applies while every written row still holds the committed image the
    /// transaction read and no prepared transaction claims it. If the commit fails with a
    /// retryable error the transaction stays active, so it can be committed again or rolled
    /// back; any other failure rolls it back.
    pub fn commit(&self, tx_id: TxId) -> Result<(), TransactionError> {
        let tx = self.remove(tx_id)?;
        let writes = self.finish(&tx, EndReason::Committed)?;
        if writes.is_empty() {
            self.record(&tx, Outcome::Commit);
            debug!("committed read-only transaction {}", tx_id);
            return Ok(());
        }

        match self
            .require_primary("commit")
            .and_then(|_| self.apply(tx_id, &writes))
        {
            Ok(()) => {
                self.record(&tx, Outcome::Commit);
                debug!(
                    "committed transaction {} with {} writes",
                    tx_id,
                    writes.statements.len()
                );
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                debug!("commit of transaction {} failed, kept active: {}", tx_id, err);
                self.reattach(tx);
                Err(err)
            }
            Err(err) => {
                self.record(&tx, Outcome::Rollback);
                debug!("commit of transaction {} failed, rolled back: {}", tx_id, err);
                Err(err)
            }
        }
    }

    fn apply(&self, tx_id: TxId, writes: &WriteSet) -> Result<(), TransactionError> {
        let mutations = writes.mutations().ok_or_else(|| {
            TransactionError::Internal(format!("transaction {} recorded a non-write", tx_id))
        })?;
        let batch = WriteBatch::new()
            .require(writes.preconditions())
            .extend(mutations);
        self.backend
            .write(batch)
            .map_err(|err| writes.conflict(err))
    }

    pub fn rollback(&self, tx_id: TxId) -> Result<(), TransactionError> {
        let tx = self.remove(tx_id)?;
        match tx.end(EndReason::RolledBack) {
            Ok(_) => self.record(&tx, Outcome::Rollback),
            Err(err) => debug!("transaction {} already ended: {}", tx_id, err),
        }
        debug!("rolled back transaction {}", tx_id);
        Ok(())
    }

    /// Takes the transaction out of the engine so it can be prepared, returning its writes.
    pub(crate) fn detach(
        &self,
        tx_id: TxId,
        operation: &'static str,
    ) -> Result<(Arc<ActiveTransaction>, WriteSet), TransactionError> {
        self.require_primary(operation)?;
        let tx = self.remove(tx_id)?;
        let writes = self.finish(&tx, EndReason::Prepared)?;
        Ok((tx, writes))
    }

    /// Counts the end of a transaction.
    pub(crate) fn record(&self, tx: &ActiveTransaction, outcome: Outcome) {
        self.stats.record(tx.caller(), outcome, tx.age());
    }

    /// Returns a detached transaction to the engine after its prepare failed.
    pub(crate) fn reattach(&self, tx: Arc<ActiveTransaction>) {
        tx.reopen();
        let mut active = self.active.lock();
        active.insert(tx.id(), tx);
        self.active_count.send_replace(active.len());
    }

    /// Rolls back every transaction past its deadline, returning how many were killed.
    pub fn kill_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<ActiveTransaction>> = {
            let mut active = self.active.lock();
            let ids: Vec<TxId> = active
                .values()
                .filter(|tx| tx.is_expired(now))
                .map(|tx| tx.id())
                .collect();
            let expired = ids.iter().filter_map(|id| active.remove(id)).collect();
            self.active_count.send_replace(active.len());
            expired
        };

        let mut killed = 0;
        for tx in expired {
            if tx.end(EndReason::TimedOut).is_ok() {
                warn!("killed transaction {} after its deadline", tx.id());
                self.record(&tx, Outcome::Kill);
                killed += 1;
            }
        }
        killed
    }

    /// Lists the active transactions, ordered by id.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        let now = Instant::now();
        let mut transactions: Vec<TransactionInfo> = self
            .active
            .lock()
            .values()
            .map(|tx| tx.info(now))
            .collect();
        transactions.sort_by_key(|info| info.id);
        transactions
    }

    pub fn active_count(&self) -> usize {
        *self.active_count.borrow()
    }

    /// Moves the node to a new serving role.
    ///
    /// New transactions are refused while in-flight ones get the grace period of the
    /// transition (demote grace when leaving PRIMARY, promote grace otherwise) to finish. Once
    /// it runs out the remaining ones are rolled back and any statement they are running fails.
    pub async fn set_serving_role(&self, to: ServingRole) -> TransitionReport {
        let _transition = self.transition.lock().await;
        let started = Instant::now();
        let from = self.role();

        if from == to {
            return TransitionReport {
                from,
                to,
                drained: true,
                rolled_back: 0,
                elapsed: Duration::ZERO,
                resurrected: None,
            };
        }

        let grace = if to == ServingRole::Primary {
            self.promote_grace
        } else {
            self.demote_grace
        };

        self.draining.store(true, Ordering::Release);
        let drained = self.drain(grace).await;
        let rolled_back = if drained {
            0
        } else {
            self.cancel_all(EndReason::Transition)
        };
        *self.role.write() = to;
        self.draining.store(false, Ordering::Release);

        let elapsed = started.elapsed();
        info!(
            "serving role changed from {} to {} in {:?} ({} transactions rolled back)",
            from, to, elapsed, rolled_back
        );

        TransitionReport {
            from,
            to,
            drained,
            rolled_back,
            elapsed,
            resurrected: None,
        }
    }

    async fn drain(&self, grace: Duration) -> bool {
        let mut count = self.active_count.subscribe();
        let drained = tokio::time::timeout(grace, count.wait_for(|active| *active == 0)).await;
        matches!(drained, Ok(Ok(_)))
    }

    fn cancel_all(&self, reason: EndReason) -> usize {
        let cancelled: Vec<Arc<ActiveTransaction>> = {
            let mut active = self.active.lock();
            let cancelled = active.drain().map(|(_, tx)| tx).collect();
            self.active_count.send_replace(0);
            cancelled
        };

        let mut rolled_back = 0;
        for tx in cancelled {
            if tx.end(reason).is_ok() {
                warn!("rolled back transaction {} after grace period", tx.id());
                self.record(&tx, Outcome::Kill);
                rolled_back += 1;
            }
        }
        rolled_back
    }

    fn get(&self, tx_id: TxId) -> Result<Arc<ActiveTransaction>, TransactionError> {
        self.active
            .lock()
            .get(&tx_id)
            .cloned()
            .ok_or_else(|| TransactionError::NotFound(format!("transaction {}", tx_id)))
    }

    fn remove(&self, tx_id: TxId) -> Result<Arc<ActiveTransaction>, TransactionError> {
        let mut active = self.active.lock();
        let tx = active
            .remove(&tx_id)
            .ok_or_else(|| TransactionError::NotFound(format!("transaction {}", tx_id)))?;
        self.active_count.send_replace(active.len());
        Ok(tx)
    }

    // Ends a transaction already removed from the active set, honoring its deadline.
    fn finish(
        &self,
        tx: &ActiveTransaction,
        reason: EndReason,
    ) -> Result<WriteSet, TransactionError> {
        if tx.is_expired(Instant::now()) {
            tx.end(EndReason::TimedOut)?;
            self.record(tx, Outcome::Kill);
            return Err(tx.ended_error(EndReason::TimedOut));
        }
        tx.end(reason)
    }

    fn expire(&self, tx: &ActiveTransaction) {
        {
            let mut active = self.active.lock();
            if active.remove(&tx.id()).is_some() {
                self.active_count.send_replace(active.len());
            }
        }
        if tx.end(EndReason::TimedOut).is_ok() {
            warn!("transaction {} timed out during a statement", tx.id());
            self.record(tx, Outcome::Kill);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use std::io;

    use crate::config::ConfigBuilder;
    use crate::engine::{IsolationLevel, Workload};
    use crate::storage::{MemoryBackend, StorageError, Table};

    use super::*;

    fn engine(config: Config) -> (Arc<TxEngine>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (
            Arc::new(TxEngine::new(
                backend.clone(),
                &config,
                Arc::new(TransactionStats::new()),
            )),
            backend,
        )
    }

    async fn insert(engine: &TxEngine, key: &str, value: &[u8]) -> TxId {
        let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();
        engine
            .execute(tx, Statement::insert("t1", key, value.to_vec()))
            .await
            .unwrap();
        tx
    }

    #[tokio::test]
    async fn commit_applies_writes_atomically() {
        let (engine, backend) = engine(Config::default());
        let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();

        engine
            .execute(tx, Statement::insert("t1", "1", b"a".to_vec()))
            .await
            .unwrap();
        engine
            .execute(tx, Statement::insert("t1", "2", b"b".to_vec()))
            .await
            .unwrap();
        assert_eq!(backend.get(Table::Data, "t1/1").unwrap(), None);
        assert_eq!(engine.active_transactions()[0].statements, 2);

        engine.commit(tx).unwrap();

        assert_eq!(backend.scan(Table::Data, "t1/").unwrap().len(), 2);
        assert_eq!(engine.active_count(), 0);
        assert!(matches!(
            engine.commit(tx),
            Err(TransactionError::NotFound(_))
        ));
    }

    /// Test that the second of two concurrent inserts of one key fails at commit.
    #[tokio::test]
    async fn concurrent_inserts_of_one_key_conflict() {
        let (engine, backend) = engine(Config::default());
        let first = insert(&engine, "k", b"A").await;
        let second = insert(&engine, "k", b"B").await;

        engine.commit(first).unwrap();
        assert!(matches!(
            engine.commit(second),
            Err(TransactionError::ConstraintViolation(_))
        ));

        assert_eq!(backend.get(Table::Data, "t1/k").unwrap(), Some(b"A".to_vec()));
        assert_eq!(engine.active_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_updates_of_one_row_conflict() {
        let (engine, backend) = engine(Config::default());
        let setup = insert(&engine, "k", b"0").await;
        engine.commit(setup).unwrap();

        let mut txs = Vec::new();
        for value in [b"1", b"2"] {
            let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();
            engine
                .execute(tx, Statement::update("t1", "k", value.to_vec()))
                .await
                .unwrap();
            txs.push(tx);
        }

        engine.commit(txs[0]).unwrap();
        let err = engine.commit(txs[1]).unwrap_err();
        assert!(matches!(err, TransactionError::WriteConflict(_)));
        assert!(!err.is_retryable());
        assert_eq!(backend.get(Table::Data, "t1/k").unwrap(), Some(b"1".to_vec()));
    }

    /// Test that a commit blocked by a prepared transaction's claim can be retried.
    #[tokio::test]
    async fn commit_of_claimed_row_keeps_transaction() {
        let (engine, backend) = engine(Config::default());
        let tx = insert(&engine, "k", b"L").await;
        backend
            .write(WriteBatch::new().put(Table::RowLock, "t1/k", b"aa".to_vec()))
            .unwrap();

        assert!(matches!(
            engine.commit(tx),
            Err(TransactionError::RowLocked(_))
        ));
        assert_eq!(engine.active_count(), 1);

        backend
            .write(WriteBatch::new().delete(Table::RowLock, "t1/k"))
            .unwrap();
        engine.commit(tx).unwrap();
        assert_eq!(backend.get(Table::Data, "t1/k").unwrap(), Some(b"L".to_vec()));
    }

    struct BusyBackend {
        inner: MemoryBackend,
        busy: AtomicBool,
    }

    impl StorageBackend for BusyBackend {
        fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(table, key)
        }

        fn scan(&self, table: Table, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
            self.inner.scan(table, prefix)
        }

        fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
            if self.busy.load(Ordering::SeqCst) {
                return Err(StorageError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "disk busy",
                )));
            }
            self.inner.write(batch)
        }
    }

    /// Test that a commit failing on a transient storage error can be retried.
    #[tokio::test]
    async fn commit_survives_transient_storage_failure() {
        let backend = Arc::new(BusyBackend {
            inner: MemoryBackend::new(),
            busy: AtomicBool::new(true),
        });
        let engine = TxEngine::new(
            backend.clone(),
            &Config::default(),
            Arc::new(TransactionStats::new()),
        );
        let tx = insert(&engine, "k", b"v").await;

        let err = engine.commit(tx).unwrap_err();
        assert!(matches!(err, TransactionError::TransientStorage(_)));
        assert!(err.is_retryable());
        assert_eq!(engine.active_transactions()[0].id, tx);

        backend.busy.store(false, Ordering::SeqCst);
        engine.commit(tx).unwrap();
        assert_eq!(backend.get(Table::Data, "t1/k").unwrap(), Some(b"v".to_vec()));
    }

    /// Test that every isolation level reads committed rows and is validated at commit.
    #[tokio::test]
    async fn isolation_level_is_a_label() {
        let (engine, _) = engine(Config::default());
        let options = TxOptions::default().with_isolation(IsolationLevel::Serializable);
        let reader = engine.begin("dev".into(), options).unwrap();
        assert_eq!(
            engine.active_transactions()[0].isolation,
            IsolationLevel::Serializable
        );
        engine
            .execute(reader, Statement::insert("t1", "k", b"mine".to_vec()))
            .await
            .unwrap();

        for key in ["k", "m"] {
            let writer = insert(&engine, key, b"other").await;
            engine.commit(writer).unwrap();
        }

        let rows = engine
            .execute(reader, Statement::select("t1"))
            .await
            .unwrap()
            .rows;
        assert_eq!(rows.len(), 2);
        assert!(matches!(
            engine.commit(reader),
            Err(TransactionError::ConstraintViolation(_))
        ));
    }

    #[tokio::test]
    async fn ends_are_counted_per_caller() {
        let config = ConfigBuilder::new()
            .with_tx_timeout(Workload::Oltp, Duration::from_millis(10))
            .build()
            .unwrap();
        let (engine, _) = engine(config);
        let committed = insert(&engine, "1", b"a").await;
        engine.commit(committed).unwrap();
        let rolled_back = insert(&engine, "2", b"b").await;
        engine.rollback(rolled_back).unwrap();
        engine.begin("ops".into(), TxOptions::default()).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.kill_expired(), 1);

        let stats = engine.stats().snapshot();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.outcome(Outcome::Commit), 1);
        assert_eq!(stats.outcome(Outcome::Rollback), 1);
        assert_eq!(stats.outcome(Outcome::Kill), 1);
        assert_eq!(stats.caller(&"dev".into(), Outcome::Commit), 1);
        assert_eq!(stats.caller(&"ops".into(), Outcome::Kill), 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let (engine, backend) = engine(Config::default());
        let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();
        engine
            .execute(tx, Statement::insert("t1", "1", b"a".to_vec()))
            .await
            .unwrap();

        engine.rollback(tx).unwrap();

        assert_eq!(backend.get(Table::Data, "t1/1").unwrap(), None);
        assert!(matches!(
            engine.rollback(tx),
            Err(TransactionError::NotFound(_))
        ));
    }

    /// Test that OLTP and OLAP transactions each fail once their own timeout passes.
    #[tokio::test]
    async fn workload_timeouts_end_statements() {
        for workload in [Workload::Oltp, Workload::Olap] {
            let config = ConfigBuilder::new()
                .with_tx_timeout(workload, Duration::from_millis(10))
                .build()
                .unwrap();
            let (engine, _) = engine(config);
            let tx = engine.begin("dev".into(), TxOptions::new(workload)).unwrap();

            let started = StdInstant::now();
            let result = engine
                .execute(tx, Statement::sleep(Duration::from_secs(10)))
                .await;

            assert!(matches!(result, Err(TransactionError::DeadlineExceeded(_))));
            assert!(started.elapsed() < Duration::from_secs(5));
            assert!(matches!(
                engine.commit(tx),
                Err(TransactionError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn kill_expired_rolls_back_idle_transactions() {
        let config = ConfigBuilder::new()
            .with_tx_timeout(Workload::Oltp, Duration::from_millis(10))
            .build()
            .unwrap();
        let (engine, _) = engine(config);
        let idle = engine.begin("dev".into(), TxOptions::default()).unwrap();
        let olap = engine
            .begin("dev".into(), TxOptions::new(Workload::Olap))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(engine.kill_expired(), 1);
        assert!(matches!(
            engine.commit(idle),
            Err(TransactionError::NotFound(_))
        ));
        engine.commit(olap).unwrap();
    }

    #[tokio::test]
    async fn writes_require_primary() {
        let config = ConfigBuilder::new()
            .with_initial_role(ServingRole::Replica)
            .build()
            .unwrap();
        let (engine, _) = engine(config);
        let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();

        engine.execute(tx, Statement::select("t1")).await.unwrap();
        assert!(matches!(
            engine
                .execute(tx, Statement::insert("t1", "1", b"a".to_vec()))
                .await,
            Err(TransactionError::NotServing {
                role: ServingRole::Replica,
                ..
            })
        ));
        engine.commit(tx).unwrap();
    }

    /// Test that demotion cuts off a long statement once the grace period runs out.
    #[tokio::test]
    async fn demote_rolls_back_after_grace_period() {
        let (engine, _) = engine(Config::default());
        let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(tx, Statement::sleep(Duration::from_secs(20)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = StdInstant::now();
        let report = engine.set_serving_role(ServingRole::Replica).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!report.drained);
        assert_eq!(report.rolled_back, 1);
        assert_eq!(engine.role(), ServingRole::Replica);
        assert!(matches!(
            running.await.unwrap(),
            Err(TransactionError::DeadlineExceeded(_))
        ));
    }

    #[tokio::test]
    async fn promote_has_no_grace_period() {
        let config = ConfigBuilder::new()
            .with_initial_role(ServingRole::Replica)
            .build()
            .unwrap();
        let (engine, _) = engine(config);
        let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(tx, Statement::sleep(Duration::from_secs(20)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = StdInstant::now();
        let report = engine.set_serving_role(ServingRole::Primary).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.rolled_back, 1);
        assert!(running.await.unwrap().is_err());
    }

    /// Test that a transaction finishing within the grace period is not rolled back, and that
    /// new transactions are refused while the transition drains.
    #[tokio::test]
    async fn transition_waits_for_in_flight_transactions() {
        let config = ConfigBuilder::new()
            .with_demote_grace_period(Duration::from_secs(2))
            .build()
            .unwrap();
        let (engine, backend) = engine(config);
        let tx = engine.begin("dev".into(), TxOptions::default()).unwrap();
        engine
            .execute(tx, Statement::insert("t1", "1", b"a".to_vec()))
            .await
            .unwrap();

        let transition = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.set_serving_role(ServingRole::Replica).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            engine.begin("dev".into(), TxOptions::default()),
            Err(TransactionError::NotServing { .. })
        ));
        engine.commit(tx).unwrap();

        let report = transition.await.unwrap();
        assert!(report.drained);
        assert_eq!(report.rolled_back, 0);
        assert_eq!(backend.get(Table::Data, "t1/1").unwrap(), Some(b"a".to_vec()));
        assert!(engine.begin("dev".into(), TxOptions::default()).is_ok());
    }
}
