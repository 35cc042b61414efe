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

use parking_lot::Mutex;

use crate::config::Config;
use crate::engine::{QueryResult, Statement, TransitionReport, TxEngine, TxOptions, WriteSet};
use crate::error::TransactionError;
use crate::health::{HealthStream, HealthSubscription};
use crate::ids::{CallerId, Dtid, TxId};
use crate::resolver::Resolver;
use crate::stats::{Outcome, StatsSnapshot, TransactionStats};
use crate::storage::StorageBackend;
use crate::target::{ServingRole, Target};
use crate::ticker::PeriodicTask;
use crate::time::{SystemTimeSource, TimeSource};
use crate::two_phase_commit::{MetadataStore, RedoLog, TransactionMetadata};
use crate::watcher::UnresolvedWatcher;

/// The transaction-serving side of one data node.
///
/// Every request of the routing layer enters here. The server owns the local transaction
/// engine, the redo log and the distributed transaction metadata for the lifetime of the node,
/// along with the background watcher and transaction killer.
pub struct TransactionServer {
    config: Config,
    engine: Arc<TxEngine>,
    redo: Arc<RedoLog>,
    metadata: Arc<MetadataStore>,
    health: HealthStream,
    time_source: Arc<dyn TimeSource>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl TransactionServer {
    pub fn new(
        config: Config,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, TransactionError> {
        Self::with_time_source(config, backend, Arc::new(SystemTimeSource::new()))
    }

    /// Creates a server stamping its durable records with `time_source`.
    ///
    /// A server starting as PRIMARY resurrects the prepared transactions left in `backend`.
    pub fn with_time_source(
        config: Config,
        backend: Arc<dyn StorageBackend>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, TransactionError> {
        let stats = Arc::new(TransactionStats::new());
        let engine = Arc::new(TxEngine::new(backend.clone(), &config, stats.clone()));
        let redo = Arc::new(RedoLog::new(backend.clone(), time_source.clone(), stats));
        let metadata = Arc::new(MetadataStore::new(
            backend,
            time_source.clone(),
            config.abandon_age(),
        ));
        let health = HealthStream::new(config.health_capacity());

        if config.initial_role() == ServingRole::Primary {
            redo.resurrect(&metadata)?;
        } else {
            redo.release();
        }

        Ok(TransactionServer {
            config,
            engine,
            redo,
            metadata,
            health,
            time_source,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the unresolved transaction watcher and the transaction killer. Has no effect if
    /// they are already running. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }

        let watcher = Arc::new(UnresolvedWatcher::new(
            self.metadata.clone(),
            self.redo.clone(),
            self.engine.clone(),
            self.health.clone(),
            self.time_source.clone(),
        ));
        tasks.push(watcher.start(self.config.watcher_interval()));

        let engine = self.engine.clone();
        tasks.push(PeriodicTask::spawn(
            "transaction killer",
            self.config.killer_interval(),
            move || {
                let killed = engine.kill_expired();
                if killed > 0 {
                    debug!("killed {} expired transactions", killed);
                }
            },
        ));
    }

    /// Stops the background tasks and waits for them to exit.
    pub async fn stop(&self) {
        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }
    }

    pub fn begin(&self, caller: CallerId, options: TxOptions) -> Result<TxId, TransactionError> {
        self.engine.begin(caller, options)
    }

    pub async fn execute(
        &self,
        tx_id: TxId,
        statement: Statement,
    ) -> Result<QueryResult, TransactionError> {
        self.engine.execute(tx_id, statement).await
    }

    pub fn commit(&self, tx_id: TxId) -> Result<(), TransactionError> {
        self.engine.commit(tx_id)
    }

    pub fn rollback(&self, tx_id: TxId) -> Result<(), TransactionError> {
        self.engine.rollback(tx_id)
    }

    /// Moves an active local transaction into the redo log under `dtid`.
    ///
    /// If the redo entry can not be written the transaction stays active, so it can still be
    /// cleaned up with [`rollback_prepared`](Self::rollback_prepared).
    pub fn prepare(&self, tx_id: TxId, dtid: &Dtid) -> Result<(), TransactionError> {
        let (tx, writes) = self.engine.detach(tx_id, "prepare")?;
        if let Err(err) = self.redo.prepare(dtid, writes) {
            debug!("prepare of transaction {} as {} failed: {}", tx_id, dtid, err);
            self.engine.reattach(tx);
            return Err(err);
        }
        self.engine.record(&tx, Outcome::Prepare);
        Ok(())
    }

    pub fn commit_prepared(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        self.engine.require_primary("commit_prepared")?;
        self.redo.commit_prepared(dtid)
    }

    /// Discards the redo entry of `dtid`, along with the local transaction `original_id` if it
    /// is still active.
    pub fn rollback_prepared(
        &self,
        dtid: &Dtid,
        original_id: Option<TxId>,
    ) -> Result<(), TransactionError> {
        self.redo.rollback_prepared(dtid)?;
        if let Some(tx_id) = original_id {
            self.rollback_original(tx_id);
        }
        Ok(())
    }

    pub fn create_transaction(
        &self,
        dtid: &Dtid,
        participants: &[Target],
    ) -> Result<(), TransactionError> {
        self.metadata.create_transaction(dtid, participants)
    }

    /// Records the COMMIT decision for `dtid`.
    ///
    /// When `tx_id` names the coordinator's own local transaction, its writes are committed in
    /// the same atomic write as the decision. If the decision can not be recorded the local
    /// transaction stays active.
    pub fn start_commit(
        &self,
        caller: &CallerId,
        tx_id: Option<TxId>,
        dtid: &Dtid,
    ) -> Result<(), TransactionError> {
        let tx_id = match tx_id {
            Some(tx_id) => tx_id,
            None => return self.metadata.start_commit(caller, dtid, &WriteSet::default()),
        };

        let (tx, writes) = self.engine.detach(tx_id, "start_commit")?;
        match self.metadata.start_commit(caller, dtid, &writes) {
            Ok(()) => {
                self.engine.record(&tx, Outcome::Commit);
                Ok(())
            }
            Err(err) => {
                self.engine.reattach(tx);
                Err(err)
            }
        }
    }

    /// Records the ROLLBACK decision for `dtid` and rolls back the local transaction
    /// `original_id` if it is still active.
    pub fn set_rollback(
        &self,
        caller: &CallerId,
        dtid: &Dtid,
        original_id: Option<TxId>,
    ) -> Result<(), TransactionError> {
        self.metadata.set_rollback(caller, dtid)?;
        if let Some(tx_id) = original_id {
            self.rollback_original(tx_id);
        }
        Ok(())
    }

    fn rollback_original(&self, tx_id: TxId) {
        match self.engine.rollback(tx_id) {
            Ok(()) => debug!("rolled back original transaction {}", tx_id),
            Err(err) => debug!("original transaction {} not rolled back: {}", tx_id, err),
        }
    }

    pub fn read_transaction(
        &self,
        dtid: &Dtid,
    ) -> Result<Option<TransactionMetadata>, TransactionError> {
        self.metadata.read_transaction(dtid)
    }

    pub fn conclude_transaction(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        self.metadata.conclude_transaction(dtid)
    }

    pub fn unresolved_transactions(&self) -> Result<Vec<TransactionMetadata>, TransactionError> {
        self.metadata.unresolved_transactions()
    }

    /// Changes the serving role.
    ///
    /// Leaving PRIMARY releases the prepared pool; the durable redo entries stay. Becoming
    /// PRIMARY resurrects them.
    pub async fn set_serving_role(
        &self,
        role: ServingRole,
    ) -> Result<TransitionReport, TransactionError> {
        let mut report = self.engine.set_serving_role(role).await;

        match (report.from, report.to) {
            (ServingRole::Primary, to) if to != ServingRole::Primary => {
                let released = self.redo.release();
                info!("released {} prepared transactions", released);
            }
            (from, ServingRole::Primary) if from != ServingRole::Primary => {
                report.resurrected = Some(self.redo.resurrect(&self.metadata)?);
            }
            _ => (),
        }
        Ok(report)
    }

    pub fn serving_role(&self) -> ServingRole {
        self.engine.role()
    }

    pub fn subscribe_health(&self) -> HealthSubscription {
        self.health.subscribe()
    }

    /// Transaction counts since the server was created.
    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats().snapshot()
    }

    /// Operator access to stuck transactions.
    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self)
    }

    pub fn engine(&self) -> &TxEngine {
        &self.engine
    }

    pub(crate) fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub(crate) fn redo(&self) -> &RedoLog {
        &self.redo
    }

    pub(crate) fn time_source(&self) -> &dyn TimeSource {
        self.time_source.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::ConfigBuilder;
    use crate::storage::{MemoryBackend, Table};
    use crate::two_phase_commit::TransactionState;

    use super::*;

    fn server() -> (TransactionServer, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (
            TransactionServer::new(Config::default(), backend.clone()).unwrap(),
            backend,
        )
    }

    fn participants() -> Vec<Target> {
        vec![
            Target::new("test1", "0"),
            Target::new("test2", "1").with_tablet_type(ServingRole::Replica),
        ]
    }

    async fn write_one(server: &TransactionServer, key: &str) -> TxId {
        let tx = server.begin("dev".into(), TxOptions::default()).unwrap();
        server
            .execute(tx, Statement::insert("orders", key, key.as_bytes().to_vec()))
            .await
            .unwrap();
        tx
    }

    #[tokio::test]
    async fn coordinator_commit_flow() {
        let (server, backend) = server();
        let caller = CallerId::from("dev");
        let dtid = Dtid::from("aa");

        server.create_transaction(&dtid, &participants()).unwrap();
        let err = server
            .create_transaction(&dtid, &participants())
            .unwrap_err();
        assert!(err.to_string().contains("duplicate entry"));

        let tx = write_one(&server, "5").await;
        server.start_commit(&caller, Some(tx), &dtid).unwrap();
        assert_eq!(
            backend.get(Table::Data, "orders/5").unwrap(),
            Some(b"5".to_vec())
        );

        let err = server.set_rollback(&caller, &dtid, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "could not transition to ROLLBACK: aa (CallerID: dev)"
        );

        let metadata = server.read_transaction(&dtid).unwrap().unwrap();
        assert_eq!(metadata.state, TransactionState::Commit);
        assert_eq!(metadata.participants, participants());
        assert_eq!(metadata.participants[0].tablet_type, ServingRole::Primary);

        server.conclude_transaction(&dtid).unwrap();
        assert_eq!(server.read_transaction(&dtid).unwrap(), None);
    }

    #[tokio::test]
    async fn coordinator_rollback_flow() {
        let (server, backend) = server();
        let caller = CallerId::from("dev");
        let dtid = Dtid::from("aa");

        server.create_transaction(&dtid, &participants()).unwrap();
        let tx = write_one(&server, "6").await;
        server.set_rollback(&caller, &dtid, Some(tx)).unwrap();

        assert!(matches!(
            server.commit(tx),
            Err(TransactionError::NotFound(_))
        ));
        assert_eq!(backend.get(Table::Data, "orders/6").unwrap(), None);
        assert!(matches!(
            server.start_commit(&caller, None, &dtid),
            Err(TransactionError::IllegalStateTransition { .. })
        ));

        let metadata = server.read_transaction(&dtid).unwrap().unwrap();
        assert_eq!(metadata.state, TransactionState::Rollback);
        server.conclude_transaction(&dtid).unwrap();
    }

    /// Test that a failed decision leaves the coordinator's local transaction usable.
    #[tokio::test]
    async fn failed_start_commit_keeps_local_transaction() {
        let (server, backend) = server();
        let tx = write_one(&server, "7").await;

        assert!(matches!(
            server.start_commit(&"dev".into(), Some(tx), &"missing".into()),
            Err(TransactionError::NotFound(_))
        ));

        server.commit(tx).unwrap();
        assert_eq!(
            backend.get(Table::Data, "orders/7").unwrap(),
            Some(b"7".to_vec())
        );
    }

    #[tokio::test]
    async fn prepare_then_commit_prepared() {
        let (server, backend) = server();
        let tx = write_one(&server, "1").await;

        server.prepare(tx, &"aa".into()).unwrap();
        assert_eq!(server.engine().active_count(), 0);
        assert_eq!(backend.get(Table::Data, "orders/1").unwrap(), None);

        server.commit_prepared(&"aa".into()).unwrap();
        assert_eq!(
            backend.get(Table::Data, "orders/1").unwrap(),
            Some(b"1".to_vec())
        );
        server.commit_prepared(&"aa".into()).unwrap();
    }

    #[tokio::test]
    async fn prepare_then_rollback_prepared() {
        let (server, backend) = server();
        let tx = write_one(&server, "2").await;

        server.prepare(tx, &"aa".into()).unwrap();
        server.rollback_prepared(&"aa".into(), Some(tx)).unwrap();
        server.rollback_prepared(&"aa".into(), Some(tx)).unwrap();

        assert_eq!(backend.get(Table::Data, "orders/2").unwrap(), None);
        assert!(server.resolver().prepared().unwrap().is_empty());
    }

    /// Test that a transaction whose prepare failed can still be rolled back.
    #[tokio::test]
    async fn failed_prepare_keeps_transaction_active() {
        let (server, backend) = server();
        let first = write_one(&server, "3").await;
        server.prepare(first, &"aa".into()).unwrap();

        let second = write_one(&server, "4").await;
        assert!(matches!(
            server.prepare(second, &"aa".into()),
            Err(TransactionError::ConstraintViolation(_))
        ));
        assert_eq!(server.engine().active_transactions()[0].id, second);

        server.rollback(second).unwrap();
        server.commit_prepared(&"aa".into()).unwrap();
        assert_eq!(
            backend.get(Table::Data, "orders/3").unwrap(),
            Some(b"3".to_vec())
        );
        assert_eq!(backend.get(Table::Data, "orders/4").unwrap(), None);
    }

    /// Test that a prepared transaction's rows can not be written until it is resolved.
    #[tokio::test]
    async fn prepared_rows_block_local_writes() {
        let (server, backend) = server();
        let prepared = server.begin("dev".into(), TxOptions::default()).unwrap();
        server
            .execute(prepared, Statement::insert("t", "k", b"P".to_vec()))
            .await
            .unwrap();
        server.prepare(prepared, &"aa".into()).unwrap();

        let local = server.begin("dev".into(), TxOptions::default()).unwrap();
        let err = server
            .execute(local, Statement::insert("t", "k", b"L".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::RowLocked(_)));
        server.rollback(local).unwrap();

        server.commit_prepared(&"aa".into()).unwrap();
        assert_eq!(backend.get(Table::Data, "t/k").unwrap(), Some(b"P".to_vec()));
    }

    /// Test that a local write which started before the prepare loses at commit.
    #[tokio::test]
    async fn local_commit_after_prepare_of_same_row_is_refused() {
        let (server, backend) = server();
        let local = write_one(&server, "8").await;
        let prepared = write_one(&server, "8").await;
        server.prepare(prepared, &"aa".into()).unwrap();

        assert!(matches!(
            server.commit(local),
            Err(TransactionError::RowLocked(_))
        ));
        server.commit_prepared(&"aa".into()).unwrap();
        assert!(matches!(
            server.commit(local),
            Err(TransactionError::ConstraintViolation(_))
        ));
        assert_eq!(
            backend.get(Table::Data, "orders/8").unwrap(),
            Some(b"8".to_vec())
        );
    }

    #[tokio::test]
    async fn stats_count_outcomes_per_caller() {
        let (server, _) = server();
        let caller = CallerId::from("dev");

        let committed = write_one(&server, "1").await;
        server.commit(committed).unwrap();
        let prepared = write_one(&server, "2").await;
        server.prepare(prepared, &"aa".into()).unwrap();
        server.commit_prepared(&"aa".into()).unwrap();
        server.create_transaction(&"bb".into(), &participants()).unwrap();
        let decided = write_one(&server, "3").await;
        server.start_commit(&caller, Some(decided), &"bb".into()).unwrap();

        let stats = server.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.outcome(Outcome::Commit), 2);
        assert_eq!(stats.outcome(Outcome::Prepare), 1);
        assert_eq!(stats.outcome(Outcome::CommitPrepared), 1);
        assert_eq!(stats.caller(&caller, Outcome::Prepare), 1);
    }

    #[tokio::test]
    async fn replica_starts_with_closed_pool() {
        let config = ConfigBuilder::new()
            .with_initial_role(ServingRole::Replica)
            .build()
            .unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let server = TransactionServer::new(config, backend).unwrap();

        server.redo().prepare(&"aa".into(), WriteSet::default()).unwrap();
        assert_eq!(server.redo().prepared_count(), 0);

        let report = server
            .set_serving_role(ServingRole::Primary)
            .await
            .unwrap();
        assert_eq!(report.resurrected.unwrap().prepared, vec![Dtid::from("aa")]);
        assert_eq!(server.redo().prepared_count(), 1);
    }

    #[tokio::test]
    async fn prepare_requires_an_active_transaction() {
        let (server, _) = server();

        assert!(matches!(
            server.prepare(TxId(42), &"aa".into()),
            Err(TransactionError::NotFound(_))
        ));
        assert!(server.resolver().prepared().unwrap().is_empty());
    }

    /// Test that a prepared transaction survives a primary -> replica -> primary cycle.
    #[tokio::test]
    async fn prepared_transaction_survives_reparent() {
        let (server, backend) = server();
        let tx = write_one(&server, "1").await;
        server.prepare(tx, &"aa".into()).unwrap();

        let report = server
            .set_serving_role(ServingRole::Replica)
            .await
            .unwrap();
        assert!(report.drained);
        assert!(matches!(
            server.commit_prepared(&"aa".into()),
            Err(TransactionError::NotServing { .. })
        ));

        let report = server
            .set_serving_role(ServingRole::Primary)
            .await
            .unwrap();
        let resurrected = report.resurrected.unwrap();
        assert_eq!(resurrected.prepared, vec![Dtid::from("aa")]);

        server.commit_prepared(&"aa".into()).unwrap();
        assert_eq!(
            backend.get(Table::Data, "orders/1").unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[cfg(feature = "file-store")]
    #[tokio::test]
    async fn prepared_transaction_survives_restart() {
        use crate::storage::FileBackend;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        {
            let backend = Arc::new(FileBackend::open(dir.path()).unwrap());
            let server = TransactionServer::new(Config::default(), backend).unwrap();
            let tx = write_one(&server, "9").await;
            server.prepare(tx, &"aa".into()).unwrap();
        }

        let backend = Arc::new(FileBackend::open(dir.path()).unwrap());
        let server = TransactionServer::new(Config::default(), backend.clone()).unwrap();
        assert_eq!(server.resolver().prepared().unwrap().len(), 1);

        server.commit_prepared(&"aa".into()).unwrap();
        assert_eq!(
            backend.get(Table::Data, "orders/9").unwrap(),
            Some(b"9".to_vec())
        );
    }

    /// Test that the running watcher raises the unresolved signal and stops once concluded.
    #[tokio::test]
    async fn watcher_signals_until_concluded() {
        let config = ConfigBuilder::new()
            .with_abandon_age(Duration::from_millis(20))
            .with_watcher_interval(Duration::from_millis(5))
            .build()
            .unwrap();
        let server = TransactionServer::new(config, Arc::new(MemoryBackend::new())).unwrap();
        let mut health = server.subscribe_health();
        server.start();

        server
            .create_transaction(&"aa".into(), &participants())
            .unwrap();
        let raised = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(status) = health.recv().await {
                if status.tx_unresolved {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(raised.ok(), Some(true));
        assert_eq!(server.unresolved_transactions().unwrap().len(), 1);

        server.conclude_transaction(&"aa".into()).unwrap();
        let cleared = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(status) = health.recv().await {
                if !status.tx_unresolved {
                    return true;
                }
            }
            false
        })
        .await;
        assert_eq!(cleared.ok(), Some(true));

        server.stop().await;
    }
}
