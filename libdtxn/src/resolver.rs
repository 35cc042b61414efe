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

//! Operator views of distributed and prepared transactions, and the actions used to resolve the
//! ones which got stuck.

use std::time::Duration;

use crate::error::TransactionError;
use crate::ids::Dtid;
use crate::server::TransactionServer;
use crate::target::Target;
use crate::time;
use crate::two_phase_commit::{RedoState, TransactionMetadata, TransactionState};

/// A distributed transaction as shown to operators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnresolvedTransaction {
    pub dtid: Dtid,
    pub state: TransactionState,
    pub age: Duration,
    pub participants: Vec<Target>,
}

/// A redo entry as shown to operators.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PreparedView {
    pub dtid: Dtid,
    pub state: RedoState,
    pub age: Duration,
    pub statement_count: usize,
}

pub struct Resolver<'a> {
    server: &'a TransactionServer,
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(server: &'a TransactionServer) -> Self {
        Resolver { server }
    }

    /// Distributed transactions older than the abandon age, decided ones first.
    pub fn unresolved(&self) -> Result<Vec<UnresolvedTransaction>, TransactionError> {
        let unresolved = self.server.metadata().unresolved_transactions()?;
        Ok(self.view(unresolved))
    }

    /// Every distributed transaction coordinated by this node, regardless of age.
    pub fn transactions(&self) -> Result<Vec<UnresolvedTransaction>, TransactionError> {
        let transactions = self.server.metadata().transactions()?;
        Ok(self.view(transactions))
    }

    fn view(&self, transactions: Vec<TransactionMetadata>) -> Vec<UnresolvedTransaction> {
        let now = self.server.time_source().now();
        transactions
            .into_iter()
            .map(|txn| UnresolvedTransaction {
                age: txn.age(now),
                dtid: txn.dtid,
                state: txn.state,
                participants: txn.participants,
            })
            .collect()
    }

    /// Every redo entry on this node, failed ones included.
    pub fn prepared(&self) -> Result<Vec<PreparedView>, TransactionError> {
        let now = self.server.time_source().now();
        Ok(self
            .server
            .redo()
            .entries()?
            .into_iter()
            .map(|entry| PreparedView {
                dtid: entry.dtid().clone(),
                state: entry.state(),
                age: time::age(now, entry.time_created()),
                statement_count: entry.statements().len(),
            })
            .collect())
    }

    pub fn force_conclude(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        warn!("operator forced conclusion of {}", dtid);
        self.server.conclude_transaction(dtid)
    }

    pub fn force_commit_prepared(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        warn!("operator forced commit of prepared transaction {}", dtid);
        self.server.commit_prepared(dtid)
    }

    pub fn force_rollback_prepared(&self, dtid: &Dtid) -> Result<(), TransactionError> {
        warn!("operator forced rollback of prepared transaction {}", dtid);
        self.server.rollback_prepared(dtid, None)
    }
}
