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

//! Transaction counters.
//!
//! Every count is kept locally, so it can be read back through [`TransactionStats::snapshot`],
//! and mirrored to the `metrics` facade for whichever exporter the embedding binary installs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;

use crate::ids::CallerId;

/// How a transaction, local or prepared, came to an end.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Outcome {
    Commit,
    Rollback,
    /// Rolled back by the transaction killer or a serving role transition.
    Kill,
    /// Handed over to the redo log.
    Prepare,
    CommitPrepared,
    RollbackPrepared,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Commit => "commit",
            Outcome::Rollback => "rollback",
            Outcome::Kill => "kill",
            Outcome::Prepare => "prepare",
            Outcome::CommitPrepared => "commit_prepared",
            Outcome::RollbackPrepared => "rollback_prepared",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time copy of the counters.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    /// Local transactions ended, whatever the outcome.
    pub total: u64,
    pub outcomes: BTreeMap<Outcome, u64>,
    /// Local transaction outcomes per caller.
    pub callers: BTreeMap<(CallerId, Outcome), u64>,
    /// Prepared transactions older than the abandon age, as of the last watcher tick.
    pub unresolved_prepares: u64,
}

impl StatsSnapshot {
    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn caller(&self, caller: &CallerId, outcome: Outcome) -> u64 {
        self.callers
            .get(&(caller.clone(), outcome))
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Default)]
pub struct TransactionStats {
    total: AtomicU64,
    outcomes: Mutex<BTreeMap<Outcome, u64>>,
    callers: Mutex<BTreeMap<(CallerId, Outcome), u64>>,
    unresolved_prepares: AtomicU64,
}

impl TransactionStats {
    pub fn new() -> Self {
        TransactionStats::default()
    }

    /// Counts the end of a local transaction which ran for `duration`.
    pub fn record(&self, caller: &CallerId, outcome: Outcome, duration: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        *self.outcomes.lock().entry(outcome).or_insert(0) += 1;
        *self
            .callers
            .lock()
            .entry((caller.clone(), outcome))
            .or_insert(0) += 1;

        counter!("dtxn_transactions_total", 1);
        counter!("dtxn_transactions", 1, "outcome" => outcome.as_str());
        counter!(
            "dtxn_user_transactions",
            1,
            "caller" => caller.as_str().to_string(),
            "outcome" => outcome.as_str()
        );
        histogram!(
            "dtxn_transaction_duration_seconds",
            duration.as_secs_f64(),
            "outcome" => outcome.as_str()
        );
    }

    /// Counts a redo log operation; these are not local transaction ends.
    pub fn record_prepared(&self, outcome: Outcome) {
        *self.outcomes.lock().entry(outcome).or_insert(0) += 1;
        counter!("dtxn_prepared_transactions", 1, "outcome" => outcome.as_str());
    }

    pub fn set_unresolved(&self, transactions: usize, prepares: usize) {
        self.unresolved_prepares
            .store(prepares as u64, Ordering::Relaxed);
        gauge!("dtxn_unresolved_transactions", transactions as f64);
        gauge!("dtxn_unresolved_prepares", prepares as f64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            outcomes: self.outcomes.lock().clone(),
            callers: self.callers.lock().clone(),
            unresolved_prepares: self.unresolved_prepares.load(Ordering::Relaxed),
        }
    }
}
