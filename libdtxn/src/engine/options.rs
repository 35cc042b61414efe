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

use std::fmt;
use std::time::Duration;

use crate::ids::{CallerId, TxId};

/// The class of work a transaction belongs to; each class has its own timeout.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Workload {
    #[default]
    Oltp,
    Olap,
    Dba,
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Workload::Oltp => f.write_str("OLTP"),
            Workload::Olap => f.write_str("OLAP"),
            Workload::Dba => f.write_str("DBA"),
        }
    }
}

/// The isolation level requested by the caller.
///
/// The level is recorded and shown in the live transaction listing only. Every level behaves
/// the same: reads see the latest committed rows overlaid with the transaction's own writes,
/// and writes are validated at commit against the committed images they were based on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum IsolationLevel {
    #[default]
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    Serializable,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxOptions {
    pub workload: Workload,
    pub isolation: IsolationLevel,
}

impl TxOptions {
    pub fn new(workload: Workload) -> Self {
        TxOptions {
            workload,
            ..TxOptions::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

/// A snapshot of one active local transaction, as shown in the live transaction listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionInfo {
    pub id: TxId,
    pub caller: CallerId,
    pub workload: Workload,
    pub isolation: IsolationLevel,
    pub age: Duration,
    pub statements: usize,
}
