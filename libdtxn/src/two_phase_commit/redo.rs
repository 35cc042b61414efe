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
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::engine::statement;
use crate::engine::{RowImage, Statement, WriteSet};
use crate::ids::Dtid;
use crate::storage::Mutation;
use crate::time;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedoState {
    /// Waiting for the coordinator's decision.
    Prepared,
    /// Replay was attempted and can not succeed; needs operator attention.
    Failed,
}

impl fmt::Display for RedoState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RedoState::Prepared => f.write_str("PREPARED"),
            RedoState::Failed => f.write_str("FAILED"),
        }
    }
}

/// A redo entry: a local transaction which has been prepared under a dtid.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    pub(super) dtid: Dtid,
    pub(super) state: RedoState,
    pub(super) time_created: u64,
    pub(super) statements: Vec<Statement>,
    /// Committed images of the rows this transaction writes; each one is claimed for it.
    #[serde(default)]
    pub(super) reads: Vec<RowImage>,
}

impl PreparedTransaction {
    pub(super) fn new(dtid: Dtid, time_created: SystemTime, writes: WriteSet) -> Self {
        PreparedTransaction {
            dtid,
            state: RedoState::Prepared,
            time_created: time::to_unix_nanos(time_created),
            statements: writes.statements,
            reads: writes.reads,
        }
    }

    pub fn dtid(&self) -> &Dtid {
        &self.dtid
    }

    pub fn state(&self) -> RedoState {
        self.state
    }

    pub fn time_created(&self) -> SystemTime {
        time::from_unix_nanos(self.time_created)
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn reads(&self) -> &[RowImage] {
        &self.reads
    }

    /// The writes which finish this transaction, or `None` if the recorded statements can not
    /// be replayed.
    pub fn mutations(&self) -> Option<Vec<Mutation>> {
        statement::mutations(&self.statements)
    }
}
