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

use std::time::{Duration, SystemTime};

use crate::ids::Dtid;
use crate::target::Target;
use crate::time;

use super::TransactionState;

/// The coordinator's record of one distributed transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransactionMetadata {
    pub dtid: Dtid,
    pub state: TransactionState,
    pub time_created: SystemTime,
    pub participants: Vec<Target>,
}

impl TransactionMetadata {
    pub fn age(&self, now: SystemTime) -> Duration {
        time::age(now, self.time_created)
    }
}
