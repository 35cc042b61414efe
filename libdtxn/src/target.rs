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

use serde::{Deserialize, Serialize};

/// The role a node serves for its shard.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingRole {
    Primary,
    Replica,
    RdOnly,
}

impl fmt::Display for ServingRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServingRole::Primary => f.write_str("PRIMARY"),
            ServingRole::Replica => f.write_str("REPLICA"),
            ServingRole::RdOnly => f.write_str("RDONLY"),
        }
    }
}

/// A participant of a distributed transaction: one shard of one keyspace, in a given role.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub tablet_type: ServingRole,
}

impl Target {
    /// Creates a target for the primary of the given shard.
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>) -> Self {
        Target {
            keyspace: keyspace.into(),
            shard: shard.into(),
            tablet_type: ServingRole::Primary,
        }
    }

    pub fn with_tablet_type(mut self, tablet_type: ServingRole) -> Self {
        self.tablet_type = tablet_type;
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}@{}", self.keyspace, self.shard, self.tablet_type)
    }
}
