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

//! Cross-shard transaction coordination for a horizontally-partitioned store.
//!
//! Each data-serving node embeds a [`TransactionServer`]. It owns the node's local transaction
//! engine, the durable redo log of prepared transactions, the distributed transaction metadata
//! store, and the background tasks which watch for abandoned transactions. The query routing
//! layer drives the two-phase commit protocol by calling into the server of every participant.

#[macro_use]
extern crate log;

mod config;
pub mod engine;
pub mod error;
mod health;
mod ids;
mod resolver;
mod server;
mod stats;
pub mod storage;
mod target;
mod ticker;
mod time;
pub mod two_phase_commit;
mod watcher;

pub use config::{Config, ConfigBuilder, WorkloadTimeouts};
pub use error::{ConfigError, TransactionError};
pub use health::{HealthStatus, HealthStream, HealthSubscription};
pub use ids::{CallerId, Dtid, TxId};
pub use resolver::{PreparedView, Resolver, UnresolvedTransaction};
pub use server::TransactionServer;
pub use stats::{Outcome, StatsSnapshot, TransactionStats};
pub use target::{ServingRole, Target};
pub use ticker::PeriodicTask;
pub use time::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use watcher::UnresolvedWatcher;
