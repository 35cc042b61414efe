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
use std::time::Duration;

use crate::engine::TxEngine;
use crate::health::{HealthStatus, HealthStream};
use crate::target::ServingRole;
use crate::ticker::PeriodicTask;
use crate::time::TimeSource;
use crate::two_phase_commit::{MetadataStore, RedoLog};

/// Periodically reports distributed transactions which have outlived the abandon age.
///
/// The signal is level-triggered: every tick republishes the current condition, so a
/// transaction which gets concluded simply stops being reported.
pub struct UnresolvedWatcher {
    metadata: Arc<MetadataStore>,
    redo: Arc<RedoLog>,
    engine: Arc<TxEngine>,
    health: HealthStream,
    time_source: Arc<dyn TimeSource>,
}

impl UnresolvedWatcher {
    pub fn new(
        metadata: Arc<MetadataStore>,
        redo: Arc<RedoLog>,
        engine: Arc<TxEngine>,
        health: HealthStream,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        UnresolvedWatcher {
            metadata,
            redo,
            engine,
            health,
            time_source,
        }
    }

    /// Scans once and publishes the result. Nothing is published if the scan fails.
    pub fn tick(&self) -> Option<HealthStatus> {
        let serving_role = self.engine.role();

        // Distributed transactions are only driven to completion from the primary.
        let unresolved = if serving_role == ServingRole::Primary {
            match self.metadata.unresolved_transactions() {
                Ok(unresolved) => unresolved,
                Err(err) => {
                    warn!("unable to scan for unresolved transactions: {}", err);
                    return None;
                }
            }
        } else {
            Vec::new()
        };

        let now = self.time_source.now();
        for txn in &unresolved {
            debug!(
                "distributed transaction {} unresolved in state {} for {:?}",
                txn.dtid,
                txn.state,
                txn.age(now)
            );
        }

        let unresolved_prepares = self.redo.unresolved_prepares(self.metadata.abandon_age());
        self.engine
            .stats()
            .set_unresolved(unresolved.len(), unresolved_prepares);

        let status = HealthStatus {
            serving_role,
            tx_unresolved: !unresolved.is_empty(),
            unresolved_transactions: unresolved.len(),
            unresolved_prepares,
            active_transactions: self.engine.active_count(),
            timestamp: now,
        };
        self.health.publish(status.clone());
        Some(status)
    }

    pub fn start(self: Arc<Self>, interval: Duration) -> PeriodicTask {
        PeriodicTask::spawn("unresolved transaction watcher", interval, move || {
            self.tick();
        })
    }
}
