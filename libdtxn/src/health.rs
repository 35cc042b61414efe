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

use std::time::SystemTime;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::target::ServingRole;

/// One health report of a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HealthStatus {
    pub serving_role: ServingRole,
    /// True while at least one distributed transaction coordinated here is older than the
    /// abandon age.
    pub tx_unresolved: bool,
    pub unresolved_transactions: usize,
    /// Prepared local transactions older than the abandon age.
    pub unresolved_prepares: usize,
    pub active_transactions: usize,
    pub timestamp: SystemTime,
}

/// The publishing side of the health stream.
///
/// Publishing never waits: a subscriber which falls behind loses the oldest reports.
#[derive(Clone)]
pub struct HealthStream {
    sender: broadcast::Sender<HealthStatus>,
}

impl HealthStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        HealthStream { sender }
    }

    /// Publishes a report, returning the number of subscribers it reached.
    pub fn publish(&self, status: HealthStatus) -> usize {
        self.sender.send(status).unwrap_or(0)
    }

    pub fn subscribe(&self) -> HealthSubscription {
        HealthSubscription {
            receiver: self.sender.subscribe(),
            lagged: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A subscriber of the health stream. Dropping it unsubscribes.
pub struct HealthSubscription {
    receiver: broadcast::Receiver<HealthStatus>,
    lagged: u64,
}

impl HealthSubscription {
    /// Waits for the next report. Returns `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<HealthStatus> {
        loop {
            match self.receiver.recv().await {
                Ok(status) => return Some(status),
                Err(RecvError::Lagged(skipped)) => {
                    debug!("health subscriber skipped {} reports", skipped);
                    self.lagged += skipped;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next report if one is already waiting.
    pub fn try_recv(&mut self) -> Option<HealthStatus> {
        loop {
            match self.receiver.try_recv() {
                Ok(status) => return Some(status),
                Err(TryRecvError::Lagged(skipped)) => self.lagged += skipped,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of reports this subscriber missed by falling behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    pub fn unsubscribe(self) {}
}
