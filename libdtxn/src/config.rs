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

use std::time::Duration;

use crate::engine::Workload;
use crate::error::ConfigError;
use crate::target::ServingRole;

const MIN_KILLER_INTERVAL: Duration = Duration::from_millis(10);

/// Per-workload transaction timeouts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WorkloadTimeouts {
    pub oltp: Duration,
    pub olap: Duration,
    pub dba: Duration,
}

impl WorkloadTimeouts {
    pub fn for_workload(&self, workload: Workload) -> Duration {
        match workload {
            Workload::Oltp => self.oltp,
            Workload::Olap => self.olap,
            Workload::Dba => self.dba,
        }
    }

    fn min(&self) -> Duration {
        self.oltp.min(self.olap).min(self.dba)
    }
}

impl Default for WorkloadTimeouts {
    fn default() -> Self {
        WorkloadTimeouts {
            oltp: Duration::from_secs(30),
            olap: Duration::from_secs(300),
            dba: Duration::from_secs(30),
        }
    }
}

/// Settings of a [`TransactionServer`](crate::TransactionServer).
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) tx_timeouts: WorkloadTimeouts,
    pub(crate) abandon_age: Duration,
    pub(crate) watcher_interval: Duration,
    pub(crate) killer_interval: Duration,
    pub(crate) demote_grace_period: Duration,
    pub(crate) promote_grace_period: Duration,
    pub(crate) health_capacity: usize,
    pub(crate) initial_role: ServingRole,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn tx_timeouts(&self) -> WorkloadTimeouts {
        self.tx_timeouts
    }

    /// Minimum age at which a distributed transaction or a prepared entry counts as unresolved.
    pub fn abandon_age(&self) -> Duration {
        self.abandon_age
    }

    pub fn watcher_interval(&self) -> Duration {
        self.watcher_interval
    }

    pub fn killer_interval(&self) -> Duration {
        self.killer_interval
    }

    pub fn demote_grace_period(&self) -> Duration {
        self.demote_grace_period
    }

    pub fn promote_grace_period(&self) -> Duration {
        self.promote_grace_period
    }

    pub fn health_capacity(&self) -> usize {
        self.health_capacity
    }

    pub fn initial_role(&self) -> ServingRole {
        self.initial_role
    }
}

impl Default for Config {
    fn default() -> Self {
        let tx_timeouts = WorkloadTimeouts::default();
        let abandon_age = Duration::from_secs(1);
        Config {
            tx_timeouts,
            abandon_age,
            watcher_interval: abandon_age / 2,
            killer_interval: default_killer_interval(&tx_timeouts),
            demote_grace_period: Duration::from_secs(3),
            promote_grace_period: Duration::ZERO,
            health_capacity: 64,
            initial_role: ServingRole::Primary,
        }
    }
}

fn default_killer_interval(timeouts: &WorkloadTimeouts) -> Duration {
    (timeouts.min() / 10).max(MIN_KILLER_INTERVAL)
}

#[derive(Default)]
pub struct ConfigBuilder {
    tx_timeouts: Option<WorkloadTimeouts>,
    abandon_age: Option<Duration>,
    watcher_interval: Option<Duration>,
    killer_interval: Option<Duration>,
    demote_grace_period: Option<Duration>,
    promote_grace_period: Option<Duration>,
    health_capacity: Option<usize>,
    initial_role: Option<ServingRole>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tx_timeouts(mut self, tx_timeouts: WorkloadTimeouts) -> Self {
        self.tx_timeouts = Some(tx_timeouts);
        self
    }

    /// Sets the timeout of a single workload class, keeping the defaults of the others.
    pub fn with_tx_timeout(mut self, workload: Workload, timeout: Duration) -> Self {
        let mut timeouts = self.tx_timeouts.unwrap_or_default();
        match workload {
            Workload::Oltp => timeouts.oltp = timeout,
            Workload::Olap => timeouts.olap = timeout,
            Workload::Dba => timeouts.dba = timeout,
        }
        self.tx_timeouts = Some(timeouts);
        self
    }

    pub fn with_abandon_age(mut self, abandon_age: Duration) -> Self {
        self.abandon_age = Some(abandon_age);
        self
    }

    pub fn with_watcher_interval(mut self, watcher_interval: Duration) -> Self {
        self.watcher_interval = Some(watcher_interval);
        self
    }

    pub fn with_killer_interval(mut self, killer_interval: Duration) -> Self {
        self.killer_interval = Some(killer_interval);
        self
    }

    pub fn with_demote_grace_period(mut self, grace_period: Duration) -> Self {
        self.demote_grace_period = Some(grace_period);
        self
    }

    pub fn with_promote_grace_period(mut self, grace_period: Duration) -> Self {
        self.promote_grace_period = Some(grace_period);
        self
    }

    pub fn with_health_capacity(mut self, health_capacity: usize) -> Self {
        self.health_capacity = Some(health_capacity);
        self
    }

    pub fn with_initial_role(mut self, initial_role: ServingRole) -> Self {
        self.initial_role = Some(initial_role);
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let tx_timeouts = self.tx_timeouts.unwrap_or(defaults.tx_timeouts);
        if tx_timeouts.min().is_zero() {
            return Err(ConfigError("transaction timeouts must be non-zero".into()));
        }

        let abandon_age = self.abandon_age.unwrap_or(defaults.abandon_age);
        if abandon_age.is_zero() {
            return Err(ConfigError("abandon age must be non-zero".into()));
        }

        let watcher_interval = self.watcher_interval.unwrap_or(abandon_age / 2);
        if watcher_interval.is_zero() {
            return Err(ConfigError("watcher interval must be non-zero".into()));
        }

        let killer_interval = self
            .killer_interval
            .unwrap_or_else(|| default_killer_interval(&tx_timeouts));
        if killer_interval.is_zero() {
            return Err(ConfigError("killer interval must be non-zero".into()));
        }

        let health_capacity = self.health_capacity.unwrap_or(defaults.health_capacity);
        if health_capacity == 0 {
            return Err(ConfigError("health capacity must be non-zero".into()));
        }

        Ok(Config {
            tx_timeouts,
            abandon_age,
            watcher_interval,
            killer_interval,
            demote_grace_period: self
                .demote_grace_period
                .unwrap_or(defaults.demote_grace_period),
            promote_grace_period: self
                .promote_grace_period
                .unwrap_or(defaults.promote_grace_period),
            health_capacity,
            initial_role: self.initial_role.unwrap_or(defaults.initial_role),
        })
    }
}
