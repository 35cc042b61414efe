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

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Wall clock used to stamp durable records and compute their age.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Default, Clone)]
pub struct SystemTimeSource {}

impl SystemTimeSource {
    pub fn new() -> Self {
        SystemTimeSource {}
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A time source which only moves when told to.
pub struct ManualTimeSource {
    now: Mutex<SystemTime>,
}

impl ManualTimeSource {
    pub fn new(start: SystemTime) -> Self {
        ManualTimeSource {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        ManualTimeSource::new(SystemTime::now())
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

pub(crate) fn to_unix_nanos(time: SystemTime) -> u64 {
    // Times before the epoch are clamped; durable records are never stamped that early.
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub(crate) fn from_unix_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// Age of `then` as observed at `now`; zero if `then` lies in the future.
pub(crate) fn age(now: SystemTime, then: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_time_source_advances() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = ManualTimeSource::new(start);

        clock.advance(Duration::from_secs(2));

        assert_eq!(clock.now(), start + Duration::from_secs(2));
        assert_eq!(age(clock.now(), start), Duration::from_secs(2));
        assert_eq!(age(start, clock.now()), Duration::ZERO);
    }

    #[test]
    fn unix_nanos_round_trip() {
        let t = UNIX_EPOCH + Duration::from_nanos(1_234_567_890);
        assert_eq!(from_unix_nanos(to_unix_nanos(t)), t);
    }
}
