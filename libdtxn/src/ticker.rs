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

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A background task run on a fixed period until stopped.
///
/// Must be spawned from within a tokio runtime.
pub struct PeriodicTask {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = interval.tick() => tick(),
                }
            }
            debug!("{} stopped", name);
        });

        debug!("{} started with period {:?}", name, period);
        PeriodicTask { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signals the task to stop and waits for it to exit.
    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(err) = self.handle.await {
            warn!("{} exited abnormally: {}", self.name, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn runs_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = {
            let ticks = ticks.clone();
            PeriodicTask::spawn("counter", Duration::from_millis(5), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;

        let stopped_at = ticks.load(Ordering::SeqCst);
        assert!(stopped_at >= 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), stopped_at);
    }
}
