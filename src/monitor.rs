//! Periodic counter store health monitoring.
//!
//! The monitor is a background tokio task that pings the store on a fixed
//! interval and hands every outcome to a callback. It is stopped through the
//! returned [`MonitorHandle`]; a stop request interrupts both the wait between
//! polls and an in-flight ping, so it takes effect immediately.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::store::{CounterStore, StoreResult};

/// Outcome of a successful health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStatus {
    /// Round-trip time of the ping
    pub latency: Duration,
    pub checked_at: DateTime<Utc>,
}

/// Spawns store health monitors.
pub struct StatusMonitor;

impl StatusMonitor {
    /// Start polling `store` every `interval`, reporting to `callback`.
    ///
    /// The first poll happens immediately. Failed probes are reported and
    /// polling continues.
    pub fn spawn<S, F>(store: Arc<S>, interval: Duration, mut callback: F) -> MonitorHandle
    where
        S: CounterStore + ?Sized + 'static,
        F: FnMut(StoreResult<StoreStatus>) + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let started = Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    result = store.ping() => result,
                };

                callback(result.map(|()| StoreStatus {
                    latency: started.elapsed(),
                    checked_at: Utc::now(),
                }));
            }

            debug!("Store monitor stopped");
        });

        MonitorHandle {
            stop_tx,
            task: Some(task),
        }
    }
}

/// Stop handle for a running monitor. Dropping it also stops the monitor.
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for its task to finish.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
    }
}
