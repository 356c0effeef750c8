use std::sync::{Arc, RwLock};
use std::time::Duration;

use tally_common::types::Snapshot;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::Transport;

/// Holds the most recent snapshot and pushes it through every transport on
/// its own timer.
pub struct DeliveryManager {
    current: RwLock<Arc<Snapshot>>,
    transports: Vec<Box<dyn Transport>>,
    report_interval: Duration,
}

impl DeliveryManager {
    pub fn new(transports: Vec<Box<dyn Transport>>, report_interval: Duration) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            transports,
            report_interval,
        }
    }

    pub fn transport_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// The snapshot the next delivery will send.
    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(|p| p.into_inner()))
    }

    pub fn replace(&self, snapshot: Snapshot) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(snapshot);
    }

    /// Sends the current snapshot through every transport. A failing
    /// transport is logged and the next one still runs. Returns the number
    /// of transports that failed.
    pub async fn deliver(&self) -> usize {
        let snapshot = self.current();
        let mut failed = 0;
        for transport in &self.transports {
            match transport.send(&snapshot).await {
                Ok(()) => debug!(transport = transport.name(), metrics = snapshot.len(), "Delivered snapshot"),
                Err(e) => {
                    failed += 1;
                    warn!(transport = transport.name(), error = %e, "Delivery failed");
                }
            }
        }
        failed
    }

    /// Starts the subscriber loop (takes snapshots from `snapshots`) and the
    /// report loop. Both stop on cancellation without a final send.
    pub fn spawn(self: Arc<Self>, snapshots: mpsc::Receiver<Snapshot>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let subscriber = tokio::spawn(Arc::clone(&self).subscribe(snapshots, token.clone()));
        let reporter = tokio::spawn(self.report(token));
        vec![subscriber, reporter]
    }

    async fn subscribe(self: Arc<Self>, mut snapshots: mpsc::Receiver<Snapshot>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = snapshots.recv() => match next {
                    Some(snapshot) => self.replace(snapshot),
                    None => break,
                },
            }
        }
        debug!("Snapshot subscriber stopped");
    }

    async fn report(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.report_interval, self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval = ?self.report_interval,
            transports = ?self.transport_names(),
            "Delivery loop started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let failed = self.deliver().await;
                    debug!(failed, "Delivery cycle complete");
                }
            }
        }
        info!("Delivery loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tally_common::types::Metric;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<(&'static str, usize)>>>,
    }

    struct Fake {
        name: &'static str,
        fail: bool,
        recorder: Recorder,
    }

    #[async_trait]
    impl Transport for Fake {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn send(&self, snapshot: &Snapshot) -> Result<()> {
            self.recorder.sent.lock().unwrap().push((self.name, snapshot.len()));
            if self.fail {
                bail!("unreachable");
            }
            Ok(())
        }
    }

    fn fake(name: &'static str, fail: bool, recorder: &Recorder) -> Box<dyn Transport> {
        Box::new(Fake {
            name,
            fail,
            recorder: recorder.clone(),
        })
    }

    fn snapshot(n: i64) -> Snapshot {
        vec![Metric::counter("PollCount", n), Metric::gauge("Alloc", n as f64)]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn starts_with_empty_snapshot() {
        let manager = DeliveryManager::new(Vec::new(), Duration::from_secs(10));
        assert!(manager.current().is_empty());
        assert!(manager.current().taken_at.is_none());
    }

    #[tokio::test]
    async fn failing_transport_does_not_stop_the_cycle() {
        let recorder = Recorder::default();
        let manager = DeliveryManager::new(
            vec![
                fake("plain", true, &recorder),
                fake("json", false, &recorder),
                fake("batch", false, &recorder),
            ],
            Duration::from_secs(10),
        );
        manager.replace(snapshot(1));

        assert_eq!(manager.deliver().await, 1);
        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("plain", 2), ("json", 2), ("batch", 2)]);
    }

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let manager = DeliveryManager::new(Vec::new(), Duration::from_secs(10));
        let held = {
            manager.replace(snapshot(1));
            manager.current()
        };
        manager.replace(snapshot(2));

        assert_eq!(held.get("PollCount", tally_common::types::MetricKind::Counter).and_then(Metric::delta), Some(1));
        assert_eq!(
            manager
                .current()
                .get("PollCount", tally_common::types::MetricKind::Counter)
                .and_then(Metric::delta),
            Some(2)
        );
    }

    #[tokio::test]
    async fn loops_deliver_received_snapshots_until_cancelled() {
        let recorder = Recorder::default();
        let manager = Arc::new(DeliveryManager::new(
            vec![fake("batch", false, &recorder)],
            Duration::from_millis(20),
        ));
        let (tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let handles = Arc::clone(&manager).spawn(rx, token.clone());

        tx.send(snapshot(3)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let sent = recorder.sent.lock().unwrap().clone();
        assert!(sent.iter().any(|(_, n)| *n == 2), "snapshot never delivered: {sent:?}");
        let after_cancel = sent.len();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.sent.lock().unwrap().len(), after_cancel);
    }
}
