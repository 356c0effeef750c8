use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tally_common::types::Snapshot;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::MetricBuffer;
use crate::{CollectionTask, Collector};

/// Tracks which tasks have reported since the last publish.
#[derive(Debug, Clone)]
pub struct Quorum {
    members: HashSet<CollectionTask>,
    reported: HashSet<CollectionTask>,
}

impl Quorum {
    pub fn new(members: impl IntoIterator<Item = CollectionTask>) -> Self {
        Self {
            members: members.into_iter().collect(),
            reported: HashSet::new(),
        }
    }

    /// Records a report. Returns `true` and resets when every member has
    /// reported at least once in the current cycle.
    pub fn report(&mut self, task: CollectionTask) -> bool {
        if !self.members.contains(&task) {
            return false;
        }
        self.reported.insert(task);
        if self.reported.len() == self.members.len() {
            self.reported.clear();
            return true;
        }
        false
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Runs collectors on independent timers and publishes a snapshot of the
/// shared buffer each time the quorum completes.
///
/// A snapshot is "best effort consistent": a fast task may have written
/// several times while a slow one wrote once, so fields can come from
/// different sample times.
pub struct Synchronizer {
    collectors: Vec<Box<dyn Collector>>,
    poll_interval: Duration,
    buffer: Arc<MetricBuffer>,
}

impl Synchronizer {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            collectors: Vec::new(),
            poll_interval,
            buffer: Arc::new(MetricBuffer::new()),
        }
    }

    pub fn with_collector(mut self, collector: impl Collector + 'static) -> Self {
        self.collectors.push(Box::new(collector));
        self
    }

    pub fn buffer(&self) -> Arc<MetricBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Starts one task per collector plus the barrier loop. The returned
    /// receiver yields snapshots and is closed after `token` is cancelled.
    pub fn spawn(self, token: CancellationToken) -> (mpsc::Receiver<Snapshot>, Vec<JoinHandle<()>>) {
        let (done_tx, done_rx) = mpsc::channel::<CollectionTask>(1);
        let (snapshot_tx, snapshot_rx) = mpsc::channel::<Snapshot>(1);
        let quorum = Quorum::new(self.collectors.iter().map(|c| c.task()));
        let mut handles = Vec::with_capacity(self.collectors.len() + 1);

        for collector in self.collectors {
            handles.push(tokio::spawn(run_collector(
                collector,
                self.poll_interval,
                Arc::clone(&self.buffer),
                done_tx.clone(),
                token.clone(),
            )));
        }
        drop(done_tx);

        handles.push(tokio::spawn(run_barrier(
            quorum,
            self.buffer,
            done_rx,
            snapshot_tx,
            token,
        )));

        (snapshot_rx, handles)
    }
}

async fn run_collector(
    mut collector: Box<dyn Collector>,
    poll_interval: Duration,
    buffer: Arc<MetricBuffer>,
    done_tx: mpsc::Sender<CollectionTask>,
    token: CancellationToken,
) {
    let task = collector.task();
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(collector = collector.name(), %task, interval = ?poll_interval, "Collector started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match collector.collect() {
            Ok(samples) => buffer.apply(samples),
            Err(e) => warn!(collector = collector.name(), error = %e, "Collection failed"),
        }

        // A failed probe still reports so other tasks are not held back.
        tokio::select! {
            _ = token.cancelled() => break,
            sent = done_tx.send(task) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    info!(collector = collector.name(), "Collector stopped");
}

async fn run_barrier(
    mut quorum: Quorum,
    buffer: Arc<MetricBuffer>,
    mut done_rx: mpsc::Receiver<CollectionTask>,
    snapshot_tx: mpsc::Sender<Snapshot>,
    token: CancellationToken,
) {
    info!(tasks = quorum.size(), "Synchronizer started");

    loop {
        let task = tokio::select! {
            _ = token.cancelled() => break,
            task = done_rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        if !quorum.report(task) {
            continue;
        }

        let snapshot = buffer.snapshot();
        debug!(metrics = snapshot.len(), "Publishing snapshot");
        tokio::select! {
            _ = token.cancelled() => break,
            sent = snapshot_tx.send(snapshot) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    // Dropping the sender closes the snapshot channel.
    drop(snapshot_tx);
    info!("Synchronizer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tally_common::types::{Metric, MetricKind};

    struct Fake {
        task: CollectionTask,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Fake {
        fn new(task: CollectionTask) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    task,
                    calls: Arc::clone(&calls),
                    fail: false,
                },
                calls,
            )
        }
    }

    impl Collector for Fake {
        fn task(&self) -> CollectionTask {
            self.task
        }

        fn name(&self) -> &str {
            "fake"
        }

        fn collect(&mut self) -> Result<Vec<Metric>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                anyhow::bail!("probe failed");
            }
            Ok(match self.task {
                CollectionTask::General => vec![Metric::counter("PollCount", 1)],
                CollectionTask::Additional => vec![Metric::gauge("Cycle", n as f64)],
            })
        }
    }

    #[test]
    fn quorum_requires_every_member() {
        let mut quorum = Quorum::new([CollectionTask::General, CollectionTask::Additional]);
        assert!(!quorum.report(CollectionTask::General));
        assert!(!quorum.report(CollectionTask::General));
        assert!(quorum.report(CollectionTask::Additional));

        // Reset after publishing.
        assert!(!quorum.report(CollectionTask::Additional));
        assert!(quorum.report(CollectionTask::General));
    }

    #[test]
    fn quorum_ignores_unregistered_tasks() {
        let mut quorum = Quorum::new([CollectionTask::General]);
        assert!(!quorum.report(CollectionTask::Additional));
        assert!(quorum.report(CollectionTask::General));
    }

    #[tokio::test]
    async fn publishes_after_every_task_reports() {
        let (general, general_calls) = Fake::new(CollectionTask::General);
        let (additional, additional_calls) = Fake::new(CollectionTask::Additional);
        let token = CancellationToken::new();
        let (mut rx, handles) = Synchronizer::new(Duration::from_millis(10))
            .with_collector(general)
            .with_collector(additional)
            .spawn(token.clone());

        for published in 1..=3 {
            let snapshot = rx.recv().await.unwrap();
            assert!(general_calls.load(Ordering::SeqCst) >= published);
            assert!(additional_calls.load(Ordering::SeqCst) >= published);
            assert!(snapshot.get("PollCount", MetricKind::Counter).is_some());
            assert!(snapshot.get("Cycle", MetricKind::Gauge).is_some());
        }

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn failing_collector_does_not_stall_publishing() {
        let (general, _) = Fake::new(CollectionTask::General);
        let (mut additional, _) = Fake::new(CollectionTask::Additional);
        additional.fail = true;
        let token = CancellationToken::new();
        let (mut rx, _handles) = Synchronizer::new(Duration::from_millis(10))
            .with_collector(general)
            .with_collector(additional)
            .spawn(token.clone());

        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(snapshot.get("Cycle", MetricKind::Gauge).is_none());
        token.cancel();
    }

    #[tokio::test]
    async fn cancellation_closes_snapshot_channel() {
        let (general, _) = Fake::new(CollectionTask::General);
        let token = CancellationToken::new();
        let (mut rx, handles) = Synchronizer::new(Duration::from_millis(10))
            .with_collector(general)
            .spawn(token.clone());

        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        // Drain anything published before cancellation, then expect closure.
        while rx.recv().await.is_some() {}
    }
}
