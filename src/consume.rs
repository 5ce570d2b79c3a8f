//! At-least-once consumer stream.
//!
//! The inbound mirror of the publisher: a source offers committable records
//! into a bounded queue, a pump transforms them in order and forwards the
//! results to the mapping sink as acknowledgeable messages, and a single
//! commit stage advances offsets once every record up to them has been
//! settled downstream.
//!
//! Backpressure is structural. The pump acquires an in-flight permit before
//! pulling from the queue, so with a stalled downstream exactly
//! `max_in_flight` records are held by settlement tasks, [`SOURCE_QUEUE_SLACK`]
//! records sit in the queue, and the next offer is rejected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::external::{ExternalMessage, Headers};
use crate::throttle::ThrottlingAlert;

/// Queue capacity on top of the in-flight bound.
pub const SOURCE_QUEUE_SLACK: usize = 2;

/// One record polled from a partitioned source.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

/// Identity of a committable offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    pub partition: i32,
    pub offset: i64,
}

/// Receives batched offset commits, in commit order per partition.
pub trait CommitSink: Send + 'static {
    fn commit(&mut self, batch: Vec<PartitionOffset>);
}

impl<F> CommitSink for F
where
    F: FnMut(Vec<PartitionOffset>) + Send + 'static,
{
    fn commit(&mut self, batch: Vec<PartitionOffset>) {
        self(batch)
    }
}

/// Transform failure classification.
///
/// Non-retryable failures may still commit their offset (configurable) to
/// avoid poison-pill stalls; retryable failures leave the offset uncommitted
/// so the source replays the record.
#[derive(Clone, Debug)]
pub enum TransformError {
    NonRetryable(String),
    Retryable(String),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonRetryable(message) => write!(f, "non-retryable: {message}"),
            Self::Retryable(message) => write!(f, "retryable: {message}"),
        }
    }
}

/// Pure record transformation applied by the pump, in order per partition.
pub type Transform =
    dyn Fn(&ConsumerRecord) -> Result<ExternalMessage, TransformError> + Send + Sync;

/// An external message whose settlement drives the offset commit.
///
/// Exactly one of [`acknowledge`](Self::acknowledge) or
/// [`reject`](Self::reject) is invoked; both consume the message, so the type
/// system enforces exactly-once settlement.
#[derive(Debug)]
pub struct AcknowledgeableMessage {
    pub message: ExternalMessage,
    settlement: oneshot::Sender<Result<(), String>>,
}

impl AcknowledgeableMessage {
    pub fn acknowledge(self) {
        let _ = self.settlement.send(Ok(()));
    }

    pub fn reject(self, reason: impl Into<String>) {
        let _ = self.settlement.send(Err(reason.into()));
    }
}

/// Rejected offer into the source queue.
#[derive(Debug)]
pub enum OfferRejected {
    /// The stream is saturated; back off and retry.
    Full(ConsumerRecord),
    /// The stream has stopped.
    Closed(ConsumerRecord),
}

/// Producer side of the bounded source queue.
#[derive(Clone)]
pub struct SourceQueue {
    tx: mpsc::Sender<ConsumerRecord>,
}

impl SourceQueue {
    /// Offers a record without blocking.
    pub fn offer(&self, record: ConsumerRecord) -> Result<(), OfferRejected> {
        self.tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(record) => OfferRejected::Full(record),
            mpsc::error::TrySendError::Closed(record) => OfferRejected::Closed(record),
        })
    }
}

/// Stream configuration, extracted from [`Config`].
#[derive(Clone, Copy, Debug)]
pub struct ConsumerStreamConfig {
    pub max_in_flight: usize,
    pub commit_on_transform_failure: bool,
}

impl ConsumerStreamConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_in_flight: config.kafka_max_in_flight(),
            commit_on_transform_failure: config.commit_on_transform_failure(),
        }
    }
}

enum CommitMsg {
    /// A record entered the stream; emitted in pump order.
    Track(PartitionOffset),
    /// A record settled; `commit` decides whether its offset may advance.
    Settled { at: PartitionOffset, commit: bool },
}

/// Spawns the consumer stream.
///
/// Returns the source queue to offer records into and the pump's join handle.
/// Cancellation stops the pump after its last commit; unsettled records are
/// simply redelivered by the source.
pub fn spawn(
    config: ConsumerStreamConfig,
    transform: Arc<Transform>,
    sink: mpsc::Sender<AcknowledgeableMessage>,
    commit: impl CommitSink,
    throttle: Option<Arc<ThrottlingAlert>>,
    cancel: CancellationToken,
) -> (SourceQueue, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(SOURCE_QUEUE_SLACK);
    let handle = tokio::spawn(run(config, transform, sink, commit, throttle, cancel, rx));
    (SourceQueue { tx }, handle)
}

async fn run(
    config: ConsumerStreamConfig,
    transform: Arc<Transform>,
    sink: mpsc::Sender<AcknowledgeableMessage>,
    commit: impl CommitSink,
    throttle: Option<Arc<ThrottlingAlert>>,
    cancel: CancellationToken,
    mut queue: mpsc::Receiver<ConsumerRecord>,
) {
    let semaphore = Arc::new(Semaphore::new(config.max_in_flight));
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let commit_task = tokio::spawn(commit_stage(results_rx, commit));

    loop {
        // In-flight bound first: the queue keeps its slack for the source.
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = queue.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        if let Some(alert) = &throttle {
            pause_while_throttled(alert, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            alert.counter().increment();
        }

        let at = PartitionOffset {
            partition: record.partition,
            offset: record.offset,
        };
        let _ = results_tx.send(CommitMsg::Track(at));

        match (transform.as_ref())(&record) {
            Ok(message) => {
                let (settle_tx, settle_rx) = oneshot::channel();
                let sink = sink.clone();
                let results_tx = results_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if sink
                        .send(AcknowledgeableMessage {
                            message,
                            settlement: settle_tx,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        settled = settle_rx => {
                            let commit = match settled {
                                Ok(Ok(())) => true,
                                Ok(Err(reason)) => {
                                    tracing::warn!(
                                        partition = at.partition,
                                        offset = at.offset,
                                        "downstream rejected record: {reason}"
                                    );
                                    false
                                }
                                // Settlement dropped without a verdict.
                                Err(_) => false,
                            };
                            let _ = results_tx.send(CommitMsg::Settled { at, commit });
                        }
                    }
                });
            }
            Err(TransformError::NonRetryable(message)) => {
                tracing::warn!(
                    partition = at.partition,
                    offset = at.offset,
                    "dropping record, transform failed: {message}"
                );
                let _ = results_tx.send(CommitMsg::Settled {
                    at,
                    commit: config.commit_on_transform_failure,
                });
            }
            Err(TransformError::Retryable(message)) => {
                tracing::warn!(
                    partition = at.partition,
                    offset = at.offset,
                    "leaving record uncommitted for replay, transform failed: {message}"
                );
                let _ = results_tx.send(CommitMsg::Settled { at, commit: false });
            }
        }
    }

    queue.close();
    drop(results_tx);
    let _ = commit_task.await;
}

async fn pause_while_throttled(alert: &ThrottlingAlert, cancel: &CancellationToken) {
    use crate::throttle::AlertState;

    while alert.check() == AlertState::AboveLimit {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
        }
    }
}

/// Single consumer of settlement results; the only place offsets advance.
async fn commit_stage(mut rx: mpsc::UnboundedReceiver<CommitMsg>, mut sink: impl CommitSink) {
    let mut tracker = OffsetTracker::default();

    while let Some(msg) = rx.recv().await {
        let mut batch = Vec::new();
        tracker.apply(msg, &mut batch);
        // Drain whatever else already arrived so commits batch up.
        while let Ok(msg) = rx.try_recv() {
            tracker.apply(msg, &mut batch);
        }
        if !batch.is_empty() {
            sink.commit(batch);
        }
    }
}

#[derive(Default)]
struct OffsetTracker {
    partitions: HashMap<i32, BTreeMap<i64, bool>>,
}

impl OffsetTracker {
    fn apply(&mut self, msg: CommitMsg, batch: &mut Vec<PartitionOffset>) {
        match msg {
            CommitMsg::Track(at) => {
                self.partitions
                    .entry(at.partition)
                    .or_default()
                    .insert(at.offset, false);
            }
            CommitMsg::Settled { at, commit } => {
                if !commit {
                    // The unsettled entry blocks the watermark: nothing past
                    // this offset commits until the source replays it.
                    return;
                }
                if let Some(watermark) = self.acknowledge(at) {
                    batch.push(watermark);
                }
            }
        }
    }

    /// Marks `at` settled and advances the partition watermark over the
    /// contiguous settled prefix. Returns the new watermark, if it moved.
    fn acknowledge(&mut self, at: PartitionOffset) -> Option<PartitionOffset> {
        let outstanding = self.partitions.get_mut(&at.partition)?;
        if let Some(settled) = outstanding.get_mut(&at.offset) {
            *settled = true;
        }

        let mut watermark = None;
        while let Some(entry) = outstanding.first_entry() {
            if !entry.get() {
                break;
            }
            watermark = Some(PartitionOffset {
                partition: at.partition,
                offset: *entry.key(),
            });
            entry.remove();
        }
        watermark
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn record(partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            partition,
            offset,
            key: None,
            headers: Headers::new(),
            payload: Bytes::from_static(b"{}"),
        }
    }

    fn passthrough() -> Arc<Transform> {
        Arc::new(|record: &ConsumerRecord| {
            Ok(ExternalMessage::bytes(record.payload.clone()))
        })
    }

    fn collecting_sink() -> (Arc<Mutex<Vec<Vec<PartitionOffset>>>>, impl CommitSink) {
        let commits: Arc<Mutex<Vec<Vec<PartitionOffset>>>> = Arc::default();
        let writer = commits.clone();
        (commits, move |batch: Vec<PartitionOffset>| {
            writer.lock().unwrap().push(batch)
        })
    }

    #[tokio::test]
    async fn backpressure_rejects_after_max_in_flight_plus_slack() {
        let max_in_flight = 4;
        let (commits, commit) = collecting_sink();
        // Downstream never settles: messages pile up behind held permits.
        let (sink_tx, _sink_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let (queue, _handle) = spawn(
            ConsumerStreamConfig {
                max_in_flight,
                commit_on_transform_failure: true,
            },
            passthrough(),
            sink_tx,
            commit,
            None,
            cancel.clone(),
        );

        let mut accepted = 0;
        for offset in 0..(max_in_flight + SOURCE_QUEUE_SLACK + 1) as i64 {
            // Give the pump time to pull what it can.
            tokio::time::sleep(Duration::from_millis(20)).await;
            match queue.offer(record(0, offset)) {
                Ok(()) => accepted += 1,
                Err(OfferRejected::Full(_)) => break,
                Err(OfferRejected::Closed(_)) => panic!("stream closed unexpectedly"),
            }
        }

        assert_eq!(accepted, max_in_flight + SOURCE_QUEUE_SLACK);
        assert!(matches!(
            queue.offer(record(0, 99)),
            Err(OfferRejected::Full(_))
        ));
        assert!(commits.lock().unwrap().is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn offsets_commit_in_order_per_partition() {
        let (commits, commit) = collecting_sink();
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let (queue, handle) = spawn(
            ConsumerStreamConfig {
                max_in_flight: 4,
                commit_on_transform_failure: true,
            },
            passthrough(),
            sink_tx,
            commit,
            None,
            cancel.clone(),
        );

        for offset in 0..3 {
            loop {
                match queue.offer(record(0, offset)) {
                    Ok(()) => break,
                    Err(OfferRejected::Full(_)) => {
                        tokio::time::sleep(Duration::from_millis(5)).await
                    }
                    Err(OfferRejected::Closed(_)) => panic!("stream closed"),
                }
            }
        }

        let mut inbound = Vec::new();
        for _ in 0..3 {
            inbound.push(sink_rx.recv().await.unwrap());
        }

        // Settle out of order: 2, 0, 1.
        inbound.remove(2).acknowledge();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(commits.lock().unwrap().is_empty());

        inbound.remove(0).acknowledge();
        inbound.remove(0).acknowledge();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();

        let observed: Vec<i64> = commits
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|at| at.offset)
            .collect();
        assert!(!observed.is_empty());
        // Monotone, and the final watermark covers everything settled.
        assert!(observed.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(observed.last(), Some(&2));
    }

    #[tokio::test]
    async fn non_retryable_transform_failure_commits_by_default() {
        let (commits, commit) = collecting_sink();
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let transform: Arc<Transform> = Arc::new(|_: &ConsumerRecord| {
            Err(TransformError::NonRetryable("bad payload".to_owned()))
        });

        let (queue, handle) = spawn(
            ConsumerStreamConfig {
                max_in_flight: 4,
                commit_on_transform_failure: true,
            },
            transform,
            sink_tx,
            commit,
            None,
            cancel.clone(),
        );

        queue.offer(record(0, 0)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();

        let observed: Vec<PartitionOffset> =
            commits.lock().unwrap().iter().flatten().copied().collect();
        assert_eq!(
            observed,
            vec![PartitionOffset {
                partition: 0,
                offset: 0
            }]
        );
    }

    #[tokio::test]
    async fn retryable_transform_failure_blocks_the_watermark() {
        let (commits, commit) = collecting_sink();
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let transform: Arc<Transform> = Arc::new(|record: &ConsumerRecord| {
            if record.offset == 0 {
                Err(TransformError::Retryable("broker hiccup".to_owned()))
            } else {
                Ok(ExternalMessage::bytes(record.payload.clone()))
            }
        });

        let (queue, handle) = spawn(
            ConsumerStreamConfig {
                max_in_flight: 4,
                commit_on_transform_failure: true,
            },
            transform,
            sink_tx,
            commit,
            None,
            cancel.clone(),
        );

        queue.offer(record(0, 0)).unwrap();
        queue.offer(record(0, 1)).unwrap();

        // Offset 1 settles fine, but offset 0 was never committed.
        sink_rx.recv().await.unwrap().acknowledge();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();

        assert!(commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_messages_leave_offsets_uncommitted() {
        let (commits, commit) = collecting_sink();
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let (queue, handle) = spawn(
            ConsumerStreamConfig {
                max_in_flight: 4,
                commit_on_transform_failure: true,
            },
            passthrough(),
            sink_tx,
            commit,
            None,
            cancel.clone(),
        );

        queue.offer(record(0, 0)).unwrap();
        sink_rx.recv().await.unwrap().reject("mapping failed");
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        handle.await.unwrap();

        assert!(commits.lock().unwrap().is_empty());
    }
}
