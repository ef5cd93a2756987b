mod error;

pub use error::Error;

use crate::broker::BrokerError;
use crate::topic::TopicFilter;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default time a batch stays open after its first topic arrives.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(10);

/// Receiver of flushed subscription batches.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    /// Subscribes every topic of the batch in one round trip.
    async fn subscribe_batch(&self, topics: Vec<TopicFilter>) -> Result<(), BrokerError>;
}

type Settlement = Shared<BoxFuture<'static, Result<(), Error>>>;

struct Batch {
    topics: BTreeSet<TopicFilter>,
    locked: bool,
    settled: Settlement,
}

/// Coalesces subscribe requests arriving within a window into one batch.
///
/// The window is a fixed deadline measured from the first topic of a batch.
/// At most one batch is open at a time; once it starts flushing it is locked
/// and further requests fail with [`Error::FlushInProgress`] until it settles.
pub struct Debouncer {
    window: Duration,
    sink: Arc<dyn BatchSink>,
    slot: Arc<Mutex<Option<Batch>>>,
    flushed: Arc<AtomicU64>,
}

impl Debouncer {
    /// Creates a debouncer flushing into `sink` after `window`.
    pub fn new(window: Duration, sink: Arc<dyn BatchSink>) -> Self {
        Self {
            window,
            sink,
            slot: Arc::new(Mutex::new(None)),
            flushed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The batching window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Number of batches flushed so far, successful or not.
    #[must_use]
    pub fn batches_flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Whether a batch is currently open or flushing.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Adds `topic` to the open batch, opening one if needed, and waits for
    /// the batch to settle.
    ///
    /// # Errors
    /// Returns [`Error::FlushInProgress`] without waiting if the open batch is
    /// already flushing, or the batch's shared outcome otherwise.
    pub async fn subscribe(&self, topic: TopicFilter) -> Result<(), Error> {
        let settled = self.join(topic)?;
        settled.await
    }

    fn join(&self, topic: TopicFilter) -> Result<Settlement, Error> {
        let mut slot = self.slot.lock();

        if let Some(batch) = slot.as_mut() {
            if batch.locked {
                return Err(Error::FlushInProgress);
            }
            batch.topics.insert(topic);
            return Ok(batch.settled.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let settled = receiver
            .map(|outcome| outcome.unwrap_or(Err(Error::Aborted)))
            .boxed()
            .shared();

        *slot = Some(Batch {
            topics: BTreeSet::from([topic]),
            locked: false,
            settled: settled.clone(),
        });
        drop(slot);

        tokio::spawn(flush(
            self.window,
            Arc::clone(&self.slot),
            Arc::clone(&self.sink),
            Arc::clone(&self.flushed),
            sender,
        ));

        Ok(settled)
    }
}

async fn flush(
    window: Duration,
    slot: Arc<Mutex<Option<Batch>>>,
    sink: Arc<dyn BatchSink>,
    flushed: Arc<AtomicU64>,
    sender: oneshot::Sender<Result<(), Error>>,
) {
    tokio::time::sleep(window).await;

    let topics: Vec<TopicFilter> = {
        let mut slot = slot.lock();
        let Some(batch) = slot.as_mut() else {
            return;
        };
        batch.locked = true;
        batch.topics.iter().cloned().collect()
    };

    debug!(count = topics.len(), "flushing subscription batch");
    let outcome = sink.subscribe_batch(topics).await.map_err(Error::from);
    if let Err(e) = &outcome {
        warn!("subscription batch failed: {e}");
    }

    // Free the slot before waking callers so a retry opens a fresh batch.
    slot.lock().take();
    flushed.fetch_add(1, Ordering::Relaxed);
    let _ = sender.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<TopicFilter>>>,
        fail: bool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn subscribe_batch(&self, topics: Vec<TopicFilter>) -> Result<(), BrokerError> {
            self.batches.lock().push(topics);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                Err(BrokerError::Subscribe("refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::new(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_one_batch() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = Debouncer::new(DEFAULT_WINDOW, sink.clone());

        let (a, b, c) = tokio::join!(
            debouncer.subscribe(filter("a")),
            debouncer.subscribe(filter("b/+")),
            debouncer.subscribe(filter("a")),
        );

        assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));
        assert_eq!(*sink.batches.lock(), vec![vec![filter("a"), filter("b/+")]]);
        assert_eq!(debouncer.batches_flushed(), 1);
        assert!(debouncer.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rejects_every_caller() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let debouncer = Debouncer::new(DEFAULT_WINDOW, sink.clone());

        let (a, b) = tokio::join!(
            debouncer.subscribe(filter("a")),
            debouncer.subscribe(filter("b")),
        );

        let expected = Err(Error::Broker(BrokerError::Subscribe("refused".to_string())));
        assert_eq!(a, expected);
        assert_eq!(b, expected);
        assert_eq!(sink.batches.lock().len(), 1);
        assert!(debouncer.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_during_flush_fails_fast() {
        let gate = Arc::new(Notify::new());
        let sink = Arc::new(RecordingSink {
            gate: Some(gate.clone()),
            ..RecordingSink::default()
        });
        let debouncer = Arc::new(Debouncer::new(DEFAULT_WINDOW, sink.clone()));

        let first = tokio::spawn({
            let debouncer = Arc::clone(&debouncer);
            async move { debouncer.subscribe(filter("a")).await }
        });

        tokio::time::sleep(DEFAULT_WINDOW * 2).await;
        assert_eq!(sink.batches.lock().len(), 1);

        assert_matches!(
            debouncer.subscribe(filter("b")).await,
            Err(Error::FlushInProgress)
        );

        gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(()));

        // The retry opens a fresh batch.
        gate.notify_one();
        assert_eq!(debouncer.subscribe(filter("b")).await, Ok(()));
        assert_eq!(sink.batches.lock().len(), 2);
        assert_eq!(sink.batches.lock()[1], vec![filter("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_is_fixed_from_first_topic() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = Arc::new(Debouncer::new(Duration::from_millis(10), sink.clone()));

        let first = tokio::spawn({
            let debouncer = Arc::clone(&debouncer);
            async move { debouncer.subscribe(filter("a")).await }
        });
        tokio::time::sleep(Duration::from_millis(6)).await;

        let second = tokio::spawn({
            let debouncer = Arc::clone(&debouncer);
            async move { debouncer.subscribe(filter("b")).await }
        });
        tokio::time::sleep(Duration::from_millis(6)).await;

        // 12ms after the first topic: a refreshed window would still be open.
        assert_eq!(sink.batches.lock().len(), 1);
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_completes_without_waiters() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = Debouncer::new(DEFAULT_WINDOW, sink.clone());

        drop(debouncer.join(filter("a")).unwrap());
        tokio::time::sleep(DEFAULT_WINDOW * 2).await;

        assert_eq!(sink.batches.lock().len(), 1);
        assert!(debouncer.is_idle());
    }
}
