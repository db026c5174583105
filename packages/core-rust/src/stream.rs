//! Record streaming between steps.
//!
//! A producing step pushes records into a [`Sink`]; a later step pulls them
//! from the paired [`Source`]. The pair returned by [`channel`] is joined
//! by a bounded queue: the producer waits once the queue is full and the
//! consumer waits until a record arrives.
//!
//! Cancellation is cooperative. [`Source::cancel`] raises a flag that the
//! producer observes through [`Sink::is_cancelled`] and through a
//! [`StreamError::Cancelled`] result from [`Sink::next`]. An error pushed by
//! either side ends the sequence for both. A sink dropped without
//! `complete` or `error` ends the sequence with [`StreamError::Incomplete`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::types::Value;

/// Per-record metadata (content type, key, offsets).
pub type Metadata = BTreeMap<String, String>;

/// One element of a stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub value: Value,
    pub metadata: Metadata,
}

impl Record {
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream cancelled by consumer")]
    Cancelled,
    #[error("stream closed")]
    Closed,
    #[error("stream failed: {0}")]
    Failed(String),
    #[error("stream ended without completion")]
    Incomplete,
}

/// Consumer side of a record stream.
#[async_trait]
pub trait Source: Send + Sync {
    /// Yields the next record, or `Ok(None)` once at end of stream and on
    /// every call after that.
    ///
    /// # Errors
    ///
    /// Returns the error pushed by the producer, if any.
    async fn next(&self) -> Result<Option<Record>, StreamError>;

    /// Asks the producer to stop.
    fn cancel(&self);
}

/// Producer side of a record stream.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Pushes one record, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// [`StreamError::Cancelled`] if the consumer cancelled,
    /// [`StreamError::Closed`] after `complete`/`error` or once the consumer
    /// is gone.
    async fn next(&self, record: Record) -> Result<(), StreamError>;

    /// Ends the stream normally.
    fn complete(&self);

    /// Ends the stream with an error visible to the consumer.
    async fn error(&self, err: StreamError);

    fn is_cancelled(&self) -> bool;
}

type Item = Result<Record, StreamError>;

/// Creates a bounded sink/source pair.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity);
    let cancelled = Arc::new(AtomicBool::new(false));
    let ended = Arc::new(AtomicBool::new(false));
    (
        ChannelSink {
            tx: Mutex::new(Some(tx)),
            cancelled: Arc::clone(&cancelled),
            ended: Arc::clone(&ended),
        },
        ChannelSource {
            rx: tokio::sync::Mutex::new(rx),
            finished: AtomicBool::new(false),
            cancelled,
            ended,
        },
    )
}

pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<Item>>>,
    cancelled: Arc<AtomicBool>,
    /// Set by `complete` and `error`.
    ended: Arc<AtomicBool>,
}

impl ChannelSink {
    fn sender(&self) -> Option<mpsc::Sender<Item>> {
        self.tx.lock().clone()
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn next(&self, record: Record) -> Result<(), StreamError> {
        if self.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let tx = self.sender().ok_or(StreamError::Closed)?;
        tx.send(Ok(record)).await.map_err(|_| {
            if self.is_cancelled() {
                StreamError::Cancelled
            } else {
                StreamError::Closed
            }
        })
    }

    fn complete(&self) {
        self.ended.store(true, Ordering::Release);
        self.tx.lock().take();
    }

    async fn error(&self, err: StreamError) {
        self.ended.store(true, Ordering::Release);
        let tx = self.tx.lock().take();
        if let Some(tx) = tx {
            // Consumer may already be gone; nothing left to notify.
            let _ = tx.send(Err(err)).await;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub struct ChannelSource {
    rx: tokio::sync::Mutex<mpsc::Receiver<Item>>,
    finished: AtomicBool,
    cancelled: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
}

#[async_trait]
impl Source for ChannelSource {
    async fn next(&self) -> Result<Option<Record>, StreamError> {
        if self.finished.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(err)) => {
                self.finished.store(true, Ordering::Release);
                rx.close();
                Err(err)
            }
            None => {
                self.finished.store(true, Ordering::Release);
                let abandoned =
                    !self.ended.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire);
                if abandoned {
                    Err(StreamError::Incomplete)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

/// Drains `source` into a vector.
///
/// # Errors
///
/// Returns the first error produced by the source.
pub async fn collect(source: &dyn Source) -> Result<Vec<Record>, StreamError> {
    let mut out = Vec::new();
    while let Some(record) = source.next().await? {
        out.push(record);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn records_arrive_in_order_then_single_end() {
        let (sink, source) = channel(4);
        let producer = tokio::spawn(async move {
            for i in 0..10 {
                sink.next(Record::new(i)).await.unwrap();
            }
            sink.complete();
        });
        let mut seen = Vec::new();
        while let Some(r) = source.next().await.unwrap() {
            seen.push(r.value);
        }
        producer.await.unwrap();
        assert_eq!(seen, (0..10).map(Value::from).collect::<Vec<_>>());
        assert_eq!(source.next().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn producer_blocks_when_full() {
        let (sink, source) = channel(2);
        sink.next(Record::new(1)).await.unwrap();
        sink.next(Record::new(2)).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), sink.next(Record::new(3))).await;
        assert!(blocked.is_err(), "third push should wait for capacity");

        assert_eq!(source.next().await.unwrap().unwrap().value, Value::Int(1));
        sink.next(Record::new(3)).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_is_visible_to_producer() {
        let (sink, source) = channel(1);
        source.cancel();
        assert!(sink.is_cancelled());
        assert_eq!(sink.next(Record::new(1)).await, Err(StreamError::Cancelled));
    }

    #[tokio::test]
    async fn producer_error_ends_stream() {
        let (sink, source) = channel(4);
        sink.next(Record::new("a")).await.unwrap();
        sink.error(StreamError::Failed("disk".into())).await;
        assert_eq!(source.next().await.unwrap().unwrap().value, Value::from("a"));
        assert_eq!(
            source.next().await,
            Err(StreamError::Failed("disk".into()))
        );
        assert_eq!(source.next().await.unwrap(), None);
        assert_eq!(sink.next(Record::new("b")).await, Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn dropped_sink_is_not_a_clean_end() {
        let (sink, source) = channel(4);
        sink.next(Record::new(1)).await.unwrap();
        drop(sink);
        assert_eq!(source.next().await.unwrap().unwrap().value, Value::Int(1));
        assert_eq!(source.next().await, Err(StreamError::Incomplete));
        assert_eq!(source.next().await.unwrap(), None);

        let (sink, source) = channel(4);
        source.cancel();
        drop(sink);
        assert_eq!(source.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn collect_drains_source() {
        let (sink, source) = channel(8);
        for v in ["x", "y"] {
            sink.next(Record::new(v).with_metadata("k", v)).await.unwrap();
        }
        sink.complete();
        let records = collect(&source).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].metadata.get("k").map(String::as_str), Some("y"));
    }
}
