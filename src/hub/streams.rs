//! Upload stream bookkeeping
//!
//! Every stream ID a client declares on an invocation becomes an entry here,
//! backed by a channel of `stream_buffer_capacity` items that the hub method
//! reads. The reader never waits on that channel: an item that does not fit
//! fails its own stream and the reader keeps dispatching unrelated messages.
//!
//! How a stream ended travels beside the channel in a [`StreamOutcome`], so
//! a completion never needs a free slot.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// How an upload stream finished
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnd {
    /// The client completed the stream, with its error text if it failed
    Completed(Option<String>),
    /// More items arrived than the stream buffer holds
    Overflowed { capacity: usize },
    /// The invocation or the connection ended first
    Closed,
}

/// End state shared between the reader and the consumer of one stream.
/// Only the first end is kept.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome(Arc<Mutex<Option<StreamEnd>>>);

impl StreamOutcome {
    fn slot(&self) -> MutexGuard<'_, Option<StreamEnd>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, end: StreamEnd) {
        let mut slot = self.slot();
        if slot.is_none() {
            *slot = Some(end);
        }
    }

    pub fn get(&self) -> Option<StreamEnd> {
        self.slot().clone()
    }
}

/// Consumer half of one upload stream
#[derive(Debug)]
pub struct UploadChannel {
    id: String,
    rx: mpsc::Receiver<Value>,
    outcome: StreamOutcome,
}

impl UploadChannel {
    pub fn into_parts(self) -> (String, mpsc::Receiver<Value>, StreamOutcome) {
        (self.id, self.rx, self.outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A stream with this ID is already active
    DuplicateId(String),
    /// No active stream with this ID
    UnknownStream(String),
    /// The consumer stopped reading
    Closed(String),
    /// The stream buffer was full; the stream has been failed
    Overflow { id: String, capacity: usize },
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::DuplicateId(id) => write!(f, "Invocation ID '{}' is already in use.", id),
            StreamError::UnknownStream(id) => write!(f, "Unknown stream ID '{}'.", id),
            StreamError::Closed(id) => write!(f, "Stream '{}' is no longer being read.", id),
            StreamError::Overflow { id, capacity } => write!(
                f,
                "Stream '{}' exceeded its buffer of {} item(s).",
                id, capacity
            ),
        }
    }
}

impl std::error::Error for StreamError {}

struct StreamEntry {
    tx: mpsc::Sender<Value>,
    outcome: StreamOutcome,
}

/// Active upload streams of one connection.
pub struct StreamManager {
    streams: Mutex<HashMap<String, StreamEntry>>,
    capacity: usize,
}

impl StreamManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open one stream per ID. Fails without opening anything if any ID is taken.
    pub fn open(&self, ids: &[String]) -> Result<Vec<UploadChannel>, StreamError> {
        let mut streams = self.streams();

        for (i, id) in ids.iter().enumerate() {
            if streams.contains_key(id) || ids[..i].contains(id) {
                return Err(StreamError::DuplicateId(id.clone()));
            }
        }

        let mut channels = Vec::with_capacity(ids.len());
        for id in ids {
            let (tx, rx) = mpsc::channel(self.capacity);
            let outcome = StreamOutcome::default();
            streams.insert(
                id.clone(),
                StreamEntry {
                    tx,
                    outcome: outcome.clone(),
                },
            );
            channels.push(UploadChannel {
                id: id.clone(),
                rx,
                outcome,
            });
        }
        Ok(channels)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.streams().contains_key(id)
    }

    /// Queue an item for the stream. Never blocks; a full buffer fails the
    /// stream and later items for it are unknown.
    pub fn route_item(&self, id: &str, item: Value) -> Result<(), StreamError> {
        let mut streams = self.streams();
        let entry = streams
            .get(id)
            .ok_or_else(|| StreamError::UnknownStream(id.to_string()))?;

        match entry.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                if let Some(entry) = streams.remove(id) {
                    entry.outcome.set(StreamEnd::Overflowed {
                        capacity: self.capacity,
                    });
                }
                Err(StreamError::Overflow {
                    id: id.to_string(),
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(StreamError::Closed(id.to_string())),
        }
    }

    /// Finish a stream, optionally with the client's error. Returns false if unknown.
    pub fn complete(&self, id: &str, error: Option<String>) -> bool {
        match self.streams().remove(id) {
            Some(entry) => {
                entry.outcome.set(StreamEnd::Completed(error));
                true
            }
            None => false,
        }
    }

    /// Close streams left open by an invocation that has finished.
    pub fn close_for_invocation(&self, ids: &[String]) {
        let mut streams = self.streams();
        for id in ids {
            if let Some(entry) = streams.remove(id) {
                entry.outcome.set(StreamEnd::Closed);
                tracing::debug!("Closing upload stream '{}' after its invocation completed", id);
            }
        }
    }

    /// Drop every stream; used when the connection ends.
    pub fn close_all(&self) {
        for (_, entry) in self.streams().drain() {
            entry.outcome.set(StreamEnd::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let manager = StreamManager::new(2);
        manager.open(&["a".to_string()]).unwrap();

        assert_eq!(
            manager.open(&["b".to_string(), "a".to_string()]).unwrap_err(),
            StreamError::DuplicateId("a".to_string())
        );
        assert!(!manager.contains("b"));

        assert!(manager.open(&["c".to_string(), "c".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_completion_needs_no_free_slot() {
        let manager = StreamManager::new(2);
        let mut channels = manager.open(&["s".to_string()]).unwrap();
        let (_, mut rx, outcome) = channels.remove(0).into_parts();

        manager.route_item("s", json!(1)).unwrap();
        manager.route_item("s", json!(2)).unwrap();
        assert!(manager.complete("s", None));

        assert_eq!(rx.recv().await, Some(json!(1)));
        assert_eq!(rx.recv().await, Some(json!(2)));
        assert_eq!(rx.recv().await, None);
        assert_eq!(outcome.get(), Some(StreamEnd::Completed(None)));
    }

    #[tokio::test]
    async fn test_overflow_fails_only_that_stream() {
        let manager = StreamManager::new(2);
        let mut channels = manager
            .open(&["s".to_string(), "t".to_string()])
            .unwrap();
        let (_, mut rx, outcome) = channels.remove(0).into_parts();

        manager.route_item("s", json!(1)).unwrap();
        manager.route_item("s", json!(2)).unwrap();
        assert_eq!(
            manager.route_item("s", json!(3)),
            Err(StreamError::Overflow {
                id: "s".to_string(),
                capacity: 2
            })
        );
        assert_eq!(
            manager.route_item("s", json!(4)),
            Err(StreamError::UnknownStream("s".to_string()))
        );
        assert!(manager.route_item("t", json!(1)).is_ok());

        assert_eq!(rx.recv().await, Some(json!(1)));
        assert_eq!(rx.recv().await, Some(json!(2)));
        assert_eq!(rx.recv().await, None);
        assert_eq!(outcome.get(), Some(StreamEnd::Overflowed { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_items_after_close_are_rejected() {
        let manager = StreamManager::new(2);
        let mut channels = manager.open(&["s".to_string()]).unwrap();
        let (_, _rx, outcome) = channels.remove(0).into_parts();

        manager.close_for_invocation(&["s".to_string()]);
        assert_eq!(
            manager.route_item("s", json!(1)),
            Err(StreamError::UnknownStream("s".to_string()))
        );
        assert!(!manager.complete("s", None));
        assert_eq!(outcome.get(), Some(StreamEnd::Closed));
    }

    #[tokio::test]
    async fn test_dropped_consumer_reports_closed() {
        let manager = StreamManager::new(1);
        let channels = manager.open(&["s".to_string()]).unwrap();
        drop(channels);

        assert_eq!(
            manager.route_item("s", json!(1)),
            Err(StreamError::Closed("s".to_string()))
        );
    }
}
