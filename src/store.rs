//! Shared detection store.
//!
//! Holds the latest `DetectionSet` per configured stream. Each stream has its
//! own slot guarded by a short-lived mutex: `publish` swaps in a new `Arc`,
//! `snapshot` clones the `Arc`s out. Neither side holds a lock across any I/O
//! or detector work, so readers and writers cannot starve each other.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::detect::DetectionSet;
use crate::stream::StreamId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("stream '{0}' is not configured in the detection store")]
    UnknownStream(StreamId),
}

/// One published detection set with its bookkeeping.
#[derive(Clone, Debug)]
pub struct Publication {
    pub detections: Arc<DetectionSet>,
    pub published_at: Instant,
    /// 1 for the first publish on a stream, then strictly increasing.
    pub sequence: u64,
}

impl Publication {
    pub fn age(&self) -> Duration {
        self.published_at.elapsed()
    }
}

struct StreamSlot {
    stream: StreamId,
    latest: Mutex<Option<Publication>>,
}

impl StreamSlot {
    fn read(&self) -> Option<Publication> {
        // The slot only ever holds a fully built value, so a poisoned lock
        // still guards consistent data.
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Latest detections per stream, for a fixed set of streams.
pub struct DetectionStore {
    slots: Vec<StreamSlot>,
    index: HashMap<StreamId, usize>,
}

impl DetectionStore {
    /// Create a store for the given streams, in rendering order.
    pub fn new<I: IntoIterator<Item = StreamId>>(streams: I) -> Result<Self> {
        let mut slots = Vec::new();
        let mut index = HashMap::new();
        for stream in streams {
            if index.contains_key(&stream) {
                return Err(anyhow!("stream '{}' configured more than once", stream));
            }
            index.insert(stream.clone(), slots.len());
            slots.push(StreamSlot {
                stream,
                latest: Mutex::new(None),
            });
        }
        if slots.is_empty() {
            return Err(anyhow!("detection store needs at least one stream"));
        }
        Ok(Self { slots, index })
    }

    /// Replace the detection set for `stream`. Returns the publication sequence.
    pub fn publish(&self, stream: &StreamId, detections: DetectionSet) -> Result<u64, PublishError> {
        let slot = self
            .index
            .get(stream)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| PublishError::UnknownStream(stream.clone()))?;
        let detections = Arc::new(detections);

        let mut latest = slot.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = latest.as_ref().map_or(1, |p| p.sequence + 1);
        *latest = Some(Publication {
            detections,
            published_at: Instant::now(),
            sequence,
        });
        Ok(sequence)
    }

    /// Copy of the current state of every stream, in configured order.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            entries: self
                .slots
                .iter()
                .map(|slot| SnapshotEntry {
                    stream: slot.stream.clone(),
                    publication: slot.read(),
                })
                .collect(),
        }
    }

    /// Latest publication for one stream. `None` when the stream is unknown or
    /// has no data yet.
    pub fn latest(&self, stream: &StreamId) -> Option<Publication> {
        self.index.get(stream).and_then(|&i| self.slots[i].read())
    }

    pub fn contains(&self, stream: &StreamId) -> bool {
        self.index.contains_key(stream)
    }
}

/// One stream's state inside a `StoreSnapshot`.
#[derive(Clone, Debug)]
pub struct SnapshotEntry {
    pub stream: StreamId,
    /// `None` until the stream's first successful detection cycle.
    pub publication: Option<Publication>,
}

impl SnapshotEntry {
    pub fn detections(&self) -> Option<&DetectionSet> {
        self.publication.as_ref().map(|p| p.detections.as_ref())
    }

    pub fn has_data(&self) -> bool {
        self.publication.is_some()
    }
}

/// Point-in-time copy of the store. Each stream's value is individually
/// consistent; values of different streams may come from different instants.
#[derive(Clone, Debug)]
pub struct StoreSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl StoreSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.iter()
    }

    pub fn entry(&self, stream: &str) -> Option<&SnapshotEntry> {
        self.entries.iter().find(|e| e.stream.as_str() == stream)
    }

    /// Detections for `stream`; `None` if unknown or no data yet.
    pub fn detections(&self, stream: &str) -> Option<&DetectionSet> {
        self.entry(stream).and_then(SnapshotEntry::detections)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
