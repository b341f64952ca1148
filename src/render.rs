//! Wire rendering of store snapshots.
//!
//! Format: `Front:{car} | Left:{} | Right:{person,bike}`. Streams appear in
//! configured order, labels in detector order, and a stream without data
//! renders exactly like one that detected nothing.

use serde::{Deserialize, Serialize};

use crate::store::{SnapshotEntry, StoreSnapshot};

pub const STREAM_SEPARATOR: &str = " | ";
pub const LABEL_SEPARATOR: &str = ",";

/// Body of `GET /detections`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionsResponse {
    pub detections: String,
}

pub fn render_detections(snapshot: &StoreSnapshot) -> String {
    snapshot
        .iter()
        .map(render_entry)
        .collect::<Vec<_>>()
        .join(STREAM_SEPARATOR)
}

fn render_entry(entry: &SnapshotEntry) -> String {
    let labels = entry
        .detections()
        .map(|set| set.iter().collect::<Vec<_>>().join(LABEL_SEPARATOR))
        .unwrap_or_default();
    format!("{}:{{{}}}", entry.stream, labels)
}
