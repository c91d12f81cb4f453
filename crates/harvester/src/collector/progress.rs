//! Progress events emitted while a collector runs.

use chrono::{DateTime, Utc};

use super::CollectStats;

/// `total` value reported when the number of items is not known in advance.
pub const UNKNOWN_TOTAL: i64 = -1;

/// Progress events emitted during a collection run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CollectProgress {
    /// The run is starting.
    Started {
        /// Raw table being written.
        table: String,
        /// Number of fan-out workers.
        concurrency: usize,
    },

    /// Running totals. `total` is [`UNKNOWN_TOTAL`] unless known up front.
    Progress { current: i64, total: i64 },

    /// A page was fetched and persisted.
    PageCollected {
        /// Serialized fan-out item, if any.
        input: Option<String>,
        /// Page number (1-indexed).
        page: u32,
        /// Records persisted from this page.
        records: usize,
    },

    /// The response hook asked to skip the rest of an item.
    ItemSkipped {
        input: Option<String>,
        /// HTTP status of the skipped response.
        status: u16,
    },

    /// An incremental run reached records it already had.
    BoundaryReached {
        input: Option<String>,
        boundary: DateTime<Utc>,
    },

    /// The run finished successfully.
    Finished { stats: CollectStats },
}

/// Callback for progress updates during collection.
pub type ProgressCallback = Box<dyn Fn(CollectProgress) + Send + Sync>;

/// Emit a progress event if a callback is provided.
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: CollectProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}
