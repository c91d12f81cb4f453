use harvester::collector::{CollectProgress, UNKNOWN_TOTAL};

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, event: CollectProgress) {
        match event {
            CollectProgress::Started { table, concurrency } => {
                tracing::info!(table = %table, concurrency, "Collecting");
            }

            CollectProgress::Progress { current, total } => {
                if total == UNKNOWN_TOTAL {
                    tracing::trace!(current, "Progress");
                } else {
                    tracing::trace!(current, total, "Progress");
                }
            }

            CollectProgress::PageCollected {
                input,
                page,
                records,
            } => {
                tracing::debug!(input = ?input, page, records, "Collected page");
            }

            CollectProgress::ItemSkipped { input, status } => {
                tracing::warn!(input = ?input, status, "Skipped item");
            }

            CollectProgress::BoundaryReached { input, boundary } => {
                tracing::info!(input = ?input, boundary = %boundary, "Reached previously collected records");
            }

            CollectProgress::Finished { stats } => {
                tracing::info!(
                    requests = stats.requests,
                    pages = stats.pages,
                    records = stats.records,
                    skipped_items = stats.skipped_items,
                    "Collection complete"
                );
            }

            _ => {}
        }
    }
}

impl Default for LoggingReporter {
    fn default() -> Self {
        Self::new()
    }
}
