//! Incremental collection bounded by previously collected data.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use sea_orm::DatabaseConnection;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::client::AsyncClient;

use super::{
    CollectStats, Collector, CollectorArgs, CollectorError, CreatedExtractor, InputIterator, Mode,
    NoInput, ProgressCallback,
};

type DetailsRun = Pin<Box<dyn Future<Output = Result<CollectStats, CollectorError>> + Send>>;

/// Second pass re-collecting records that were not final when listed.
type DetailsPass =
    Box<dyn FnOnce(DatabaseConnection, Arc<AsyncClient>, CancellationToken) -> DetailsRun + Send>;

/// Collector for reverse-chronological APIs that only fetches what is new.
///
/// For each fan-out item the boundary is the newest creation time already
/// stored under the same fingerprint and item. Records created at or before
/// it are discarded, and pagination stops after the first page that held
/// one. Without a boundary the item is backfilled until its natural end.
///
/// Rows from earlier runs are kept; [`full_sync`](Self::full_sync) replaces
/// them and ignores the boundary.
///
/// Records listed before they reached a final state (an open issue, a
/// running pipeline) never cross the boundary again. An
/// [unfinished-details](Self::with_unfinished_details) pass re-collects
/// them after the listing.
pub struct FinalizableCollector<I: InputIterator> {
    inner: Collector<I>,
    details: Option<DetailsPass>,
}

impl<T> FinalizableCollector<NoInput<T>>
where
    T: Serialize + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(
        db: DatabaseConnection,
        client: Arc<AsyncClient>,
        args: CollectorArgs<T>,
        created: impl CreatedExtractor + 'static,
    ) -> Self {
        let mode = Mode::Finalizable {
            created: Arc::new(created),
            full_sync: false,
        };
        Self {
            inner: Collector::with_mode(db, client, args, mode),
            details: None,
        }
    }
}

impl<I: InputIterator> FinalizableCollector<I> {
    #[must_use]
    pub fn with_input<J>(self, input: J) -> FinalizableCollector<J>
    where
        J: InputIterator<Item = I::Item>,
    {
        FinalizableCollector {
            inner: self.inner.with_input(input),
            details: self.details,
        }
    }

    /// After the listing, replay `args` for every item of `input`.
    ///
    /// `input` typically selects the unfinished records from a tool table.
    /// It is only pulled once the listing has finished, so a lazy iterator
    /// such as [`QueryInput`](super::QueryInput) sees this run's rows. The
    /// pass appends to the raw table and is skipped on full syncs. `args`
    /// normally name the same table and params as the listing.
    #[must_use]
    pub fn with_unfinished_details<J>(mut self, args: CollectorArgs<J::Item>, input: J) -> Self
    where
        J: InputIterator,
    {
        self.details = Some(Box::new(move |db, client, cancel| {
            Box::pin(async move {
                Collector::new(db, client, args.incremental(true))
                    .with_input(input)
                    .with_cancellation(cancel)
                    .execute()
                    .await
            })
        }));
        self
    }

    /// Delete previously collected rows and collect everything again.
    #[must_use]
    pub fn full_sync(mut self, full_sync: bool) -> Self {
        if let Mode::Finalizable { full_sync: flag, .. } = &mut self.inner.engine.mode {
            *flag = full_sync;
        }
        self
    }

    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.inner = self.inner.with_progress(callback);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.inner = self.inner.with_cancellation(token);
        self
    }

    pub async fn execute(self) -> Result<CollectStats, CollectorError> {
        let Self { inner, details } = self;
        let engine = &inner.engine;
        let full_sync = matches!(engine.mode, Mode::Finalizable { full_sync: true, .. });
        let handles = (
            engine.db.clone(),
            Arc::clone(&engine.client),
            engine.cancel.clone(),
        );

        let listed = inner.execute().await?;
        let Some(details) = details else {
            return Ok(listed);
        };
        if full_sync {
            tracing::debug!("Full sync collected every record; skipping unfinished details");
            return Ok(listed);
        }

        let (db, client, cancel) = handles;
        let refreshed = details(db, client, cancel).await?;
        Ok(listed.merge(refreshed))
    }
}
