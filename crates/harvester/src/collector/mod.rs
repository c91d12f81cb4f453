//! The collector engine.
//!
//! A [`Collector`] replays one pagination sequence per fan-out item, sending
//! every page through the shared [`AsyncClient`] and persisting the parsed
//! records into a raw table. [`FinalizableCollector`] adds a per-item
//! creation-time boundary for incremental runs.
//!
//! ```ignore
//! let args = CollectorArgs::new(
//!     RawTable::new("github", "issues")?,
//!     Fingerprint::of(&json!({"repo": "rust-lang/rust"}))?,
//!     "repos/{params.repo}/issues",
//! )?
//! .with_pager(OffsetPager::new(100))
//! .with_query(page_number_query("page", "per_page"));
//!
//! let stats = Collector::new(db, client, args).execute().await?;
//! ```

mod error;
mod fingerprint;
mod finalizable;
mod input;
mod pager;
mod parser;
mod progress;
mod template;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::{AfterResponse, AsyncClient, Classified};
use crate::config::{CollectorConfig, DEFAULT_CONCURRENCY};
use crate::entity::raw_record::RawTable;
use crate::http::HttpRequest;
use crate::raw_store::{self, PendingRecord};

pub use error::{CollectorError, short_error_message};
pub use finalizable::FinalizableCollector;
pub use fingerprint::Fingerprint;
pub use input::{
    DEFAULT_QUERY_BATCH, DateBucket, DateRangeInput, InputIterator, NoInput, QueryInput, VecInput,
};
pub use pager::{
    OffsetPager, PageCursor, PageOutcome, PageRequest, Pager, QueryFn, QueryPairs, RequestFn,
    SinglePage, TokenPager, TotalPagesPager, header_total_pages, json_cursor, json_total_pages,
    offset_query, page_number_query, token_query,
};
pub use parser::{CreatedExtractor, JsonArrayParser, JsonTimestamp, ResponseParser};
pub use progress::{CollectProgress, ProgressCallback, UNKNOWN_TOTAL, emit};
pub use template::UrlTemplate;

/// Counters reported when a run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectStats {
    /// HTTP requests sent (retries excluded).
    pub requests: u64,
    /// Pages parsed and persisted.
    pub pages: u64,
    /// Records written to the raw table.
    pub records: u64,
    /// Items abandoned through `ResponseAction::Skip` or `PageOutcome::Skip`.
    pub skipped_items: u64,
}

impl CollectStats {
    /// Totals of two runs.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            requests: self.requests + other.requests,
            pages: self.pages + other.pages,
            records: self.records + other.records,
            skipped_items: self.skipped_items + other.skipped_items,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    pages: AtomicU64,
    records: AtomicU64,
    skipped_items: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CollectStats {
        CollectStats {
            requests: self.requests.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            skipped_items: self.skipped_items.load(Ordering::Relaxed),
        }
    }
}

/// Everything that describes one collection job.
///
/// `T` is the fan-out item type the query builder sees.
pub struct CollectorArgs<T> {
    table: RawTable,
    params: Fingerprint,
    url_template: UrlTemplate,
    query: Option<QueryFn<T>>,
    request: Option<RequestFn<T>>,
    pager: Arc<dyn Pager>,
    parser: Arc<dyn ResponseParser>,
    after_response: Option<Arc<dyn AfterResponse>>,
    concurrency: usize,
    incremental: bool,
}

impl<T> CollectorArgs<T> {
    /// Arguments for a single-page collector parsing a root JSON array.
    pub fn new(
        table: RawTable,
        params: Fingerprint,
        url_template: &str,
    ) -> Result<Self, CollectorError> {
        Ok(Self {
            table,
            params,
            url_template: UrlTemplate::parse(url_template)?,
            query: None,
            request: None,
            pager: Arc::new(SinglePage),
            parser: Arc::new(JsonArrayParser::root()),
            after_response: None,
            concurrency: DEFAULT_CONCURRENCY,
            incremental: false,
        })
    }

    #[must_use]
    pub fn with_query(mut self, query: QueryFn<T>) -> Self {
        self.query = Some(query);
        self
    }

    /// Per-page request hook for APIs that need a method, headers or a body
    /// beyond the rendered URL.
    #[must_use]
    pub fn with_request(mut self, request: RequestFn<T>) -> Self {
        self.request = Some(request);
        self
    }

    #[must_use]
    pub fn with_pager(mut self, pager: impl Pager + 'static) -> Self {
        self.pager = Arc::new(pager);
        self
    }

    #[must_use]
    pub fn with_parser(mut self, parser: impl ResponseParser + 'static) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    /// Response hook for this job; the client's default is used otherwise.
    #[must_use]
    pub fn with_after_response(mut self, hook: impl AfterResponse + 'static) -> Self {
        self.after_response = Some(Arc::new(hook));
        self
    }

    /// Number of fan-out items collected at once.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Keep rows from previous runs instead of replacing them.
    #[must_use]
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    #[must_use]
    pub fn with_config(self, config: &CollectorConfig) -> Self {
        self.with_concurrency(config.concurrency)
    }

    #[must_use]
    pub fn table(&self) -> &RawTable {
        &self.table
    }

    #[must_use]
    pub fn params(&self) -> &Fingerprint {
        &self.params
    }
}

enum Mode {
    Full,
    Finalizable {
        created: Arc<dyn CreatedExtractor>,
        full_sync: bool,
    },
}

struct Engine<T> {
    db: DatabaseConnection,
    client: Arc<AsyncClient>,
    args: CollectorArgs<T>,
    hook: Arc<dyn AfterResponse>,
    mode: Mode,
    counters: Counters,
    on_progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

/// Collects every page of every fan-out item into a raw table.
///
/// Unless the args are marked incremental, rows previously collected under
/// the same fingerprint are deleted first, so re-running a job replaces its
/// data instead of duplicating it.
pub struct Collector<I: InputIterator> {
    engine: Engine<I::Item>,
    input: Option<I>,
}

impl<T> Collector<NoInput<T>>
where
    T: Serialize + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(db: DatabaseConnection, client: Arc<AsyncClient>, args: CollectorArgs<T>) -> Self {
        Self::with_mode(db, client, args, Mode::Full)
    }

    fn with_mode(
        db: DatabaseConnection,
        client: Arc<AsyncClient>,
        args: CollectorArgs<T>,
        mode: Mode,
    ) -> Self {
        let hook = args
            .after_response
            .clone()
            .unwrap_or_else(|| client.after_response());
        Self {
            engine: Engine {
                db,
                client,
                args,
                hook,
                mode,
                counters: Counters::default(),
                on_progress: None,
                cancel: CancellationToken::new(),
            },
            input: None,
        }
    }
}

impl<I: InputIterator> Collector<I> {
    /// Replay the pagination sequence for every item of `input`.
    #[must_use]
    pub fn with_input<J>(self, input: J) -> Collector<J>
    where
        J: InputIterator<Item = I::Item>,
    {
        Collector {
            engine: self.engine,
            input: Some(input),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.engine.on_progress = Some(callback);
        self
    }

    /// Abort the run when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.engine.cancel = token;
        self
    }

    /// Run the collection to completion.
    ///
    /// The first fatal error cancels the remaining workers and is returned.
    /// Pages persisted before the failure are kept.
    pub async fn execute(self) -> Result<CollectStats, CollectorError> {
        let Self { engine, input } = self;
        let engine = Arc::new(engine);
        let table = engine.args.table.clone();

        engine.prepare_table().await?;

        let concurrency = if input.is_some() {
            engine.args.concurrency
        } else {
            1
        };
        tracing::info!(%table, concurrency, "Collecting raw records");
        engine.emit(CollectProgress::Started {
            table: table.to_string(),
            concurrency,
        });
        engine.emit(CollectProgress::Progress {
            current: 0,
            total: UNKNOWN_TOTAL,
        });

        let run = engine.cancel.child_token();
        let result = match input {
            None => engine.collect_item(None, &run).await,
            Some(input) => Engine::fan_out(Arc::clone(&engine), input, run.clone()).await,
        };
        run.cancel();

        let stats = engine.counters.snapshot();
        match result {
            Ok(()) => {
                tracing::info!(
                    %table,
                    requests = stats.requests,
                    pages = stats.pages,
                    records = stats.records,
                    skipped = stats.skipped_items,
                    "Collection finished"
                );
                engine.emit(CollectProgress::Finished { stats });
                Ok(stats)
            }
            Err(e) => {
                tracing::warn!(%table, pages = stats.pages, "Collection failed: {}", e);
                Err(e)
            }
        }
    }
}

impl<T> Engine<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn emit(&self, event: CollectProgress) {
        emit(self.on_progress.as_ref(), event);
    }

    async fn prepare_table(&self) -> Result<(), CollectorError> {
        let table = &self.args.table;
        raw_store::ensure_table(&self.db, table).await?;

        let replace = match &self.mode {
            Mode::Full => !self.args.incremental,
            Mode::Finalizable { full_sync, .. } => *full_sync,
        };
        if replace {
            let removed =
                raw_store::delete_by_params(&self.db, table, self.args.params.as_str()).await?;
            tracing::debug!(%table, removed, "Cleared previous rows for params");
        }
        Ok(())
    }

    async fn fan_out<I>(
        engine: Arc<Self>,
        input: I,
        run: CancellationToken,
    ) -> Result<(), CollectorError>
    where
        I: InputIterator<Item = T>,
    {
        let input = Arc::new(tokio::sync::Mutex::new(input));
        let mut workers = JoinSet::new();
        for _ in 0..engine.args.concurrency.max(1) {
            workers.spawn(Self::claim_items(
                Arc::clone(&engine),
                Arc::clone(&input),
                run.clone(),
            ));
        }

        let mut failure: Option<CollectorError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| CollectorError::Worker {
                    message: e.to_string(),
                })
                .and_then(|r| r);
            let Err(e) = result else { continue };
            run.cancel();
            // Siblings stopped by the cancellation report `Cancelled`; keep
            // the error that caused it.
            match &failure {
                None => failure = Some(e),
                Some(first) if first.is_cancelled() && !e.is_cancelled() => failure = Some(e),
                Some(_) => {}
            }
        }
        failure.map_or(Ok(()), Err)
    }

    async fn claim_items<I>(
        engine: Arc<Self>,
        input: Arc<tokio::sync::Mutex<I>>,
        run: CancellationToken,
    ) -> Result<(), CollectorError>
    where
        I: InputIterator<Item = T>,
    {
        loop {
            let item = {
                let mut input = input.lock().await;
                tokio::select! {
                    biased;
                    () = run.cancelled() => return Err(CollectorError::Cancelled),
                    next = input.next_item() => next?,
                }
            };
            let Some(item) = item else {
                return Ok(());
            };
            engine.collect_item(Some(&item), &run).await?;
        }
    }

    #[tracing::instrument(skip_all, fields(table = %self.args.table))]
    async fn collect_item(
        &self,
        input: Option<&T>,
        cancel: &CancellationToken,
    ) -> Result<(), CollectorError> {
        let (input_value, input_blob) = match input {
            Some(item) => {
                let value = serde_json::to_value(item)?;
                let blob = serde_json::to_vec(&value)?;
                (value, Some(blob))
            }
            None => (Value::Null, None),
        };
        let label = input_blob
            .as_deref()
            .map(|blob| String::from_utf8_lossy(blob).into_owned());

        let item = ItemScope {
            input,
            value: &input_value,
            blob: input_blob.as_deref(),
            label: label.as_deref(),
        };
        self.collect_pages(&item, cancel)
            .await
            .map_err(|e| match &label {
                Some(label) => e.for_input(label.clone()),
                None => e,
            })
    }

    async fn collect_pages(
        &self,
        item: &ItemScope<'_, T>,
        cancel: &CancellationToken,
    ) -> Result<(), CollectorError> {
        let table = &self.args.table;
        let params = self.args.params.as_str();

        let boundary = match &self.mode {
            Mode::Finalizable {
                full_sync: false, ..
            } => raw_store::max_record_created(&self.db, table, params, item.blob).await?,
            _ => None,
        };
        if let Some(boundary) = boundary {
            tracing::debug!(input = item.label, %boundary, "Collecting records newer than boundary");
        }

        let mut cursor = PageCursor::first(self.args.pager.page_size());
        loop {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled);
            }

            let request = self.build_request(item, &cursor)?;
            self.counters.requests.fetch_add(1, Ordering::Relaxed);
            let response = match self
                .client
                .enqueue_with(request, Arc::clone(&self.hook), cancel)
                .await?
            {
                Classified::Continue(response) => response,
                Classified::Skip(response) => {
                    tracing::warn!(
                        input = item.label,
                        status = response.status,
                        "Skipping remaining pages"
                    );
                    self.counters.skipped_items.fetch_add(1, Ordering::Relaxed);
                    self.emit(CollectProgress::ItemSkipped {
                        input: item.label.map(str::to_string),
                        status: response.status,
                    });
                    return Ok(());
                }
            };

            let blobs = self.args.parser.parse(&response)?;
            let fetched = blobs.len();
            let (records, reached) = self.prepare_batch(blobs, boundary)?;
            raw_store::insert_records(&self.db, table, params, item.blob, &records).await?;
            self.record_page(item, &cursor, records.len());

            if reached && let Some(boundary) = boundary {
                tracing::debug!(input = item.label, page = cursor.page, "Reached collection boundary");
                self.emit(CollectProgress::BoundaryReached {
                    input: item.label.map(str::to_string),
                    boundary,
                });
                return Ok(());
            }

            match self.args.pager.next(&cursor, &response, fetched)? {
                PageOutcome::Continue(token) => cursor = cursor.advance(token),
                PageOutcome::Done => return Ok(()),
                PageOutcome::Skip => {
                    tracing::debug!(input = item.label, page = cursor.page, "Pager skipped item");
                    self.counters.skipped_items.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }
    }

    fn build_request(
        &self,
        item: &ItemScope<'_, T>,
        cursor: &PageCursor,
    ) -> Result<HttpRequest, CollectorError> {
        let context = json!({
            "params": self.args.params.value(),
            "input": item.value,
            "page": cursor.page,
            "skip": cursor.skip,
            "size": cursor.size,
            "token": cursor.token,
        });
        let page = PageRequest::new(item.input, cursor);
        let mut url = self.args.url_template.render(&context)?;
        if let Some(query) = &self.args.query {
            url = append_query(url, &query(&page)?);
        }
        let request = HttpRequest::get(url);
        match &self.args.request {
            Some(hook) => hook(&page, request),
            None => Ok(request),
        }
    }

    /// Attach creation times and drop records at or before the boundary.
    ///
    /// Returns the records to persist and whether the boundary was reached.
    fn prepare_batch(
        &self,
        blobs: Vec<Vec<u8>>,
        boundary: Option<DateTime<Utc>>,
    ) -> Result<(Vec<PendingRecord>, bool), CollectorError> {
        let Mode::Finalizable { created, .. } = &self.mode else {
            return Ok((blobs.into_iter().map(PendingRecord::new).collect(), false));
        };

        let mut reached = false;
        let mut records = Vec::with_capacity(blobs.len());
        for data in blobs {
            let at = created.created(&data)?;
            if boundary.is_some_and(|boundary| at <= boundary) {
                reached = true;
                continue;
            }
            records.push(PendingRecord {
                data,
                created: Some(at),
            });
        }
        Ok((records, reached))
    }

    fn record_page(&self, item: &ItemScope<'_, T>, cursor: &PageCursor, records: usize) {
        let pages = self.counters.pages.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters
            .records
            .fetch_add(records as u64, Ordering::Relaxed);
        tracing::debug!(input = item.label, page = cursor.page, records, "Persisted page");
        self.emit(CollectProgress::PageCollected {
            input: item.label.map(str::to_string),
            page: cursor.page,
            records,
        });
        self.emit(CollectProgress::Progress {
            current: i64::try_from(pages).unwrap_or(i64::MAX),
            total: UNKNOWN_TOTAL,
        });
    }
}

/// The fan-out item being collected, in the shapes each step needs.
struct ItemScope<'a, T> {
    input: Option<&'a T>,
    value: &'a Value,
    blob: Option<&'a [u8]>,
    label: Option<&'a str>,
}

fn append_query(url: String, pairs: &QueryPairs) -> String {
    if pairs.is_empty() {
        return url;
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}
