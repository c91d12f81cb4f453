//! Fan-out inputs.
//!
//! An [`InputIterator`] yields the items a collector replays its pagination
//! sequence for (one repository, one job, one date bucket...). Iterators are
//! consumed once per run; workers claim items one at a time under a lock.

use std::collections::VecDeque;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    DatabaseConnection, EntityTrait, Iterable, PaginatorTrait, PrimaryKeyToColumn, QueryOrder,
    Select,
};
use serde::Serialize;

use super::CollectorError;

/// Default number of rows fetched per query by [`QueryInput`].
pub const DEFAULT_QUERY_BATCH: u64 = 500;

/// A lazy, finite sequence of fan-out items.
#[async_trait]
pub trait InputIterator: Send + 'static {
    type Item: Serialize + Send + Sync + 'static;

    /// The next item, or `None` once exhausted.
    async fn next_item(&mut self) -> Result<Option<Self::Item>, CollectorError>;
}

/// Placeholder for collectors that run a single pagination sequence.
pub struct NoInput<T>(PhantomData<fn() -> T>);

impl<T> Default for NoInput<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

#[async_trait]
impl<T> InputIterator for NoInput<T>
where
    T: Serialize + Send + Sync + 'static,
{
    type Item = T;

    async fn next_item(&mut self) -> Result<Option<T>, CollectorError> {
        Ok(None)
    }
}

/// Items known up front.
#[derive(Debug)]
pub struct VecInput<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> From<Vec<T>> for VecInput<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl<T> InputIterator for VecInput<T>
where
    T: Serialize + Send + Sync + 'static,
{
    type Item = T;

    async fn next_item(&mut self) -> Result<Option<T>, CollectorError> {
        Ok(self.items.next())
    }
}

/// One time bucket produced by [`DateRangeInput`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Consecutive `[start, end)` buckets for time-partitioned report APIs.
///
/// The final bucket is truncated at `end`.
#[derive(Debug, Clone)]
pub struct DateRangeInput {
    next: DateTime<Utc>,
    end: DateTime<Utc>,
    step: Duration,
}

impl DateRangeInput {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Self, CollectorError> {
        if step <= Duration::zero() {
            return Err(CollectorError::config("date range step must be positive"));
        }
        Ok(Self {
            next: start,
            end,
            step,
        })
    }
}

#[async_trait]
impl InputIterator for DateRangeInput {
    type Item = DateBucket;

    async fn next_item(&mut self) -> Result<Option<DateBucket>, CollectorError> {
        if self.next >= self.end {
            return Ok(None);
        }
        let start = self.next;
        let end = (start + self.step).min(self.end);
        self.next = end;
        Ok(Some(DateBucket { start, end }))
    }
}

/// Rows of a database query, fetched in batches.
///
/// The primary key is appended to the select's ordering, so pages never
/// overlap or skip rows even when the caller's own ordering has ties. Each
/// batch is a separate paginator fetch, so no connection is held while
/// items are being collected.
pub struct QueryInput<E: EntityTrait> {
    db: DatabaseConnection,
    select: Select<E>,
    batch: u64,
    page: u64,
    buffer: VecDeque<E::Model>,
    exhausted: bool,
}

impl<E: EntityTrait> QueryInput<E> {
    #[must_use]
    pub fn new(db: DatabaseConnection, select: Select<E>) -> Self {
        let select = E::PrimaryKey::iter()
            .fold(select, |select, key| select.order_by_asc(key.into_column()));
        Self {
            db,
            select,
            batch: DEFAULT_QUERY_BATCH,
            page: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    #[must_use]
    pub fn batch_size(mut self, batch: u64) -> Self {
        self.batch = batch.max(1);
        self
    }
}

#[async_trait]
impl<E> InputIterator for QueryInput<E>
where
    E: EntityTrait + 'static,
    E::Model: Serialize + Send + Sync + 'static,
{
    type Item = E::Model;

    async fn next_item(&mut self) -> Result<Option<E::Model>, CollectorError> {
        if self.buffer.is_empty() && !self.exhausted {
            let rows = self
                .select
                .clone()
                .paginate(&self.db, self.batch)
                .fetch_page(self.page)
                .await?;
            self.page += 1;
            self.exhausted = (rows.len() as u64) < self.batch;
            self.buffer.extend(rows);
        }
        Ok(self.buffer.pop_front())
    }
}
