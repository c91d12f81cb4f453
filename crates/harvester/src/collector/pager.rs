//! Pagination strategies.
//!
//! A [`Pager`] looks at the page just fetched and decides whether another
//! page exists. Cursors always restart at page 1 for every fan-out item.

use std::sync::Arc;

use crate::http::{HttpRequest, HttpResponse};

use super::CollectorError;

/// Query pairs appended to a request URL.
pub type QueryPairs = Vec<(String, String)>;

/// Builds the query string for one page.
pub type QueryFn<T> =
    Arc<dyn Fn(&PageRequest<'_, T>) -> Result<QueryPairs, CollectorError> + Send + Sync>;

/// Adjusts the request built for one page: method, headers or body.
///
/// Receives the request with its URL already rendered.
pub type RequestFn<T> = Arc<
    dyn Fn(&PageRequest<'_, T>, HttpRequest) -> Result<HttpRequest, CollectorError> + Send + Sync,
>;

/// Where pagination stands within one fan-out item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    /// 1-based page number.
    pub page: u32,
    /// Records requested before this page.
    pub skip: u64,
    /// Requested page size; 0 when the endpoint is not paginated.
    pub size: u32,
    /// Continuation token produced by the previous page.
    pub token: Option<String>,
}

impl PageCursor {
    #[must_use]
    pub fn first(size: u32) -> Self {
        Self {
            page: 1,
            skip: 0,
            size,
            token: None,
        }
    }

    #[must_use]
    pub fn advance(&self, token: Option<String>) -> Self {
        Self {
            page: self.page + 1,
            skip: self.skip + u64::from(self.size),
            size: self.size,
            token,
        }
    }
}

/// Everything the query builder may need for one page.
#[derive(Debug)]
pub struct PageRequest<'a, T> {
    /// The fan-out item, if the collector has an input iterator.
    pub input: Option<&'a T>,
    pub page: u32,
    pub skip: u64,
    pub size: u32,
    pub token: Option<&'a str>,
}

impl<'a, T> PageRequest<'a, T> {
    #[must_use]
    pub fn new(input: Option<&'a T>, cursor: &'a PageCursor) -> Self {
        Self {
            input,
            page: cursor.page,
            skip: cursor.skip,
            size: cursor.size,
            token: cursor.token.as_deref(),
        }
    }
}

/// What to do after a page has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Fetch the next page, carrying the continuation token if any.
    Continue(Option<String>),
    /// Pagination ended normally.
    Done,
    /// Abandon this item's remaining pages without failing the run.
    Skip,
}

/// Decides whether another page exists.
pub trait Pager: Send + Sync {
    /// Page size to request; 0 disables paging.
    fn page_size(&self) -> u32;

    /// Called after each page with the number of records it held.
    fn next(
        &self,
        cursor: &PageCursor,
        response: &HttpResponse,
        records: usize,
    ) -> Result<PageOutcome, CollectorError>;
}

/// A single request per item.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePage;

impl Pager for SinglePage {
    fn page_size(&self) -> u32 {
        0
    }

    fn next(&self, _: &PageCursor, _: &HttpResponse, _: usize) -> Result<PageOutcome, CollectorError> {
        Ok(PageOutcome::Done)
    }
}

/// Page-number/offset pagination that stops on the first short page.
#[derive(Debug, Clone, Copy)]
pub struct OffsetPager {
    size: u32,
    max_items: Option<u64>,
}

impl OffsetPager {
    #[must_use]
    pub fn new(size: u32) -> Self {
        Self {
            size: size.max(1),
            max_items: None,
        }
    }

    /// Stop once this many records have been fetched for an item.
    #[must_use]
    pub fn max_items(mut self, max_items: u64) -> Self {
        self.max_items = Some(max_items);
        self
    }
}

impl Pager for OffsetPager {
    fn page_size(&self) -> u32 {
        self.size
    }

    fn next(
        &self,
        cursor: &PageCursor,
        _: &HttpResponse,
        records: usize,
    ) -> Result<PageOutcome, CollectorError> {
        if records < self.size as usize {
            return Ok(PageOutcome::Done);
        }
        let fetched = cursor.skip + records as u64;
        if self.max_items.is_some_and(|max| fetched >= max) {
            return Ok(PageOutcome::Done);
        }
        Ok(PageOutcome::Continue(None))
    }
}

/// Cursor pagination driven by a caller function.
///
/// The function receives the cursor of the page just fetched and its
/// response, and returns the outcome for the next page. A page shorter than
/// the page size ends pagination without consulting it.
pub struct TokenPager<F> {
    size: u32,
    next_token: F,
}

impl<F> TokenPager<F>
where
    F: Fn(&PageCursor, &HttpResponse) -> Result<PageOutcome, CollectorError> + Send + Sync,
{
    #[must_use]
    pub fn new(size: u32, next_token: F) -> Self {
        Self { size, next_token }
    }
}

impl<F> Pager for TokenPager<F>
where
    F: Fn(&PageCursor, &HttpResponse) -> Result<PageOutcome, CollectorError> + Send + Sync,
{
    fn page_size(&self) -> u32 {
        self.size
    }

    fn next(
        &self,
        cursor: &PageCursor,
        response: &HttpResponse,
        records: usize,
    ) -> Result<PageOutcome, CollectorError> {
        if self.size > 0 && records < self.size as usize {
            return Ok(PageOutcome::Done);
        }
        (self.next_token)(cursor, response)
    }
}

/// Page-number pagination bounded by a total page count the API reports.
///
/// `total_pages` reads the count from each response. When it returns
/// `None` the pager falls back to stopping on the first short page. An
/// empty page always ends pagination.
pub struct TotalPagesPager<F> {
    size: u32,
    total_pages: F,
}

impl<F> TotalPagesPager<F>
where
    F: Fn(&HttpResponse) -> Result<Option<u32>, CollectorError> + Send + Sync,
{
    #[must_use]
    pub fn new(size: u32, total_pages: F) -> Self {
        Self {
            size: size.max(1),
            total_pages,
        }
    }
}

impl<F> Pager for TotalPagesPager<F>
where
    F: Fn(&HttpResponse) -> Result<Option<u32>, CollectorError> + Send + Sync,
{
    fn page_size(&self) -> u32 {
        self.size
    }

    fn next(
        &self,
        cursor: &PageCursor,
        response: &HttpResponse,
        records: usize,
    ) -> Result<PageOutcome, CollectorError> {
        if records == 0 {
            return Ok(PageOutcome::Done);
        }
        match (self.total_pages)(response)? {
            Some(total) if cursor.page >= total => Ok(PageOutcome::Done),
            Some(_) => Ok(PageOutcome::Continue(None)),
            None if records < self.size as usize => Ok(PageOutcome::Done),
            None => Ok(PageOutcome::Continue(None)),
        }
    }
}

/// Total page count read from a JSON body field such as `/total_pages`.
pub fn json_total_pages(
    pointer: impl Into<String>,
) -> impl Fn(&HttpResponse) -> Result<Option<u32>, CollectorError> + Send + Sync {
    let pointer = pointer.into();
    move |response: &HttpResponse| -> Result<Option<u32>, CollectorError> {
        let body: serde_json::Value = response.json()?;
        let total = match body.pointer(&pointer) {
            Some(serde_json::Value::Number(n)) => n.as_u64(),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };
        Ok(total.map(|t| u32::try_from(t).unwrap_or(u32::MAX)))
    }
}

/// Total page count read from a response header such as `x-total-pages`.
pub fn header_total_pages(
    name: impl Into<String>,
) -> impl Fn(&HttpResponse) -> Result<Option<u32>, CollectorError> + Send + Sync {
    let name = name.into();
    move |response: &HttpResponse| -> Result<Option<u32>, CollectorError> {
        Ok(response.header(&name).and_then(|v| v.trim().parse().ok()))
    }
}

/// Token function reading the next cursor from a JSON body field.
///
/// `pointer` is a JSON pointer such as `/meta/next_cursor`. A missing, null
/// or empty value ends pagination.
pub fn json_cursor(
    pointer: impl Into<String>,
) -> impl Fn(&PageCursor, &HttpResponse) -> Result<PageOutcome, CollectorError> + Send + Sync {
    let pointer = pointer.into();
    move |_: &PageCursor, response: &HttpResponse| -> Result<PageOutcome, CollectorError> {
        let body: serde_json::Value = response.json()?;
        let token = match body.pointer(&pointer) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Ok(PageOutcome::Done),
        };
        Ok(PageOutcome::Continue(Some(token)))
    }
}

/// Query builder emitting `page` and page-size parameters.
pub fn page_number_query<T: 'static>(
    page_key: impl Into<String>,
    size_key: impl Into<String>,
) -> QueryFn<T> {
    let (page_key, size_key) = (page_key.into(), size_key.into());
    Arc::new(move |req: &PageRequest<'_, T>| -> Result<QueryPairs, CollectorError> {
        Ok(vec![
            (page_key.clone(), req.page.to_string()),
            (size_key.clone(), req.size.to_string()),
        ])
    })
}

/// Query builder emitting offset (`skip`) and limit parameters.
pub fn offset_query<T: 'static>(
    skip_key: impl Into<String>,
    size_key: impl Into<String>,
) -> QueryFn<T> {
    let (skip_key, size_key) = (skip_key.into(), size_key.into());
    Arc::new(move |req: &PageRequest<'_, T>| -> Result<QueryPairs, CollectorError> {
        Ok(vec![
            (skip_key.clone(), req.skip.to_string()),
            (size_key.clone(), req.size.to_string()),
        ])
    })
}

/// Query builder passing the continuation token, when present, as `token_key`.
///
/// The page size is sent as `size_key` when one is given.
pub fn token_query<T: 'static>(
    token_key: impl Into<String>,
    size_key: Option<String>,
) -> QueryFn<T> {
    let token_key = token_key.into();
    Arc::new(move |req: &PageRequest<'_, T>| -> Result<QueryPairs, CollectorError> {
        let mut pairs = QueryPairs::new();
        if let Some(size_key) = &size_key {
            pairs.push((size_key.clone(), req.size.to_string()));
        }
        if let Some(token) = req.token {
            pairs.push((token_key.clone(), token.to_string()));
        }
        Ok(pairs)
    })
}
