//! Integration tests for collection runs.
//!
//! Every run goes through the real client worker pool and an in-memory
//! SQLite raw table; only the HTTP transport is scripted.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use harvester::collector::{
    CollectProgress, Collector, CollectorArgs, CollectorError, FinalizableCollector, Fingerprint,
    JsonArrayParser, JsonTimestamp, OffsetPager, PageCursor, PageOutcome, PageRequest, QueryPairs,
    SinglePage, TokenPager, TotalPagesPager, VecInput, header_total_pages, page_number_query,
};
use harvester::http::HttpMethod;
use harvester::raw_store::{self, PendingRecord};
use harvester::retry::RetryConfig;
use harvester::{AsyncClient, HttpRequest, HttpResponse, IgnoreNotFound, RateLimiter, RawTable};
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{RUN_TIMEOUT, client, memory_db, paced_client, records};

fn table() -> RawTable {
    RawTable::new("test", "items").unwrap()
}

fn params() -> Fingerprint {
    Fingerprint::of(&json!({"connection_id": 1})).unwrap()
}

fn paged_args(size: u32) -> CollectorArgs<()> {
    CollectorArgs::new(table(), params(), "items")
        .unwrap()
        .with_pager(OffsetPager::new(size))
        .with_query(page_number_query("page", "per_page"))
}

fn page_path(page: u32, size: u32) -> String {
    format!("items?page={page}&per_page={size}")
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn stamped(id: i64, offset_secs: i64) -> serde_json::Value {
    let created = t0() + chrono::Duration::seconds(offset_secs);
    json!({"id": id, "created_at": created.to_rfc3339()})
}

#[tokio::test]
async fn offset_pages_stop_on_short_page() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(&page_path(1, 50), records(0, 50));
    transport.respond_json(&page_path(2, 50), records(50, 50));
    transport.respond_json(&page_path(3, 50), records(100, 30));
    let db = memory_db().await;

    let stats = timeout(
        RUN_TIMEOUT,
        Collector::new(db.clone(), client(&transport, 2), paged_args(50)).execute(),
    )
    .await
    .expect("collection timed out")
    .unwrap();

    assert_eq!(transport.requests().len(), 3);
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.pages, 3);
    assert_eq!(stats.records, 130);

    let rows = raw_store::load_records(&db, &table(), params().as_str())
        .await
        .unwrap();
    assert_eq!(rows.len(), 130);
    assert_eq!(rows[0].data, br#"{"id":0}"#.to_vec());
    assert!(rows.iter().all(|r| r.input.is_none()));
}

#[tokio::test]
async fn rerun_replaces_rows_for_same_params() {
    let transport = common::FixtureTransport::new();
    for _ in 0..2 {
        transport.respond_json(&page_path(1, 10), records(0, 10));
        transport.respond_json(&page_path(2, 10), records(10, 4));
    }
    let db = memory_db().await;
    let table = table();

    // Rows under another fingerprint must survive both runs.
    raw_store::ensure_table(&db, &table).await.unwrap();
    raw_store::insert_records(
        &db,
        &table,
        r#"{"connection_id":2}"#,
        None,
        &[PendingRecord::new(b"{}".to_vec())],
    )
    .await
    .unwrap();

    let client = client(&transport, 2);
    for _ in 0..2 {
        Collector::new(db.clone(), Arc::clone(&client), paged_args(10))
            .execute()
            .await
            .unwrap();
    }

    let first: Vec<Vec<u8>> = raw_store::load_records(&db, &table, params().as_str())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.data)
        .collect();
    assert_eq!(first.len(), 14);
    assert_eq!(
        raw_store::count_records(&db, &table, r#"{"connection_id":2}"#)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn incremental_args_keep_previous_rows() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(&page_path(1, 10), records(0, 3));
    transport.respond_json(&page_path(1, 10), records(3, 2));
    let db = memory_db().await;
    let client = client(&transport, 1);

    for _ in 0..2 {
        Collector::new(db.clone(), Arc::clone(&client), paged_args(10).incremental(true))
            .execute()
            .await
            .unwrap();
    }
    assert_eq!(
        raw_store::count_records(&db, &table(), params().as_str())
            .await
            .unwrap(),
        5
    );
}

#[tokio::test]
async fn token_pager_done_ends_successfully() {
    let transport = common::FixtureTransport::new();
    transport.respond_json("feed", json!({"items": [1, 2], "next": "c2"}));
    transport.respond_json("feed?cursor=c2", json!({"items": [3], "next": null}));
    let db = memory_db().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_pager = Arc::clone(&calls);
    let pager = TokenPager::new(
        0,
        move |_: &PageCursor, _: &HttpResponse| -> Result<PageOutcome, CollectorError> {
            match calls_in_pager.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(PageOutcome::Continue(Some("c2".to_string()))),
                _ => Ok(PageOutcome::Done),
            }
        },
    );
    let args: CollectorArgs<()> = CollectorArgs::new(table(), params(), "feed")
        .unwrap()
        .with_pager(pager)
        .with_parser(JsonArrayParser::at(["items"]))
        .with_query(Arc::new(
            |req: &PageRequest<'_, ()>| -> Result<QueryPairs, CollectorError> {
                Ok(req
                    .token
                    .map(|t| vec![("cursor".to_string(), t.to_string())])
                    .unwrap_or_default())
            },
        ));

    let stats = Collector::new(db.clone(), client(&transport, 1), args)
        .execute()
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(transport.requests().len(), 2);
    assert_eq!(stats.records, 3);
}

#[tokio::test]
async fn fan_out_concurrency_is_bounded() {
    let transport = common::FixtureTransport::new().with_delay(Duration::from_millis(20));
    for id in 0..10 {
        transport.respond_json(&format!("repos/{id}/issues"), records(id * 100, 2));
    }
    let db = memory_db().await;

    let args = CollectorArgs::new(table(), params(), "repos/{input}/issues")
        .unwrap()
        .with_concurrency(3);
    let stats = timeout(
        RUN_TIMEOUT,
        Collector::new(db.clone(), client(&transport, 10), args)
            .with_input(VecInput::from((0..10).collect::<Vec<usize>>()))
            .execute(),
    )
    .await
    .expect("collection timed out")
    .unwrap();

    assert_eq!(transport.requests().len(), 10);
    assert!(transport.max_in_flight() <= 3, "saw {}", transport.max_in_flight());
    assert_eq!(stats.records, 20);

    let rows = raw_store::load_records(&db, &table(), params().as_str())
        .await
        .unwrap();
    let mut inputs: Vec<Vec<u8>> = rows.into_iter().filter_map(|r| r.input).collect();
    inputs.sort();
    inputs.dedup();
    assert_eq!(inputs.len(), 10);
}

#[tokio::test]
async fn first_error_aborts_the_run_with_item_context() {
    let transport = common::FixtureTransport::new();
    transport.respond_json("repos/1/issues", records(0, 1));
    transport.respond("repos/2/issues", HttpResponse::new(401, "bad credentials"));
    for id in 3..=5 {
        transport.respond_json(&format!("repos/{id}/issues"), records(0, 1));
    }
    let db = memory_db().await;

    let args = CollectorArgs::new(table(), params(), "repos/{input}/issues")
        .unwrap()
        .with_concurrency(1);
    let err = Collector::new(db.clone(), client(&transport, 1), args)
        .with_input(VecInput::from(vec![1u32, 2, 3, 4, 5]))
        .execute()
        .await
        .unwrap_err();

    match &err {
        CollectorError::Item { input, source } => {
            assert_eq!(input, "2");
            assert!(matches!(**source, CollectorError::Unauthorized { status: 401, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(transport.requests().len(), 2);
    // The page persisted before the failure is kept.
    assert_eq!(
        raw_store::count_records(&db, &table(), params().as_str())
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn not_found_items_are_skipped() {
    let transport = common::FixtureTransport::new();
    transport.respond("repos/gone/issues", HttpResponse::new(404, "not found"));
    transport.respond_json("repos/here/issues", records(0, 2));
    let db = memory_db().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let args = CollectorArgs::new(table(), params(), "repos/{input}/issues")
        .unwrap()
        .with_after_response(IgnoreNotFound)
        .with_concurrency(2);
    let stats = Collector::new(db.clone(), client(&transport, 2), args)
        .with_input(VecInput::from(vec!["gone", "here"]))
        .with_progress(Box::new(move |event| sink.lock().unwrap().push(event)))
        .execute()
        .await
        .unwrap();

    assert_eq!(stats.skipped_items, 1);
    assert_eq!(stats.records, 2);

    let events = events.lock().unwrap();
    assert!(matches!(events.first(), Some(CollectProgress::Started { .. })));
    assert!(matches!(events.last(), Some(CollectProgress::Finished { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        CollectProgress::ItemSkipped { input: Some(input), status: 404 } if input == "\"gone\""
    )));
}

#[tokio::test]
async fn cancelled_run_returns_cancelled() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(&page_path(1, 10), records(0, 10));
    let db = memory_db().await;
    let token = CancellationToken::new();
    token.cancel();

    let err = Collector::new(db, client(&transport, 1), paged_args(10))
        .with_cancellation(token)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, CollectorError::Cancelled));
    assert!(transport.requests().is_empty());
}

async fn seed_boundary(db: &sea_orm::DatabaseConnection, offset_secs: i64) {
    let table = table();
    raw_store::ensure_table(db, &table).await.unwrap();
    raw_store::insert_records(
        db,
        &table,
        params().as_str(),
        None,
        &[PendingRecord {
            data: stamped(0, offset_secs).to_string().into_bytes(),
            created: Some(t0() + chrono::Duration::seconds(offset_secs)),
        }],
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn finalizable_discards_records_at_or_before_boundary() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(
        &page_path(1, 5),
        json!([
            stamped(13, 3),
            stamped(12, 2),
            stamped(11, 1),
            stamped(10, 0),
            stamped(9, -1)
        ]),
    );
    let db = memory_db().await;
    seed_boundary(&db, 0).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let stats = FinalizableCollector::new(
        db.clone(),
        client(&transport, 1),
        paged_args(5),
        JsonTimestamp::field("created_at"),
    )
    .with_progress(Box::new(move |event| sink.lock().unwrap().push(event)))
    .execute()
    .await
    .unwrap();

    // A full page would normally continue; the boundary stops it.
    assert_eq!(transport.requests().len(), 1);
    assert_eq!(stats.records, 3);

    let rows = raw_store::load_records(&db, &table(), params().as_str())
        .await
        .unwrap();
    let ids: Vec<i64> = rows
        .iter()
        .map(|r| r.json::<serde_json::Value>().unwrap()["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![0, 13, 12, 11]);
    assert_eq!(
        rows[1].record_created_at(),
        Some(t0() + chrono::Duration::seconds(3))
    );
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        CollectProgress::BoundaryReached { boundary, .. } if *boundary == t0()
    )));
}

#[tokio::test]
async fn finalizable_backfills_then_collects_only_new_records() {
    let transport = common::FixtureTransport::new();
    // First run: no boundary, natural end on the short page.
    transport.respond_json(&page_path(1, 2), json!([stamped(5, 5), stamped(4, 4)]));
    transport.respond_json(&page_path(2, 2), json!([stamped(3, 3), stamped(2, 2)]));
    transport.respond_json(&page_path(3, 2), json!([stamped(1, 1)]));
    // Second run: two new records, then the boundary.
    transport.respond_json(&page_path(1, 2), json!([stamped(7, 7), stamped(6, 6)]));
    transport.respond_json(&page_path(2, 2), json!([stamped(5, 5), stamped(4, 4)]));
    let db = memory_db().await;
    let client = client(&transport, 1);

    let first = FinalizableCollector::new(
        db.clone(),
        Arc::clone(&client),
        paged_args(2),
        JsonTimestamp::field("created_at"),
    )
    .execute()
    .await
    .unwrap();
    assert_eq!(first.records, 5);

    let second = FinalizableCollector::new(
        db.clone(),
        Arc::clone(&client),
        paged_args(2),
        JsonTimestamp::field("created_at"),
    )
    .execute()
    .await
    .unwrap();
    assert_eq!(second.requests, 2);
    assert_eq!(second.records, 2);
    assert_eq!(transport.requests().len(), 5);
    assert_eq!(
        raw_store::count_records(&db, &table(), params().as_str())
            .await
            .unwrap(),
        7
    );
}

#[tokio::test]
async fn finalizable_full_sync_replaces_rows_and_ignores_boundary() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(&page_path(1, 5), json!([stamped(2, -10), stamped(1, -20)]));
    let db = memory_db().await;
    seed_boundary(&db, 0).await;

    let stats = FinalizableCollector::new(
        db.clone(),
        client(&transport, 1),
        paged_args(5),
        JsonTimestamp::field("created_at"),
    )
    .full_sync(true)
    .execute()
    .await
    .unwrap();

    assert_eq!(stats.records, 2);
    assert_eq!(
        raw_store::count_records(&db, &table(), params().as_str())
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn created_time_failure_is_fatal() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(&page_path(1, 5), json!([stamped(1, 1), {"id": 2}]));
    let db = memory_db().await;

    let err = FinalizableCollector::new(
        db.clone(),
        client(&transport, 1),
        paged_args(5),
        JsonTimestamp::field("created_at"),
    )
    .execute()
    .await
    .unwrap_err();

    assert!(matches!(err, CollectorError::CreatedTime { .. }));
    assert_eq!(
        raw_store::count_records(&db, &table(), params().as_str())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn finalizable_boundary_is_per_input() {
    let transport = common::FixtureTransport::new();
    transport.respond_json("repos/a/events", json!([stamped(3, 3), stamped(2, 2)]));
    transport.respond_json("repos/b/events", json!([stamped(1, 1)]));
    let db = memory_db().await;

    // Item "a" already has data up to t0+2; item "b" has nothing.
    let table = table();
    raw_store::ensure_table(&db, &table).await.unwrap();
    raw_store::insert_records(
        &db,
        &table,
        params().as_str(),
        Some(br#""a""#.as_slice()),
        &[PendingRecord {
            data: stamped(2, 2).to_string().into_bytes(),
            created: Some(t0() + chrono::Duration::seconds(2)),
        }],
    )
    .await
    .unwrap();

    let args = CollectorArgs::new(table.clone(), params(), "repos/{input}/events")
        .unwrap()
        .with_concurrency(2);
    let stats = FinalizableCollector::new(
        db.clone(),
        client(&transport, 2),
        args,
        JsonTimestamp::field("created_at"),
    )
    .with_input(VecInput::from(vec!["a", "b"]))
    .execute()
    .await
    .unwrap();

    assert_eq!(stats.records, 2);
    assert_eq!(
        raw_store::count_records(&db, &table, params().as_str())
            .await
            .unwrap(),
        3
    );
}

/// A page response carrying `x-ratelimit-*` headers with `remaining` left.
fn rate_limited_page(body: serde_json::Value, remaining: u32) -> HttpResponse {
    let reset = Utc::now().timestamp() + 1;
    HttpResponse::new(200, body.to_string())
        .with_header("X-RateLimit-Limit", "5000")
        .with_header("X-RateLimit-Remaining", remaining.to_string())
        .with_header("X-RateLimit-Reset", reset.to_string())
}

#[tokio::test]
async fn rate_limit_headers_pace_following_pages() {
    let transport = common::FixtureTransport::new();
    // A reset at most one second away spreads 20 requests 50ms apart.
    for page in 1..=3 {
        transport.respond(
            &page_path(page, 10),
            rate_limited_page(records((page as usize - 1) * 10, 10), 20),
        );
    }
    transport.respond(&page_path(4, 10), rate_limited_page(records(30, 2), 20));
    let db = memory_db().await;

    let client = paced_client(&transport, 2, RateLimiter::auto_detect());
    let stats = timeout(
        RUN_TIMEOUT,
        Collector::new(db, Arc::clone(&client), paged_args(10)).execute(),
    )
    .await
    .expect("collection timed out")
    .unwrap();

    assert_eq!(stats.records, 32);
    assert_eq!(client.rate_limiter().interval(), Duration::from_millis(50));
    let gaps = transport.gaps();
    assert_eq!(gaps.len(), 3);
    assert!(
        gaps.iter().all(|gap| *gap >= Duration::from_millis(45)),
        "gaps {gaps:?}"
    );
}

#[tokio::test]
async fn retry_after_delays_the_retried_request() {
    let transport = common::FixtureTransport::new();
    transport.respond(
        "items",
        HttpResponse::new(429, "slow down").with_header("Retry-After", "1"),
    );
    transport.respond_json("items", records(0, 3));
    let db = memory_db().await;

    let client = Arc::new(
        AsyncClient::builder(Arc::new(transport.clone()))
            .base_url(common::BASE_URL)
            .workers(1)
            .retry(
                RetryConfig::new(Duration::from_millis(1), Duration::from_millis(10), 2)
                    .with_jitter(false),
            )
            .build(),
    );
    let args: CollectorArgs<()> = CollectorArgs::new(table(), params(), "items").unwrap();
    let stats = timeout(RUN_TIMEOUT, Collector::new(db, client, args).execute())
        .await
        .expect("collection timed out")
        .unwrap();

    assert_eq!(stats.records, 3);
    assert_eq!(transport.requests().len(), 2);
    let gaps = transport.gaps();
    assert!(gaps[0] >= Duration::from_millis(950), "gaps {gaps:?}");
}

#[tokio::test]
async fn page_larger_than_one_insert_statement_is_stored_whole() {
    let transport = common::FixtureTransport::new();
    transport.respond_json("items", records(0, 6_000));
    let db = memory_db().await;

    let args: CollectorArgs<()> = CollectorArgs::new(table(), params(), "items")
        .unwrap()
        .with_pager(SinglePage);
    let stats = timeout(
        RUN_TIMEOUT,
        Collector::new(db.clone(), client(&transport, 1), args).execute(),
    )
    .await
    .expect("collection timed out")
    .unwrap();

    assert_eq!(stats.pages, 1);
    assert_eq!(stats.records, 6_000);
    assert_eq!(
        raw_store::count_records(&db, &table(), params().as_str())
            .await
            .unwrap(),
        6_000
    );
}

#[tokio::test]
async fn total_pages_header_bounds_pagination() {
    let transport = common::FixtureTransport::new();
    for page in 1..=2 {
        transport.respond(
            &page_path(page, 10),
            HttpResponse::new(200, records((page as usize - 1) * 10, 10).to_string())
                .with_header("X-Total-Pages", "2"),
        );
    }
    let db = memory_db().await;

    let args: CollectorArgs<()> = CollectorArgs::new(table(), params(), "items")
        .unwrap()
        .with_pager(TotalPagesPager::new(10, header_total_pages("x-total-pages")))
        .with_query(page_number_query("page", "per_page"));
    let stats = Collector::new(db, client(&transport, 1), args)
        .execute()
        .await
        .unwrap();

    // Both pages are full; only the reported total stops a third request.
    assert_eq!(transport.requests().len(), 2);
    assert_eq!(stats.records, 20);
}

#[tokio::test]
async fn request_hook_sends_posts_with_page_bodies() {
    let transport = common::FixtureTransport::new();
    transport.respond_json("search", records(0, 5));
    transport.respond_json("search", records(5, 2));
    let db = memory_db().await;

    let args: CollectorArgs<()> = CollectorArgs::new(table(), params(), "search")
        .unwrap()
        .with_pager(OffsetPager::new(5))
        .with_request(Arc::new(
            |req: &PageRequest<'_, ()>, request: HttpRequest| -> Result<HttpRequest, CollectorError> {
                Ok(request
                    .with_method(HttpMethod::Post)
                    .with_header("X-Page", req.page.to_string())
                    .with_json(&json!({"startAt": req.skip, "maxResults": req.size}))?)
            },
        ));
    let stats = Collector::new(db, client(&transport, 1), args)
        .execute()
        .await
        .unwrap();
    assert_eq!(stats.records, 7);

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|r| r.method == HttpMethod::Post));
    assert_eq!(sent[1].body, br#"{"maxResults":5,"startAt":5}"#.to_vec());
    assert!(sent[1].headers.contains(&("X-Page".to_string(), "2".to_string())));
}

fn detail_args() -> CollectorArgs<serde_json::Value> {
    CollectorArgs::new(table(), params(), "items/{input.id}")
        .unwrap()
        .with_parser(|response: &HttpResponse| -> Result<Vec<Vec<u8>>, CollectorError> {
            Ok(vec![response.body.clone()])
        })
}

#[tokio::test]
async fn unfinished_details_are_recollected_after_listing() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(&page_path(1, 5), json!([stamped(2, 2), stamped(1, 1)]));
    transport.respond_json("items/1", json!({"id": 1, "state": "closed"}));
    let db = memory_db().await;

    let stats = FinalizableCollector::new(
        db.clone(),
        client(&transport, 1),
        paged_args(5),
        JsonTimestamp::field("created_at"),
    )
    .with_unfinished_details(detail_args(), VecInput::from(vec![json!({"id": 1})]))
    .execute()
    .await
    .unwrap();

    assert_eq!(stats.requests, 2);
    assert_eq!(stats.records, 3);
    assert_eq!(
        transport.requests().last().map(String::as_str),
        Some("https://api.test/items/1")
    );

    let rows = raw_store::load_records(&db, &table(), params().as_str())
        .await
        .unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2].input.as_deref(), Some(&br#"{"id":1}"#[..]));
    assert!(rows[2].record_created.is_none());
}

#[tokio::test]
async fn full_sync_skips_unfinished_details() {
    let transport = common::FixtureTransport::new();
    transport.respond_json(&page_path(1, 5), json!([stamped(1, 1)]));
    let db = memory_db().await;

    let stats = FinalizableCollector::new(
        db,
        client(&transport, 1),
        paged_args(5),
        JsonTimestamp::field("created_at"),
    )
    .with_unfinished_details(detail_args(), VecInput::from(vec![json!({"id": 1})]))
    .full_sync(true)
    .execute()
    .await
    .unwrap();

    assert_eq!(stats.requests, 1);
    assert_eq!(transport.requests().len(), 1);
}
