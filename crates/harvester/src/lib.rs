//! Harvester - rate-limited, resumable collection from paginated REST APIs.
//!
//! This library provides the pieces every data-source plugin shares:
//!
//! - [`AsyncClient`] - a worker pool that paces requests through a
//!   [`RateLimiter`], retries transient failures and classifies responses.
//! - [`Collector`] - replays a pagination sequence per fan-out item and
//!   stores every record, as received, in a raw table.
//! - [`FinalizableCollector`] - an incremental collector that stops once it
//!   reaches records collected by a previous run.
//! - [`Migrator`] - runs versioned schema scripts exactly once, recording
//!   them in `_migration_history`.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use harvester::collector::{Collector, CollectorArgs, Fingerprint, OffsetPager, page_number_query};
//! use harvester::{AsyncClient, RawTable, ReqwestTransport};
//!
//! let db = harvester::connect("sqlite://harvester.db?mode=rwc").await?;
//! let client = Arc::new(
//!     AsyncClient::builder(Arc::new(ReqwestTransport::with_timeout(timeout)?))
//!         .base_url("https://api.github.com")
//!         .header("Authorization", format!("Bearer {token}"))
//!         .build(),
//! );
//!
//! let args = CollectorArgs::new(
//!     RawTable::new("github", "issues")?,
//!     Fingerprint::of(&serde_json::json!({"repo": "rust-lang/rust"}))?,
//!     "repos/{params.repo}/issues",
//! )?
//! .with_pager(OffsetPager::new(100))
//! .with_query(page_number_query("page", "per_page"));
//!
//! let stats = Collector::new(db, client, args).execute().await?;
//! ```

pub mod client;
pub mod collector;
pub mod config;
pub mod db;
pub mod entity;
pub mod http;
pub mod migration;
pub mod rate_limit;
pub mod raw_store;
pub mod retry;

pub use client::{
    AfterResponse, AsyncClient, AsyncClientBuilder, Classified, DefaultAfterResponse,
    IgnoreNotFound, ResponseAction,
};
pub use collector::{
    CollectStats, Collector, CollectorArgs, CollectorError, FinalizableCollector, PageOutcome,
};
pub use config::CollectorConfig;
pub use db::connect;
pub use entity::raw_record::{RawRecord, RawTable};
pub use http::{HttpError, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use migration::{MigrationError, MigrationScript, Migrator};
pub use rate_limit::RateLimiter;
