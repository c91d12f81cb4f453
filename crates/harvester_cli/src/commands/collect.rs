use std::sync::Arc;

use harvester::collector::{
    Collector, CollectorArgs, CollectorError, FinalizableCollector, Fingerprint, JsonArrayParser,
    JsonTimestamp, OffsetPager, PageRequest, QueryFn, QueryPairs, RequestFn, TokenPager,
    TotalPagesPager, VecInput, header_total_pages, json_cursor, json_total_pages, offset_query,
    page_number_query, short_error_message, token_query,
};
use harvester::http::HttpMethod;
use harvester::{
    AsyncClient, CollectStats, CollectorConfig, HttpRequest, HttpResponse, IgnoreNotFound,
    RawTable, ReqwestTransport,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::CollectOptions;
use crate::config::{Config, JobConfig, PaginationConfig};
use crate::progress::ProgressReporter;

pub(crate) async fn handle_collect(
    job_name: &str,
    opts: CollectOptions,
    config: &Config,
    database_url: &str,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let job = config.job(job_name).ok_or_else(|| {
        format!("Unknown job '{job_name}'. Run `harvester jobs` to list configured jobs.")
    })?;

    let mut settings = config.collector.clone();
    if let Some(concurrency) = opts.concurrency {
        settings.concurrency = concurrency.max(1);
    }

    let db = harvester::connect(database_url).await?;
    let client = Arc::new(build_client(job, &settings)?);
    let args = build_args(job, &settings)?;

    let reporter = Arc::new(ProgressReporter::new());
    let inputs = job.inputs.clone();

    let result = match &job.created_field {
        Some(field) => {
            let collector = FinalizableCollector::new(
                db,
                Arc::clone(&client),
                args,
                JsonTimestamp::field(field),
            );
            if inputs.is_empty() {
                collector
                    .full_sync(opts.full)
                    .with_progress(reporter.as_callback())
                    .with_cancellation(shutdown)
                    .execute()
                    .await
            } else {
                collector
                    .with_input(VecInput::from(inputs))
                    .full_sync(opts.full)
                    .with_progress(reporter.as_callback())
                    .with_cancellation(shutdown)
                    .execute()
                    .await
            }
        }
        None => {
            let collector = Collector::new(db, Arc::clone(&client), args);
            if inputs.is_empty() {
                collector
                    .with_progress(reporter.as_callback())
                    .with_cancellation(shutdown)
                    .execute()
                    .await
            } else {
                collector
                    .with_input(VecInput::from(inputs))
                    .with_progress(reporter.as_callback())
                    .with_cancellation(shutdown)
                    .execute()
                    .await
            }
        }
    };

    reporter.finish();
    client.release().await;

    match result {
        Ok(stats) => {
            print_summary(job_name, &stats);
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            println!("Collection of '{job_name}' cancelled; collected pages were kept.");
            Ok(())
        }
        Err(e) => {
            tracing::error!(job = job_name, "Collection failed: {}", short_error_message(&e));
            Err(Box::new(e))
        }
    }
}

fn print_summary(job_name: &str, stats: &CollectStats) {
    println!(
        "Collected {} records for '{}' ({} pages, {} requests{}).",
        stats.records,
        job_name,
        stats.pages,
        stats.requests,
        if stats.skipped_items > 0 {
            format!(", {} items skipped", stats.skipped_items)
        } else {
            String::new()
        }
    );
}

fn build_client(
    job: &JobConfig,
    settings: &CollectorConfig,
) -> Result<AsyncClient, Box<dyn std::error::Error>> {
    let transport = ReqwestTransport::with_timeout(settings.timeout())?;
    let mut builder = AsyncClient::builder(Arc::new(transport))
        .config(settings)
        .base_url(job.base_url.as_str());
    if let Some(token) = &job.token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    if job.ignore_not_found {
        builder = builder.after_response(IgnoreNotFound);
    }
    Ok(builder.build())
}

/// Translate a job definition into collector arguments.
pub(crate) fn build_args(
    job: &JobConfig,
    settings: &CollectorConfig,
) -> Result<CollectorArgs<Value>, CollectorError> {
    let table = RawTable::new(&job.plugin, &job.entity)?;
    let params = Fingerprint::of(&job.params)?;
    let mut args = CollectorArgs::new(table, params, &job.url_template)?.with_config(settings);

    if let Some(path) = &job.items_path {
        args = args.with_parser(JsonArrayParser::dotted(path));
    }

    let size = settings.page_size;
    let paging: Option<QueryFn<Value>> = match &job.pagination {
        PaginationConfig::None => None,
        PaginationConfig::Page {
            page_param,
            size_param,
            max_items,
        } => {
            args = args.with_pager(with_max_items(OffsetPager::new(size), *max_items));
            Some(page_number_query(page_param.as_str(), size_param.as_str()))
        }
        PaginationConfig::Offset {
            offset_param,
            size_param,
            max_items,
        } => {
            args = args.with_pager(with_max_items(OffsetPager::new(size), *max_items));
            Some(offset_query(offset_param.as_str(), size_param.as_str()))
        }
        PaginationConfig::Cursor {
            pointer,
            param,
            size_param,
        } => {
            let page_size = if size_param.is_some() { size } else { 0 };
            args = args.with_pager(TokenPager::new(page_size, json_cursor(pointer.clone())));
            Some(token_query(param.as_str(), size_param.clone()))
        }
        PaginationConfig::TotalPages {
            page_param,
            size_param,
            pointer,
            header,
        } => {
            let total_pages: TotalPagesFn = match (pointer, header) {
                (Some(pointer), _) => Box::new(json_total_pages(pointer.clone())),
                (None, Some(header)) => Box::new(header_total_pages(header.clone())),
                (None, None) => Box::new(
                    |_: &HttpResponse| -> Result<Option<u32>, CollectorError> { Ok(None) },
                ),
            };
            args = args.with_pager(TotalPagesPager::new(size, total_pages));
            Some(page_number_query(page_param.as_str(), size_param.as_str()))
        }
    };

    if let Some(body) = &job.body {
        args = args.with_request(json_body(body.clone()));
    }

    let fixed: QueryPairs = job
        .query
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if fixed.is_empty() && paging.is_none() {
        return Ok(args);
    }

    let query: QueryFn<Value> = Arc::new(
        move |req: &PageRequest<'_, Value>| -> Result<QueryPairs, CollectorError> {
            let mut pairs = fixed.clone();
            if let Some(paging) = &paging {
                pairs.extend(paging(req)?);
            }
            Ok(pairs)
        },
    );
    Ok(args.with_query(query))
}

fn with_max_items(pager: OffsetPager, max_items: Option<u64>) -> OffsetPager {
    match max_items {
        Some(max) => pager.max_items(max),
        None => pager,
    }
}

type TotalPagesFn =
    Box<dyn Fn(&HttpResponse) -> Result<Option<u32>, CollectorError> + Send + Sync>;

/// Send every page as a `POST` carrying `body`.
fn json_body(body: Value) -> RequestFn<Value> {
    Arc::new(
        move |_: &PageRequest<'_, Value>, request: HttpRequest| -> Result<HttpRequest, CollectorError> {
            Ok(request.with_method(HttpMethod::Post).with_json(&body)?)
        },
    )
}
