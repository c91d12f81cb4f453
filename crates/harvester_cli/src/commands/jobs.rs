use harvester::RawTable;

use crate::config::{Config, PaginationConfig};

/// Print the configured jobs and the raw table each one writes.
pub(crate) fn handle_jobs(config: &Config) {
    if config.jobs.is_empty() {
        println!("No jobs configured. Add a [jobs.<name>] section to harvester.toml.");
        return;
    }

    for (name, job) in &config.jobs {
        let table = RawTable::new(&job.plugin, &job.entity)
            .map(|t| t.to_string())
            .unwrap_or_else(|e| format!("<{e}>"));
        let mode = if job.created_field.is_some() {
            "incremental"
        } else {
            "full"
        };
        let pagination = match &job.pagination {
            PaginationConfig::None => "none",
            PaginationConfig::Page { .. } => "page",
            PaginationConfig::Offset { .. } => "offset",
            PaginationConfig::Cursor { .. } => "cursor",
            PaginationConfig::TotalPages { .. } => "total_pages",
        };
        println!(
            "{name:<24} {table:<40} {mode:<12} pagination={pagination} inputs={}",
            job.inputs.len()
        );
    }
}
