//! Configuration file support for harvester.
//!
//! Configuration is loaded with the following precedence (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (prefixed with `HARVESTER_`, nested keys joined
//!    with `__`, e.g. `HARVESTER_DATABASE__URL`)
//! 3. Config file (./harvester.toml, then ~/.config/harvester/config.toml)
//! 4. Built-in defaults
//!
//! The database URL defaults to `sqlite://~/.local/state/harvester/harvester.db`
//! on Linux (using the XDG state directory) if not explicitly configured.
//!
//! Example config file:
//! ```toml
//! [database]
//! url = "postgres:///harvester"
//!
//! [collector]
//! page_size = 100
//! concurrency = 5
//! requests_per_hour = 5000
//!
//! [jobs.github_issues]
//! plugin = "github"
//! entity = "issues"
//! base_url = "https://api.github.com"
//! url_template = "repos/{params.repo}/issues"
//! token = "ghp_..."
//! params = { repo = "rust-lang/rust" }
//! created_field = "created_at"
//! query = { state = "all", direction = "desc" }
//! pagination = { type = "page", page_param = "page", size_param = "per_page" }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use directories::ProjectDirs;
use harvester::CollectorConfig;
use serde::Deserialize;

/// Schema version used for a job's raw-table script when none is configured.
pub const DEFAULT_SCHEMA_VERSION: u64 = 1;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Collector and client tuning shared by all jobs.
    pub collector: CollectorConfig,
    /// Collection jobs by name.
    pub jobs: BTreeMap<String, JobConfig>,
}

/// Database configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database connection URL.
    /// Supports sqlite:// and postgres:// schemes.
    pub url: Option<String>,
}

/// How a job walks through pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaginationConfig {
    /// One request per item.
    #[default]
    None,
    /// `page` / `per_page` style.
    Page {
        page_param: String,
        size_param: String,
        #[serde(default)]
        max_items: Option<u64>,
    },
    /// `offset` / `limit` style.
    Offset {
        offset_param: String,
        size_param: String,
        #[serde(default)]
        max_items: Option<u64>,
    },
    /// Next-page cursor read from the response body.
    Cursor {
        /// JSON pointer to the cursor, e.g. `/meta/next_cursor`.
        pointer: String,
        /// Query parameter carrying the cursor.
        param: String,
        /// Query parameter carrying the page size, if the API takes one.
        #[serde(default)]
        size_param: Option<String>,
    },
    /// `page` / `per_page` style bounded by a reported page count.
    TotalPages {
        page_param: String,
        size_param: String,
        /// JSON pointer to the page count, e.g. `/meta/total_pages`.
        #[serde(default)]
        pointer: Option<String>,
        /// Response header carrying the page count, e.g. `x-total-pages`.
        #[serde(default)]
        header: Option<String>,
    },
}

/// One collection job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Plugin name; the raw table is `_raw_<plugin>_api_<entity>`.
    pub plugin: String,
    pub entity: String,
    pub base_url: String,
    /// Path template, e.g. `repos/{params.repo}/issues`.
    pub url_template: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub token: Option<String>,
    /// Identifies this job's rows in the raw table.
    pub params: serde_json::Value,
    /// Fixed query parameters added to every request.
    pub query: BTreeMap<String, String>,
    pub pagination: PaginationConfig,
    /// JSON body sent with every request; makes the job issue `POST`s.
    pub body: Option<serde_json::Value>,
    /// Dotted path to the record array; the whole body when unset.
    pub items_path: Option<String>,
    /// Dotted path to an RFC 3339 creation time. Makes the job incremental.
    pub created_field: Option<String>,
    /// Fan-out items; each one replays the pagination sequence.
    pub inputs: Vec<serde_json::Value>,
    /// Skip items whose endpoint returns 404.
    pub ignore_not_found: bool,
    /// Version of the job's raw-table migration script.
    pub schema_version: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            plugin: String::new(),
            entity: String::new(),
            base_url: String::new(),
            url_template: String::new(),
            token: None,
            params: serde_json::Value::Object(serde_json::Map::new()),
            query: BTreeMap::new(),
            pagination: PaginationConfig::None,
            body: None,
            items_path: None,
            created_field: None,
            inputs: Vec::new(),
            ignore_not_found: false,
            schema_version: DEFAULT_SCHEMA_VERSION,
        }
    }
}

impl Config {
    /// Load configuration using the config crate's layered approach.
    ///
    /// Sources are loaded in order (later sources override earlier):
    /// 1. Built-in defaults
    /// 2. XDG config file (~/.config/harvester/config.toml)
    /// 3. Local config file (./harvester.toml)
    /// 4. Environment variables with HARVESTER_ prefix
    pub fn load() -> Self {
        let mut builder = ConfigBuilder::builder();

        if let Some(proj_dirs) = ProjectDirs::from("", "", "harvester") {
            let xdg_config = proj_dirs.config_dir().join("config.toml");
            if xdg_config.exists() {
                tracing::debug!("Loading config from {:?}", xdg_config);
                builder = builder.add_source(
                    File::from(xdg_config)
                        .format(FileFormat::Toml)
                        .required(false),
                );
            }
        }

        let local_config = PathBuf::from("harvester.toml");
        if local_config.exists() {
            tracing::debug!("Loading config from ./harvester.toml");
            builder = builder.add_source(
                File::from(local_config)
                    .format(FileFormat::Toml)
                    .required(false),
            );
        }

        // e.g., HARVESTER_COLLECTOR__PAGE_SIZE -> collector.page_size
        builder = builder.add_source(
            Environment::with_prefix("HARVESTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        match builder.build() {
            Ok(settings) => match settings.try_deserialize::<Config>() {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to deserialize config: {}", e);
                    Config::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to build config: {}", e);
                Config::default()
            }
        }
    }

    /// Get the database URL, falling back to the default state directory path.
    ///
    /// The `mode=rwc` parameter creates the SQLite file if it doesn't exist.
    pub fn database_url(&self) -> Option<String> {
        self.database.url.clone().or_else(|| {
            Self::default_state_dir().map(|state_dir| {
                let db_path = state_dir.join("harvester.db");
                format!("sqlite://{}?mode=rwc", db_path.display())
            })
        })
    }

    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.get(name)
    }

    /// Get the default state directory path.
    ///
    /// On Linux, this is `$XDG_STATE_HOME/harvester` or `~/.local/state/harvester`.
    /// On macOS/Windows, falls back to the data directory.
    pub fn default_state_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "harvester").map(|dirs| {
            dirs.state_dir()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| dirs.data_dir().to_path_buf())
        })
    }
}
