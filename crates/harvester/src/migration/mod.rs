//! Versioned schema migrations with a durable execution ledger.
//!
//! Plugins register [`MigrationScript`]s with a [`Migrator`]; scripts already
//! recorded in `_migration_history` are skipped, the rest run in ascending
//! version order when [`Migrator::execute`] is called.

mod raw_table;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use sea_orm_migration::prelude::*;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::entity::migration_history;

pub use raw_table::CreateRawTable;

/// `name:version`, the identity of a migration script.
#[must_use]
pub fn script_id(name: &str, version: u64) -> String {
    format!("{name}:{version}")
}

/// One schema change. Immutable once registered.
#[async_trait]
pub trait MigrationScript: Send + Sync {
    fn name(&self) -> &str;

    /// Usually a timestamp such as `20240115000001`.
    fn version(&self) -> u64;

    async fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr>;

    fn script_id(&self) -> String {
        script_id(self.name(), self.version())
    }
}

/// Errors from loading history or running scripts.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to prepare migration history: {0}")]
    History(#[source] DbErr),

    /// A script's `up` failed; later scripts were not run.
    #[error("migration script {script_id} failed: {source}")]
    Script {
        script_id: String,
        #[source]
        source: DbErr,
    },

    /// The script ran but its history row could not be written.
    #[error("failed to record migration script {script_id}: {source}")]
    Record {
        script_id: String,
        #[source]
        source: DbErr,
    },

    #[error("migration cancelled before {script_id}")]
    Cancelled { script_id: String },

    #[error("migration script {script_id} has a version too large to record")]
    VersionOverflow { script_id: String },
}

impl MigrationError {
    /// Id of the script the error belongs to, if any.
    #[must_use]
    pub fn script_id(&self) -> Option<&str> {
        match self {
            Self::History(_) => None,
            Self::Script { script_id, .. }
            | Self::Record { script_id, .. }
            | Self::Cancelled { script_id }
            | Self::VersionOverflow { script_id } => Some(script_id),
        }
    }
}

#[derive(DeriveIden)]
enum MigrationHistory {
    #[sea_orm(iden = "_migration_history")]
    Table,
    Id,
    ScriptName,
    ScriptVersion,
    Comment,
    CreatedAt,
}

#[derive(Clone)]
struct PendingScript {
    id: String,
    script: Arc<dyn MigrationScript>,
    comment: String,
}

#[derive(Default)]
struct MigratorState {
    executed: HashSet<String>,
    pending: Vec<PendingScript>,
}

/// Runs registered scripts that are not yet in the history table.
pub struct Migrator {
    db: DatabaseConnection,
    state: Mutex<MigratorState>,
    cancel: Option<CancellationToken>,
}

impl Migrator {
    /// Create the history table if needed and load the executed scripts.
    pub async fn new(db: DatabaseConnection) -> Result<Self, MigrationError> {
        create_history_table(&db)
            .await
            .map_err(MigrationError::History)?;

        let executed: HashSet<String> = migration_history::Entity::find()
            .all(&db)
            .await
            .map_err(MigrationError::History)?
            .iter()
            .map(migration_history::Model::script_id)
            .collect();
        tracing::debug!(executed = executed.len(), "Loaded migration history");

        Ok(Self {
            db,
            state: Mutex::new(MigratorState {
                executed,
                pending: Vec::new(),
            }),
            cancel: None,
        })
    }

    /// Stop between scripts once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Queue `scripts` unless already executed or already queued.
    pub fn register(&self, scripts: Vec<Arc<dyn MigrationScript>>, comment: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for script in scripts {
            let id = script.script_id();
            if state.executed.contains(&id) {
                tracing::debug!(script = %id, "Skipping executed migration script");
                continue;
            }
            if state.pending.iter().any(|p| p.id == id) {
                tracing::warn!(script = %id, "Migration script registered twice");
                continue;
            }
            state.pending.push(PendingScript {
                id,
                script,
                comment: comment.to_string(),
            });
        }
    }

    /// Run pending scripts in ascending version order.
    ///
    /// Each success is recorded before the next script starts. The first
    /// failure stops the run and leaves it and everything after it pending.
    /// Returns the number of scripts executed.
    pub async fn execute(&self) -> Result<usize, MigrationError> {
        let mut batch = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .clone();
        batch.sort_by_key(|p| p.script.version());

        let manager = SchemaManager::new(&self.db);
        let mut executed = 0;
        for pending in batch {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(MigrationError::Cancelled {
                    script_id: pending.id,
                });
            }
            let version = <i64 as TryFrom<_>>::try_from(pending.script.version()).map_err(|_| {
                MigrationError::VersionOverflow {
                    script_id: pending.id.clone(),
                }
            })?;

            tracing::info!(script = %pending.id, "Applying migration script");
            if let Err(source) = pending.script.up(&manager).await {
                tracing::warn!(script = %pending.id, "Migration script failed: {}", source);
                return Err(MigrationError::Script {
                    script_id: pending.id,
                    source,
                });
            }

            migration_history::ActiveModel {
                script_name: Set(pending.script.name().to_string()),
                script_version: Set(version),
                comment: Set(pending.comment.clone()),
                created_at: Set(Utc::now()),
                ..Default::default()
            }
            .insert(&self.db)
            .await
            .map_err(|source| MigrationError::Record {
                script_id: pending.id.clone(),
                source,
            })?;

            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending.retain(|p| p.id != pending.id);
            state.executed.insert(pending.id);
            executed += 1;
        }

        if executed > 0 {
            tracing::info!(executed, "Migration scripts applied");
        }
        Ok(executed)
    }

    /// Whether scripts are waiting on a database that has history.
    ///
    /// A database with no executed scripts reports `false` even when scripts
    /// are pending; callers bootstrapping a fresh database should call
    /// [`execute`](Self::execute) unconditionally.
    #[must_use]
    pub fn has_pending_scripts(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        !state.executed.is_empty() && !state.pending.is_empty()
    }

    /// Ids of queued scripts in registration order.
    #[must_use]
    pub fn pending_script_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.iter().map(|p| p.id.clone()).collect()
    }

    /// Ids of executed scripts, sorted.
    #[must_use]
    pub fn executed_script_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = state.executed.iter().cloned().collect();
        ids.sort();
        ids
    }
}

async fn create_history_table(db: &DatabaseConnection) -> Result<(), DbErr> {
    SchemaManager::new(db)
        .create_table(
            Table::create()
                .table(MigrationHistory::Table)
                .if_not_exists()
                .col(
                    ColumnDef::new(MigrationHistory::Id)
                        .big_integer()
                        .not_null()
                        .auto_increment()
                        .primary_key(),
                )
                .col(
                    ColumnDef::new(MigrationHistory::ScriptName)
                        .string()
                        .not_null(),
                )
                .col(
                    ColumnDef::new(MigrationHistory::ScriptVersion)
                        .big_integer()
                        .not_null(),
                )
                .col(ColumnDef::new(MigrationHistory::Comment).text().not_null())
                .col(
                    ColumnDef::new(MigrationHistory::CreatedAt)
                        .timestamp_with_time_zone()
                        .not_null(),
                )
                .to_owned(),
        )
        .await
}
