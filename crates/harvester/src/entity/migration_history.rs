//! MigrationHistory entity - one row per successfully executed migration script.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Name of the migration ledger table.
pub const TABLE_NAME: &str = "_migration_history";

/// A migration script that has been applied.
///
/// `(script_name, script_version)` identifies a script. Uniqueness is not
/// enforced by the database; the migrator never inserts a second row.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "_migration_history")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub script_name: String,
    /// Stored signed; script versions above `i64::MAX` are rejected.
    pub script_version: i64,
    #[sea_orm(column_type = "Text")]
    pub comment: String,
    /// When the script finished.
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// `name:version`, the identity the migrator tracks.
    pub fn script_id(&self) -> String {
        crate::migration::script_id(&self.script_name, self.script_version as u64)
    }
}
