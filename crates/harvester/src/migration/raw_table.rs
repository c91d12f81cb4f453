use async_trait::async_trait;
use sea_orm_migration::prelude::*;

use crate::entity::raw_record::RawTable;
use crate::raw_store;

use super::MigrationScript;

/// Creates a plugin's raw table ahead of its first collection.
pub struct CreateRawTable {
    name: String,
    table: RawTable,
    version: u64,
}

impl CreateRawTable {
    #[must_use]
    pub fn new(table: RawTable, version: u64) -> Self {
        Self {
            name: format!("create{}", table.name()),
            table,
            version,
        }
    }
}

#[async_trait]
impl MigrationScript for CreateRawTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    async fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbErr> {
        manager
            .create_table(raw_store::create_table_statement(&self.table))
            .await?;
        manager
            .create_index(raw_store::params_index_statement(&self.table))
            .await
    }
}
