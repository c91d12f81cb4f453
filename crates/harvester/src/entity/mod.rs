//! SeaORM entity definitions for the harvester bookkeeping and raw tables.

pub mod migration_history;
pub mod raw_record;
