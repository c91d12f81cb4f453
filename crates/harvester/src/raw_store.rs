//! Raw table persistence.
//!
//! Writes are plain statements with no shared in-memory state, so concurrent
//! collector workers can call into this module freely.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{
    ColumnDef, Expr, Func, Index, IndexCreateStatement, Order, Query, SelectStatement, Table,
    TableCreateStatement,
};
use sea_orm::{ConnectionTrait, DbErr, FromQueryResult};

use crate::entity::raw_record::{RawColumn, RawRecord, RawTable};

/// A parsed record waiting to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub data: Vec<u8>,
    /// Creation time extracted by incremental collectors.
    pub created: Option<DateTime<Utc>>,
}

impl PendingRecord {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            created: None,
        }
    }
}

/// `CREATE TABLE IF NOT EXISTS` for a raw table.
#[must_use]
pub fn create_table_statement(table: &RawTable) -> TableCreateStatement {
    Table::create()
        .table(table.iden())
        .if_not_exists()
        .col(
            ColumnDef::new(RawColumn::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(RawColumn::Params).string().not_null())
        .col(ColumnDef::new(RawColumn::Data).blob().not_null())
        .col(ColumnDef::new(RawColumn::Input).blob().null())
        .col(ColumnDef::new(RawColumn::RecordCreated).big_integer().null())
        .col(
            ColumnDef::new(RawColumn::CreatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .col(
            ColumnDef::new(RawColumn::UpdatedAt)
                .timestamp_with_time_zone()
                .not_null(),
        )
        .to_owned()
}

/// Index on `params`, which every delete and boundary query filters by.
#[must_use]
pub fn params_index_statement(table: &RawTable) -> IndexCreateStatement {
    Index::create()
        .name(format!("idx{}_params", table.name()))
        .table(table.iden())
        .col(RawColumn::Params)
        .if_not_exists()
        .to_owned()
}

/// Create the raw table and its index if missing.
pub async fn ensure_table<C: ConnectionTrait>(db: &C, table: &RawTable) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    db.execute(backend.build(&create_table_statement(table)))
        .await?;
    db.execute(backend.build(&params_index_statement(table)))
        .await?;
    Ok(())
}

/// Delete every row collected under `params`. Returns the number removed.
pub async fn delete_by_params<C: ConnectionTrait>(
    db: &C,
    table: &RawTable,
    params: &str,
) -> Result<u64, DbErr> {
    let stmt = Query::delete()
        .from_table(table.iden())
        .and_where(Expr::col(RawColumn::Params).eq(params))
        .to_owned();
    let result = db.execute(db.get_database_backend().build(&stmt)).await?;
    Ok(result.rows_affected())
}

/// Rows per `INSERT` statement.
///
/// Each row binds six values, which keeps a full chunk well under the
/// SQLite (32766) and Postgres (65535) bind parameter limits.
pub const INSERT_CHUNK: usize = 500;

/// Insert one page of records, [`INSERT_CHUNK`] rows per statement.
///
/// Returns the total number of rows inserted.
pub async fn insert_records<C: ConnectionTrait>(
    db: &C,
    table: &RawTable,
    params: &str,
    input: Option<&[u8]>,
    records: &[PendingRecord],
) -> Result<u64, DbErr> {
    let now = Utc::now();
    let backend = db.get_database_backend();
    let mut inserted = 0;

    for chunk in records.chunks(INSERT_CHUNK) {
        let mut stmt = Query::insert();
        stmt.into_table(table.iden()).columns([
            RawColumn::Params,
            RawColumn::Data,
            RawColumn::Input,
            RawColumn::RecordCreated,
            RawColumn::CreatedAt,
            RawColumn::UpdatedAt,
        ]);
        for record in chunk {
            stmt.values([
                params.into(),
                record.data.clone().into(),
                input.map(<[u8]>::to_vec).into(),
                record.created.map(|t| t.timestamp_millis()).into(),
                now.into(),
                now.into(),
            ])
            .map_err(|e| DbErr::Custom(e.to_string()))?;
        }

        let result = db.execute(backend.build(&stmt)).await?;
        inserted += result.rows_affected();
    }

    Ok(inserted)
}

fn scoped(select: &mut SelectStatement, params: &str, input: Option<&[u8]>) {
    select.and_where(Expr::col(RawColumn::Params).eq(params));
    match input {
        Some(input) => select.and_where(Expr::col(RawColumn::Input).eq(input.to_vec())),
        None => select.and_where(Expr::col(RawColumn::Input).is_null()),
    };
}

/// Newest record creation time stored for a fingerprint and fan-out item.
pub async fn max_record_created<C: ConnectionTrait>(
    db: &C,
    table: &RawTable,
    params: &str,
    input: Option<&[u8]>,
) -> Result<Option<DateTime<Utc>>, DbErr> {
    let mut stmt = Query::select();
    stmt.expr(Func::max(Expr::col(RawColumn::RecordCreated)))
        .from(table.iden());
    scoped(&mut stmt, params, input);

    let row = db.query_one(db.get_database_backend().build(&stmt)).await?;
    let millis = match row {
        Some(row) => row.try_get_by_index::<Option<i64>>(0)?,
        None => None,
    };
    Ok(millis.and_then(DateTime::from_timestamp_millis))
}

/// All rows collected under `params`, in insertion order.
pub async fn load_records<C: ConnectionTrait>(
    db: &C,
    table: &RawTable,
    params: &str,
) -> Result<Vec<RawRecord>, DbErr> {
    let stmt = Query::select()
        .columns([
            RawColumn::Id,
            RawColumn::Params,
            RawColumn::Data,
            RawColumn::Input,
            RawColumn::RecordCreated,
            RawColumn::CreatedAt,
        ])
        .from(table.iden())
        .and_where(Expr::col(RawColumn::Params).eq(params))
        .order_by(RawColumn::Id, Order::Asc)
        .to_owned();
    RawRecord::find_by_statement(db.get_database_backend().build(&stmt))
        .all(db)
        .await
}

/// Number of rows collected under `params`.
pub async fn count_records<C: ConnectionTrait>(
    db: &C,
    table: &RawTable,
    params: &str,
) -> Result<u64, DbErr> {
    let stmt = Query::select()
        .expr(Func::count(Expr::col(RawColumn::Id)))
        .from(table.iden())
        .and_where(Expr::col(RawColumn::Params).eq(params))
        .to_owned();
    let row = db.query_one(db.get_database_backend().build(&stmt)).await?;
    let count = match row {
        Some(row) => row.try_get_by_index::<i64>(0)?,
        None => 0,
    };
    Ok(u64::try_from(count).unwrap_or_default())
}
