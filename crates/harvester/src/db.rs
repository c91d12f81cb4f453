//! Database connection utilities.

use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};

/// Configure SQLite-specific pragmas.
///
/// This sets:
/// - `journal_mode=WAL` - readers don't block the collector's writes
/// - `busy_timeout=5000` - wait up to 5 seconds for locks instead of failing immediately
/// - `synchronous=NORMAL` - safe with WAL and faster than FULL
async fn configure_sqlite(db: &DatabaseConnection) -> Result<(), DbErr> {
    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA busy_timeout=5000",
        "PRAGMA synchronous=NORMAL",
    ] {
        db.execute(Statement::from_string(
            db.get_database_backend(),
            pragma.to_string(),
        ))
        .await?;
    }
    Ok(())
}

/// Establish a connection to the database.
///
/// File-backed SQLite databases get the pragmas from [`configure_sqlite`].
///
/// # Arguments
/// * `database_url` - e.g. `sqlite://harvester.db?mode=rwc` or `postgres:///harvester`
///
/// # Errors
/// Returns `DbErr` if the connection cannot be established.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let db = Database::connect(database_url).await?;

    if database_url.starts_with("sqlite://") {
        configure_sqlite(&db).await?;
    }

    tracing::debug!(backend = ?db.get_database_backend(), "Connected to database");
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connects_to_in_memory_sqlite() {
        let db = connect("sqlite::memory:").await.unwrap();
        assert_eq!(
            db.get_database_backend(),
            sea_orm::DatabaseBackend::Sqlite
        );
    }

    #[tokio::test]
    async fn invalid_url_is_an_error() {
        assert!(connect("nosuchdb://nowhere").await.is_err());
    }
}
