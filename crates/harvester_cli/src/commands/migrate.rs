use std::sync::Arc;

use harvester::RawTable;
use harvester::migration::{CreateRawTable, MigrationScript, Migrator};
use tokio_util::sync::CancellationToken;

use crate::MigrateAction;
use crate::config::Config;

pub(crate) async fn handle_migrate(
    action: MigrateAction,
    config: &Config,
    database_url: &str,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = harvester::connect(database_url).await?;
    let migrator = Migrator::new(db).await?.with_cancellation(shutdown);
    register_jobs(&migrator, config)?;

    match action {
        MigrateAction::Up => {
            println!("Applying migrations...");
            let applied = migrator.execute().await?;
            if applied == 0 {
                println!("Nothing to apply.");
            } else {
                println!("Applied {applied} migration(s).");
            }
        }
        MigrateAction::Status => {
            println!("Migration status:");
            for id in migrator.executed_script_ids() {
                println!("  applied  {id}");
            }
            for id in migrator.pending_script_ids() {
                println!("  pending  {id}");
            }
            if migrator.has_pending_scripts() {
                println!("Run `harvester migrate up` to apply pending migrations.");
            }
        }
    }

    Ok(())
}

/// Register one raw-table script per configured job, commented with the job name.
fn register_jobs(migrator: &Migrator, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    for (name, job) in &config.jobs {
        let table = RawTable::new(&job.plugin, &job.entity)?;
        let script: Arc<dyn MigrationScript> =
            Arc::new(CreateRawTable::new(table, job.schema_version));
        migrator.register(vec![script], name);
    }
    Ok(())
}
