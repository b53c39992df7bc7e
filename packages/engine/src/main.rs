use std::sync::Arc;

use anyhow::Context;
use common::{Clock, SystemClock};
use engine::config::AppConfig;
use engine::database::init_db;
use engine::indexes::ensure_indexes;
use engine::ledger::{DbLedger, Ledger};
use engine::plan::BenefitScheduler;
use engine::reconciler::{LedgerVerifier, ReconciliationWorker};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = AppConfig::load().context("Failed to load config")?;

    let db = init_db(&config.database)
        .await
        .context("Failed to connect to database")?;
    ensure_indexes(&db)
        .await
        .context("Failed to create indexes")?;
    info!(
        max_connections = config.database.max_connections,
        "Database ready"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger: Arc<dyn Ledger> = Arc::new(DbLedger::new(db.clone(), Arc::clone(&clock)));
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    if config.scheduler.enabled {
        let scheduler = Arc::new(BenefitScheduler::new(
            db.clone(),
            Arc::clone(&ledger),
            Arc::clone(&clock),
            config.scheduler.clone(),
        ));
        handles.push(scheduler.start(shutdown.clone()));
    } else {
        warn!("Benefit scheduler disabled");
    }

    if config.reconciler.enabled {
        let worker = Arc::new(ReconciliationWorker::new(
            db.clone(),
            Arc::new(LedgerVerifier::new(Arc::clone(&ledger))),
            Arc::clone(&clock),
            config.reconciler.clone(),
            config.dlq.clone(),
        ));
        handles.push(worker.start(shutdown.clone()));
    } else {
        warn!("Reconciliation worker disabled");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for workers");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task ended abnormally");
        }
    }

    Ok(())
}
