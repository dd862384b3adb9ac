//! Custody Settlement service
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────────┐
//! │  Config  │───▶│  PostgreSQL  │───▶│   Coordinator    │──▶ chain / payout
//! │  (YAML)  │    │ ledger/audit │    │     (sagas)      │
//! └──────────┘    └──────────────┘    └────────┬─────────┘
//!                                              │ leftover work
//!                                     ┌────────▼─────────┐
//!                                     │ Reconciliation   │
//!                                     │ worker (scans)   │
//!                                     └──────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use custody_settlement::audit::PgAuditLog;
use custody_settlement::config::AppConfig;
use custody_settlement::db::Database;
use custody_settlement::gateway::{EvmChainClient, PaypalPayoutClient};
use custody_settlement::ledger::PgLedger;
use custody_settlement::reconciliation::{PgReconciliationQueue, ReconciliationWorker};
use custody_settlement::settlement::{HotWallet, SettlementCoordinator};
use custody_settlement::wallet::{SigningKey, is_valid_address};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = custody_settlement::logging::init_logging(&app_config);

    tracing::info!("Starting custody settlement in {} mode", env);

    let db_config = &app_config.database;
    let acquire_timeout = Duration::from_millis(db_config.acquire_timeout_ms);
    let db = Database::connect(
        &db_config.postgres_url,
        db_config.max_connections,
        acquire_timeout,
    )
    .await
    .context("Failed to connect to ledger database")?;

    let audit_db = match &db_config.audit_url {
        Some(url) => Some(
            Database::connect(url, db_config.max_connections, acquire_timeout)
                .await
                .context("Failed to connect to audit database")?,
        ),
        None => None,
    };
    let audit_pool = audit_db.as_ref().unwrap_or(&db).pool().clone();

    db.ensure_schema().await.context("Schema bootstrap failed")?;
    if let Some(audit_db) = &audit_db {
        audit_db
            .ensure_schema()
            .await
            .context("Audit schema bootstrap failed")?;
    }

    let hot_wallet_address = app_config.chain.hot_wallet_address.trim().to_lowercase();
    if !is_valid_address(&hot_wallet_address) {
        bail!("chain.hot_wallet_address is not a valid address");
    }
    let hot_wallet = HotWallet {
        address: hot_wallet_address,
        signing_key: SigningKey::new(app_config.hot_wallet_key()?),
    };
    let controls = hot_wallet
        .signing_key
        .controls(&hot_wallet.address)
        .context("Hot wallet key is not a valid secp256k1 key")?;
    if !controls {
        bail!("Hot wallet key does not control chain.hot_wallet_address");
    }

    let ledger = Arc::new(PgLedger::new(db.pool().clone()));
    let audit = Arc::new(PgAuditLog::new(audit_pool));
    let queue = Arc::new(PgReconciliationQueue::new(db.pool().clone()));
    let chain = Arc::new(EvmChainClient::new(&app_config.evm_chain())?);
    let payout = Arc::new(PaypalPayoutClient::new(app_config.paypal()?)?);

    let coordinator = SettlementCoordinator::new(
        ledger.clone(),
        audit.clone(),
        chain.clone(),
        payout,
        queue.clone(),
        app_config.saga_policy(),
        hot_wallet,
    );
    tracing::info!(
        hot_wallet = %coordinator.hot_wallet().address,
        fiat_asset = %coordinator.policy().fiat_asset,
        "Settlement coordinator ready"
    );

    let shutdown = CancellationToken::new();
    let worker = ReconciliationWorker::new(ledger, audit, chain, queue, app_config.worker());
    let worker_shutdown = shutdown.clone();
    let worker_handle = tokio::spawn(async move { worker.run(worker_shutdown).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "Reconciliation worker ended abnormally");
    }

    // In-flight sagas hold pool connections until they finish
    drop(coordinator);
    if let Some(audit_db) = &audit_db {
        audit_db.close().await;
    }
    db.close().await;

    tracing::info!("Custody settlement stopped");
    Ok(())
}
