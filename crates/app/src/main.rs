/// Loyalty Points Backend
///
/// Entry point of the loyalty service. Users upload purchase order numbers,
/// an external accrual system decides how many points each order earns, and
/// users spend points through withdrawals.
///
/// # Architecture
///
/// - Repository layer: PostgreSQL, or an in-memory store when no database is configured
/// - Service layer: order store, ledger and the loyalty façade
/// - Accrual poller: background worker querying the accrual system
/// - API layer: HTTP endpoints plus health and Prometheus metrics
///
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use accrual::HttpAccrualClient;
use accrual_poller::{AccrualPoller, PollerSettings};
use app_config::{AppConfig, Overrides};
use memory_store::MemoryStore;
use repository::{LedgerRepository, OrdersRepository, PgLedgerRepository, PgOrdersRepository};
use server::{Server, shutdown_signal};
use service::{Ledger, LoyaltyServiceImpl, OrderStore};

/// Command-line flags; each one overrides the matching environment variable.
#[derive(Debug, Parser)]
#[command(name = "loyalty", version, about = "Loyalty points backend")]
struct Cli {
    /// HTTP listen address (RUN_ADDRESS)
    #[arg(short = 'a', long)]
    run_address: Option<String>,
    /// PostgreSQL connection string (DATABASE_URI)
    #[arg(short = 'd', long)]
    database_uri: Option<String>,
    /// Accrual system base URL (ACCRUAL_SYSTEM_ADDRESS)
    #[arg(short = 'r', long)]
    accrual_system_address: Option<String>,
}

impl From<Cli> for Overrides {
    fn from(cli: Cli) -> Self {
        Overrides {
            run_address: cli.run_address,
            database_uri: cli.database_uri,
            accrual_system_address: cli.accrual_system_address,
        }
    }
}

/// Initialize the tracing subscriber for logging
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Builds the storage backends selected by the configuration.
async fn init_storage(
    config: &AppConfig,
) -> Result<(Arc<dyn OrdersRepository>, Arc<dyn LedgerRepository>)> {
    if !config.uses_database() {
        warn!("DATABASE_URI is empty, using in-memory storage; data is lost on restart");
        let store = Arc::new(MemoryStore::new());
        let orders: Arc<dyn OrdersRepository> = store.clone();
        let ledger: Arc<dyn LedgerRepository> = store;
        return Ok((orders, ledger));
    }

    let pool = db::init_db_pool(config)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");
    let orders: Arc<dyn OrdersRepository> = Arc::new(PgOrdersRepository::new(pool.clone()));
    let ledger: Arc<dyn LedgerRepository> = Arc::new(PgLedgerRepository::new(pool));
    Ok((orders, ledger))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    info!("Loyalty backend starting...");

    let cli = Cli::parse();
    let config = AppConfig::load_with(cli.into()).context("Failed to load configuration")?;

    let (orders_repo, ledger_repo) = init_storage(&config).await?;
    let orders = OrderStore::new(orders_repo);
    let ledger = Ledger::new(ledger_repo);
    let service = Arc::new(LoyaltyServiceImpl::new(orders.clone(), ledger));

    let shutdown = CancellationToken::new();

    let client = HttpAccrualClient::new(
        &config.accrual_system_address,
        config.accrual_timeout,
        config.accrual_retry_after,
    )
    .context("Failed to create accrual client")?;
    let poller = Arc::new(AccrualPoller::new(
        Arc::new(client),
        orders,
        PollerSettings {
            interval: config.poll_interval,
            batch_size: config.poll_batch_size,
            concurrency: config.poll_concurrency,
            retry_backoff: config.poll_retry_backoff,
        },
    ));
    info!(address = %config.accrual_system_address, "Starting accrual poller");
    let poller = poller.start(&shutdown);

    let http_server = Server::new(config.run_address.clone(), &config.auth_header, service)?;
    let mut tasks = JoinSet::new();
    let server_shutdown = shutdown.clone();
    tasks.spawn(async move { http_server.start(server_shutdown).await });

    tokio::select! {
        _ = shutdown_signal() => {}
        Some(res) = tasks.join_next() => {
            match res {
                Ok(Ok(())) => warn!("HTTP server stopped unexpectedly"),
                Ok(Err(err)) => error!("HTTP server error: {err:#}"),
                Err(err) => error!("HTTP server task failed: {err}"),
            }
        }
    }

    info!("Shutting down...");
    shutdown.cancel();

    let drain = async {
        if let Err(err) = poller.stop().await {
            error!("Accrual poller task failed: {err}");
        }
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(Err(err)) => error!("HTTP server error: {err:#}"),
                Err(err) => error!("HTTP server task failed: {err}"),
                Ok(Ok(())) => {}
            }
        }
    };
    if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
        warn!(timeout = ?config.shutdown_timeout, "Graceful shutdown timed out");
    }

    info!("Application stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags_become_overrides() {
        let cli = Cli::parse_from(["loyalty", "-a", "127.0.0.1:9000", "-r", "http://accrual:8081"]);
        let overrides = Overrides::from(cli);
        assert_eq!(overrides.run_address.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(overrides.database_uri, None);
        assert_eq!(
            overrides.accrual_system_address.as_deref(),
            Some("http://accrual:8081")
        );
    }
}
