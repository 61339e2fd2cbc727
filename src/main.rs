//! litflow demo server

use clap::Parser;
use litflow::config::{require, NetworkConfig};
use litflow::network::{HttpNetworkClient, NetworkClient};
use litflow::orchestrator::DelegatedExecutionOrchestrator;
use litflow::signer::{LocalKeySigner, Signer};
use litflow::AppState;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "litflow")]
#[command(about = "Demo server for delegated Lit Action execution")]
struct ServerArgs {
    #[command(flatten)]
    network: NetworkConfig,

    /// Private key of the credential owner
    #[arg(long, env = "ETHEREUM_PRIVATE_KEY", hide_env_values = true)]
    private_key: Option<String>,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:litflow.db?mode=rwc")]
    database_url: String,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    listen_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "litflow=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = ServerArgs::parse();
    args.network.validate()?;
    let private_key = require("ETHEREUM_PRIVATE_KEY", args.private_key.as_deref())?;
    let owner: Arc<dyn Signer> = Arc::new(LocalKeySigner::from_hex(&private_key)?);
    tracing::info!(
        "Credential owner {} on {}",
        owner.address(),
        args.network.network
    );

    // Database connection
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    let network: Arc<dyn NetworkClient> = Arc::new(HttpNetworkClient::from_config(&args.network));
    let pkp = DelegatedExecutionOrchestrator::new(network.clone(), &args.network)
        .provision_pkp(owner.as_ref(), args.network.pkp_public_key()?)
        .await?;
    tracing::info!("Actions sign with PKP {}", pkp.eth_address);

    let state = AppState::new(pool, network, owner, pkp, args.network);
    let app = litflow::api::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
