//! litflow - delegated capacity credits, session signatures and Lit Action execution

pub mod api;
pub mod capability;
pub mod conditions;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod network;
pub mod orchestrator;
pub mod signer;
pub mod store;

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::NetworkConfig;
use crate::identity::PkpInfo;
use crate::network::NetworkClient;
use crate::orchestrator::DelegatedExecutionOrchestrator;
use crate::signer::Signer;

/// Application state shared across handlers
pub struct AppState {
    pub store: store::Store,
    pub orchestrator: DelegatedExecutionOrchestrator,
    /// Credential owner; pays for and delegates every run
    pub owner: Arc<dyn Signer>,
    /// PKP the default action signs with
    pub pkp: PkpInfo,
    pub config: NetworkConfig,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        network: Arc<dyn NetworkClient>,
        owner: Arc<dyn Signer>,
        pkp: PkpInfo,
        config: NetworkConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store: store::Store::new(pool),
            orchestrator: DelegatedExecutionOrchestrator::new(network, &config),
            owner,
            pkp,
            config,
        })
    }
}
