//! Application state wiring the engine together.
//!
//! The core executor is generic over its checkpoint repository; `AppState`
//! pins it to the SQLite implementation and registers the built-in providers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use gantry_core::contract::ContractRegistry;
use gantry_core::event::EventBus;
use gantry_core::provider::ProviderRegistry;
use gantry_core::repository::rate_limit::BoxRateLimitStore;
use gantry_core::resilience::{ResilienceRegistry, ResilientDispatcher};
use gantry_core::workflow::executor::GraphExecutor;
use gantry_infra::config::{load_engine_config, resolve_data_dir};
use gantry_infra::provider::ShellProvider;
use gantry_infra::sqlite::{DatabasePool, SqliteCheckpointRepository, SqliteRateLimitStore};

/// The executor pinned to SQLite storage.
pub type ConcreteExecutor = GraphExecutor<SqliteCheckpointRepository>;

/// Shared state for CLI commands that touch the database.
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<ConcreteExecutor>,
    pub resilience: Arc<ResilienceRegistry>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data dir, open the database and wire the executor.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_pool = DatabasePool::open_in(&data_dir)
            .await
            .context("failed to open engine database")?;

        let contracts = match &config.contracts_dir {
            Some(dir) if dir.exists() => ContractRegistry::load_dir(dir)
                .with_context(|| format!("failed to load contracts from {}", dir.display()))?,
            Some(dir) => {
                tracing::warn!(dir = %dir.display(), "contracts_dir does not exist, no contracts loaded");
                ContractRegistry::new()
            }
            None => ContractRegistry::new(),
        };

        let resilience = Arc::new(
            ResilienceRegistry::new(config.clone())
                .with_store(BoxRateLimitStore::new(SqliteRateLimitStore::new(db_pool.clone()))),
        );
        let dispatcher = ResilientDispatcher::new(Arc::new(provider_registry()), resilience.clone());
        let events = EventBus::new(config.event_capacity);

        let executor = GraphExecutor::new(
            SqliteCheckpointRepository::new(db_pool.clone()),
            dispatcher,
            Arc::new(contracts),
            events,
        );

        Ok(Self {
            executor: Arc::new(executor),
            resilience,
            data_dir,
        })
    }
}

/// Providers available to workflows run from the CLI.
pub fn provider_registry() -> ProviderRegistry {
    let mut providers = ProviderRegistry::with_builtins();
    providers.register(ShellProvider::new());
    providers
}
