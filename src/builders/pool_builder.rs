//! Build the dispatcher, dependency graph and command pools from configuration.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::config::{AgentConfig, DispatchConfig, StoreEngine};
use crate::core::commands::CommandContext;
use crate::core::dispatcher::Dispatcher;
use crate::core::error::{AppResult, StoreError};
use crate::core::queues::DispatchQueues;
use crate::depend::DependencyGraph;
use crate::infra::{DispatchStore, InMemoryStore, RemoteAgentClient};

/// Everything a running dispatch service holds on to.
pub struct DispatchSystem {
    /// Dependency graph shared by the store and the command context.
    pub graph: Arc<DependencyGraph>,
    /// Booking engine.
    pub dispatcher: Arc<Dispatcher>,
    /// Booking, kill and management pools.
    pub queues: Arc<DispatchQueues>,
}

impl DispatchSystem {
    /// Drain and stop every pool.
    pub fn shutdown(&self) {
        self.queues.shutdown();
    }
}

/// Default store factory. Only the in-memory engine is built in; other
/// engines are supplied by the embedding application through
/// [`build_dispatch`]'s store factory.
///
/// # Errors
/// [`StoreError::Backend`] for engines without a built-in implementation.
pub fn store_from_engine(
    engine: &StoreEngine,
    graph: &Arc<DependencyGraph>,
) -> Result<Arc<dyn DispatchStore>, StoreError> {
    match engine {
        StoreEngine::InMemory => Ok(Arc::new(InMemoryStore::with_graph(Arc::clone(graph)))),
        StoreEngine::Postgres { .. } => Err(StoreError::Backend(
            "postgres engine requires an externally supplied DispatchStore".into(),
        )),
    }
}

/// Assemble the dispatch system using the provided factories.
///
/// # Errors
/// Invalid configuration, a failing store factory, or pools that cannot start.
pub fn build_dispatch<FS, FA>(cfg: &DispatchConfig, store_factory: FS, agent_factory: FA) -> AppResult<DispatchSystem>
where
    FS: FnOnce(&StoreEngine, &Arc<DependencyGraph>) -> Result<Arc<dyn DispatchStore>, StoreError>,
    FA: FnOnce(&AgentConfig) -> Arc<dyn RemoteAgentClient>,
{
    cfg.validate()
        .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;

    let graph = Arc::new(DependencyGraph::new());
    let store = store_factory(&cfg.store, &graph).context("failed to build dispatch store")?;
    let agent = agent_factory(&cfg.agent);
    let dispatcher = Arc::new(Dispatcher::new(store, agent, cfg.dispatcher.clone()));

    let context = Arc::new(CommandContext::new(Arc::clone(&dispatcher), Arc::clone(&graph)));
    let queues = Arc::new(DispatchQueues::new(cfg, context).context("failed to start command pools")?);

    info!(
        booking_workers = cfg.booking.worker_count,
        kill_workers = cfg.kill.worker_count,
        manage_workers = cfg.manage.worker_count,
        test_mode = dispatcher.is_test_mode(),
        "dispatch system ready"
    );
    Ok(DispatchSystem {
        graph,
        dispatcher,
        queues,
    })
}
