//! Composition root: builds, starts and stops every engine of one client
//! process.

use std::sync::Arc;

use hedge_core::bus::EventBus;
use hedge_core::config::Config;
use hedge_core::store::{MemoryStore, Store, SubscriptionFeed};
use hedge_core::venue::{CommandTransport, PaperVenue};
use hedge_core::{Error, Result};
use risk_manager::{HedgeAnalyzer, TrailEngine, TrailStats};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trading_engine::{
    ActionConsistencyManager, ActionSyncEngine, ConflictResolver, CrossAccountHedgeOrchestrator,
    LockStats, OrchestratorHealth, PositionCoordinator, SyncStats,
};

/// Point-in-time health of the whole process.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeHealth {
    pub client_id: String,
    pub running: bool,
    pub healthy: bool,
    pub open_positions: usize,
    pub sync: SyncStats,
    pub locks: LockStats,
    pub trail: TrailStats,
    pub hedging: OrchestratorHealth,
}

pub struct Runtime {
    config: Config,
    store: Arc<dyn Store>,
    transport: Arc<dyn CommandTransport>,
    bus: Arc<EventBus>,
    locks: Arc<ActionConsistencyManager>,
    resolver: Arc<ConflictResolver>,
    trail: Arc<TrailEngine>,
    coordinator: Arc<PositionCoordinator>,
    sync: Arc<ActionSyncEngine>,
    analyzer: Arc<HedgeAnalyzer>,
    orchestrator: Arc<CrossAccountHedgeOrchestrator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build against the in-memory store and the paper venue.
    pub fn build(config: Config) -> Result<Self> {
        let store = Arc::new(MemoryStore::with_capacity(config.bus.capacity));
        let venue = Arc::new(PaperVenue::new());
        Self::with_collaborators(config, store.clone(), store, venue)
    }

    pub fn with_collaborators(
        config: Config,
        store: Arc<dyn Store>,
        feed: Arc<dyn SubscriptionFeed>,
        transport: Arc<dyn CommandTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let bus = Arc::new(EventBus::new(config.bus.capacity));
        let locks = Arc::new(ActionConsistencyManager::new(config.lock.stale_timeout()));
        let resolver = Arc::new(ConflictResolver::new(config.resolver.history_limit));
        let trail = Arc::new(TrailEngine::new(bus.clone()));

        let coordinator = Arc::new(PositionCoordinator::new(
            config.client_id.clone(),
            config.owned_accounts.clone(),
            store.clone(),
            feed.clone(),
            transport.clone(),
            trail.clone(),
            resolver.clone(),
            bus.clone(),
            config.cache.refresh_interval(),
        ));
        let sync = Arc::new(ActionSyncEngine::new(
            config.client_id.clone(),
            config.owned_accounts.clone(),
            store.clone(),
            feed,
            transport.clone(),
            locks.clone(),
            bus.clone(),
            config.sync.clone(),
        ));
        let analyzer = Arc::new(HedgeAnalyzer::new(coordinator.clone(), config.hedge.clone()));
        let orchestrator = Arc::new(CrossAccountHedgeOrchestrator::new(
            config.client_id.clone(),
            store.clone(),
            transport.clone(),
            locks.clone(),
            bus.clone(),
            config.hedge.clone(),
            config.sync.command_timeout(),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        info!(
            client_id = %config.client_id,
            accounts = ?config.owned_accounts,
            "Runtime built"
        );

        Ok(Self {
            config,
            store,
            transport,
            bus,
            locks,
            resolver,
            trail,
            coordinator,
            sync,
            analyzer,
            orchestrator,
            shutdown_tx,
            tasks: Vec::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Spawn the coordinator, the sync engine and the analysis loop.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::validation("runtime already started"));
        }
        self.shutdown_tx.send_replace(false);

        let coordinator = self.coordinator.clone();
        let rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = coordinator.run(rx).await {
                error!(error = %e, "Position coordinator exited with error");
            }
        }));

        let sync = self.sync.clone();
        let rx = self.shutdown_tx.subscribe();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = sync.run(rx).await {
                error!(error = %e, "Action sync engine exited with error");
            }
        }));

        let analyzer = self.analyzer.clone();
        let interval = self.config.hedge.analysis_interval();
        let rx = self.shutdown_tx.subscribe();
        self.tasks
            .push(tokio::spawn(run_analysis(analyzer, interval, rx)));

        info!(tasks = self.tasks.len(), "Runtime started");
        Ok(())
    }

    /// Signal every loop to stop and wait for them.
    pub async fn shutdown(&mut self) {
        info!("Shutting down runtime");
        self.shutdown_tx.send_replace(true);
        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Runtime task ended abnormally");
            }
        }
        self.bus.close_all();
        info!("Runtime stopped");
    }

    pub fn health(&self) -> RuntimeHealth {
        let sync_healthy = self.sync.is_healthy();
        let hedging = self.orchestrator.health();
        RuntimeHealth {
            client_id: self.config.client_id.clone(),
            running: self.is_running(),
            healthy: sync_healthy && hedging.healthy,
            open_positions: self.coordinator.get_realtime_snapshot().open_positions().len(),
            sync: self.sync.get_stats(),
            locks: self.locks.stats(),
            trail: self.trail.stats(),
            hedging,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn CommandTransport> {
        &self.transport
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    pub fn trail_engine(&self) -> &Arc<TrailEngine> {
        &self.trail
    }

    pub fn coordinator(&self) -> &Arc<PositionCoordinator> {
        &self.coordinator
    }

    pub fn sync_engine(&self) -> &Arc<ActionSyncEngine> {
        &self.sync
    }

    pub fn analyzer(&self) -> &Arc<HedgeAnalyzer> {
        &self.analyzer
    }

    pub fn orchestrator(&self) -> &Arc<CrossAccountHedgeOrchestrator> {
        &self.orchestrator
    }
}

async fn run_analysis(
    analyzer: Arc<HedgeAnalyzer>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let analyses = analyzer.refresh_all();
                let suggestions: usize = analyses.iter().map(|a| a.suggestions.len()).sum();
                debug!(accounts = analyses.len(), suggestions, "Analysis tick");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedge_core::types::Direction;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use trading_engine::EntryRequest;

    fn config() -> Config {
        let mut config = Config::for_client("client-a", &["acc-1", "acc-2"]);
        config.cache.refresh_interval_ms = 50;
        config
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = config();
        config.client_id = String::new();
        assert!(Runtime::build(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut runtime = Runtime::build(config()).unwrap();
        assert!(!runtime.is_running());

        runtime.start().unwrap();
        assert!(runtime.start().is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runtime.health().healthy);

        runtime.shutdown().await;
        assert!(!runtime.is_running());
        assert!(!runtime.sync_engine().is_healthy());
    }

    #[tokio::test]
    async fn test_entry_fills_through_running_engines() {
        let store = Arc::new(MemoryStore::new());
        let venue = Arc::new(PaperVenue::new());
        venue.set_price("EURUSD", Decimal::new(11000, 4));
        let mut runtime =
            Runtime::with_collaborators(config(), store.clone(), store, venue).unwrap();
        runtime.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let position = runtime
            .coordinator()
            .submit_entry(EntryRequest::new("acc-1", "EURUSD", Direction::Buy, Decimal::ONE))
            .await
            .unwrap();

        let mut opened = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if runtime
                .coordinator()
                .get_position(position.id)
                .map(|p| p.is_open())
                .unwrap_or(false)
            {
                opened = true;
                break;
            }
        }
        assert!(opened);
        assert_eq!(runtime.health().open_positions, 1);

        let analysis = runtime.analyzer().analyze_account("acc-1");
        assert_eq!(analysis.total_net_exposure, Decimal::ONE);

        runtime.shutdown().await;
    }
}
