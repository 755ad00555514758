// =============================================================================
// Trader Manager — owns the trader set and the shared singletons
// =============================================================================
//
// The manager constructs the process-wide collaborators (journal, candidate
// sources, configuration store), builds each trader's adapter and LLM
// gateway from its profiles, and lends every trader a reference to its
// adapter behind the narrow `Exchange` capability. Start/stop are idempotent
// per trader.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{ConfigStore, TraderConfig};
use crate::exchange::binance::BinanceFutures;
use crate::exchange::Exchange;
use crate::journal::Journal;
use crate::llm::{HttpLlmGateway, LlmGateway};
use crate::signals::CandidateSources;
use crate::trader::{TraderEngine, TraderState};

pub struct TraderManager {
    store: Arc<dyn ConfigStore>,
    journal: Arc<Journal>,
    signals: Arc<CandidateSources>,
    traders: RwLock<HashMap<String, Arc<TraderEngine>>>,
}

impl TraderManager {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        journal: Arc<Journal>,
        signals: Arc<CandidateSources>,
    ) -> Self {
        Self {
            store,
            journal,
            signals,
            traders: RwLock::new(HashMap::new()),
        }
    }

    /// Build (but do not start) an engine for `config`.
    pub fn create_trader(&self, config: TraderConfig) -> Result<Arc<TraderEngine>> {
        config.validate()?;

        if self.traders.read().contains_key(&config.id) {
            bail!("trader {} already exists", config.id);
        }

        let exchange = self.build_exchange(&config)?;
        let gateway = self.build_gateway(&config);

        let engine = Arc::new(TraderEngine::new(
            config.clone(),
            exchange,
            gateway,
            self.signals.clone(),
            self.store.clone(),
            self.journal.clone(),
        ));

        self.traders
            .write()
            .insert(config.id.clone(), engine.clone());
        info!(trader_id = %config.id, name = %config.name, "trader created");
        Ok(engine)
    }

    fn build_exchange(&self, config: &TraderConfig) -> Result<Arc<dyn Exchange>> {
        match config.exchange.venue.to_lowercase().as_str() {
            "binance" | "binance-futures" => Ok(Arc::new(BinanceFutures::new(
                config.exchange.api_key.clone(),
                config.exchange.api_secret.clone(),
                config.exchange.testnet,
            ))),
            other => bail!("unsupported venue '{other}' for trader {}", config.id),
        }
    }

    fn build_gateway(&self, config: &TraderConfig) -> Arc<dyn LlmGateway> {
        Arc::new(HttpLlmGateway::new(
            config.llm.api_key.clone(),
            config.llm.model.clone(),
            config.llm.endpoint.clone(),
            config.llm.dialect,
            config.llm.thread_id.clone(),
        ))
    }

    /// Load every configured trader from the store and start it. Traders
    /// that fail to construct are skipped with a warning.
    pub fn start_all(&self) -> Result<usize> {
        let configs = self.store.load_traders()?;
        let mut started = 0;

        for config in configs {
            let id = config.id.clone();
            let engine = match self.get(&id) {
                Some(existing) => existing,
                None => match self.create_trader(config) {
                    Ok(engine) => engine,
                    Err(e) => {
                        warn!(trader_id = %id, error = %e, "trader skipped");
                        continue;
                    }
                },
            };
            engine.start();
            started += 1;
        }

        info!(started, "traders started");
        Ok(started)
    }

    /// Stop every running trader and wait for its tasks.
    pub async fn stop_all(&self) {
        let engines: Vec<Arc<TraderEngine>> = self.traders.read().values().cloned().collect();
        for engine in engines {
            engine.stop().await;
        }
        info!("all traders stopped");
    }

    pub fn get(&self, trader_id: &str) -> Option<Arc<TraderEngine>> {
        self.traders.read().get(trader_id).cloned()
    }

    pub fn trader_states(&self) -> Vec<(String, TraderState)> {
        self.traders
            .read()
            .iter()
            .map(|(id, engine)| (id.clone(), engine.state()))
            .collect()
    }
}
