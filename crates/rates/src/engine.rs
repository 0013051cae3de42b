//! Rate engine - owns the table, the registry and the background tasks

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use currency_core::RatesConfig;

use crate::broadcaster::RateBroadcaster;
use crate::fluctuator::{FluctuatorConfig, RateFluctuator};
use crate::registry::SubscriptionRegistry;
use crate::source::RateSource;
use crate::table::{RateTable, RateTableStats};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fluctuation: FluctuatorConfig,
    pub send_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fluctuation: FluctuatorConfig::default(),
            send_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&RatesConfig> for EngineConfig {
    fn from(config: &RatesConfig) -> Self {
        Self {
            fluctuation: FluctuatorConfig {
                interval: config.fluctuation_interval(),
                max_change: config.max_change,
            },
            send_timeout: config.send_timeout(),
        }
    }
}

pub struct RateEngine {
    table: Arc<RateTable>,
    registry: Arc<SubscriptionRegistry>,
    fluctuator: Arc<RateFluctuator>,
    broadcaster: Arc<RateBroadcaster>,
    handles: Vec<JoinHandle<()>>,
    shutdowns: Vec<oneshot::Sender<()>>,
}

impl RateEngine {
    pub fn new(config: EngineConfig, table: RateTable) -> Self {
        let table = Arc::new(table);
        let registry = Arc::new(SubscriptionRegistry::new());

        let fluctuator = Arc::new(RateFluctuator::new(config.fluctuation, Arc::clone(&table)));
        let broadcaster = Arc::new(RateBroadcaster::new(
            Arc::clone(&table),
            Arc::clone(&registry),
            config.send_timeout,
        ));

        Self {
            table,
            registry,
            fluctuator,
            broadcaster,
            handles: vec![],
            shutdowns: vec![],
        }
    }

    /// Build the table from a snapshot source
    pub async fn from_source(config: EngineConfig, source: &dyn RateSource) -> anyhow::Result<Self> {
        let snapshot = source.fetch().await?;
        info!(
            source = source.name(),
            base = %snapshot.base,
            currencies = snapshot.rates.len(),
            "Loaded initial rates"
        );

        let table = RateTable::from_snapshot(snapshot)?;
        Ok(Self::new(config, table))
    }

    /// Get shared table reference
    pub fn table(&self) -> Arc<RateTable> {
        Arc::clone(&self.table)
    }

    /// Get shared registry reference
    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn fluctuator(&self) -> Arc<RateFluctuator> {
        Arc::clone(&self.fluctuator)
    }

    pub fn broadcaster(&self) -> Arc<RateBroadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// Spawn the fluctuator and the broadcaster, linked by a capacity-1
    /// tick channel
    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.is_running() {
            anyhow::bail!("rate engine already running");
        }

        info!("Starting rate engine");
        let (tick_tx, tick_rx) = mpsc::channel(1);

        let (fluct_shutdown, fluct_shutdown_rx) = oneshot::channel();
        let (bcast_shutdown, bcast_shutdown_rx) = oneshot::channel();

        self.handles
            .push(Arc::clone(&self.broadcaster).spawn(tick_rx, bcast_shutdown_rx));
        self.handles
            .push(Arc::clone(&self.fluctuator).spawn(tick_tx, fluct_shutdown_rx));
        self.shutdowns.push(fluct_shutdown);
        self.shutdowns.push(bcast_shutdown);

        Ok(())
    }

    /// Stop the background tasks and wait for them
    pub async fn stop(&mut self) {
        info!("Stopping rate engine");

        for shutdown in self.shutdowns.drain(..) {
            let _ = shutdown.send(());
        }
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Get statistics
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            table: self.table.stats(),
            ticks: self.fluctuator.ticks(),
            connection_count: self.registry.connection_count(),
            subscription_count: self.registry.subscription_count(),
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub table: RateTableStats,
    pub ticks: u64,
    pub connection_count: usize,
    pub subscription_count: usize,
}
