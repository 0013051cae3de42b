//! Simulated rate drift
//!
//! The reference feed only publishes once a day, so movement between
//! publications is simulated: on every tick each non-base rate moves up or
//! down by a uniformly drawn fraction of at most `max_change`.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::table::RateTable;

#[derive(Debug, Clone)]
pub struct FluctuatorConfig {
    pub interval: Duration,
    pub max_change: f64,
}

impl Default for FluctuatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_change: 0.10,
        }
    }
}

/// Notification emitted once per completed mutation pass
#[derive(Debug, Clone, PartialEq)]
pub struct RateTick {
    pub sequence: u64,
    pub changed: usize,
    pub at: DateTime<Utc>,
}

pub struct RateFluctuator {
    config: FluctuatorConfig,
    table: Arc<RateTable>,
    sequence: AtomicU64,
}

impl RateFluctuator {
    pub fn new(config: FluctuatorConfig, table: Arc<RateTable>) -> Self {
        Self {
            config,
            table,
            sequence: AtomicU64::new(0),
        }
    }

    /// One mutation pass using the thread-local RNG
    pub fn tick(&self) -> RateTick {
        self.tick_with(&mut rand::rng())
    }

    /// One mutation pass: every non-base entry is scaled by a factor in
    /// `[1 - max_change, 1 + max_change]`, all under one table lock.
    pub fn tick_with<R: Rng>(&self, rng: &mut R) -> RateTick {
        let base = self.table.base();
        let factors: Vec<_> = self
            .table
            .currencies()
            .into_iter()
            .filter(|code| *code != base)
            .map(|code| (code, self.draw_factor(rng)))
            .collect();

        let changed = match self.table.apply_batch(&factors) {
            Ok(n) => n,
            Err(e) => {
                error!("Unable to apply rate fluctuation: {}", e);
                0
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(sequence, changed, "Rates fluctuated");

        RateTick {
            sequence,
            changed,
            at: Utc::now(),
        }
    }

    fn draw_factor<R: Rng>(&self, rng: &mut R) -> f64 {
        let change = rng.random::<f64>() * self.config.max_change;
        if rng.random_bool(0.5) {
            1.0 + change
        } else {
            1.0 - change
        }
    }

    pub fn ticks(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }

    /// Tick on the configured interval until shutdown or until the
    /// receiving side goes away. Sending waits for the consumer to take the
    /// previous tick, ticks are never dropped.
    pub async fn run(&self, tx: mpsc::Sender<RateTick>, mut shutdown: oneshot::Receiver<()>) {
        info!(interval = ?self.config.interval, "Starting rate fluctuator");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let tick = self.tick();
                    tokio::select! {
                        sent = tx.send(tick) => {
                            if sent.is_err() {
                                info!("Tick receiver dropped, stopping fluctuator");
                                break;
                            }
                        }
                        _ = &mut shutdown => {
                            info!("Fluctuator shutdown requested");
                            break;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Fluctuator shutdown requested");
                    break;
                }
            }
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        tx: mpsc::Sender<RateTick>,
        shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(tx, shutdown).await })
    }
}
