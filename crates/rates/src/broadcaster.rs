//! Fan-out of recomputed rates to subscribed connections
//!
//! One best-effort push per subscribed pair per tick. No retries. A
//! connection whose channel is closed, or which does not accept a message
//! within `send_timeout`, is dropped from the registry after the pass;
//! other connections are unaffected.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use currency_core::{ConnectionId, RateQuote, StreamMessage};

use crate::fluctuator::RateTick;
use crate::registry::SubscriptionRegistry;
use crate::table::RateTable;

/// Outcome of one broadcast pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastReport {
    pub connections: usize,
    pub delivered: usize,
    /// Pairs whose rate could not be computed
    pub skipped: usize,
    pub dropped: Vec<ConnectionId>,
}

pub struct RateBroadcaster {
    table: Arc<RateTable>,
    registry: Arc<SubscriptionRegistry>,
    send_timeout: Duration,
}

impl RateBroadcaster {
    pub fn new(
        table: Arc<RateTable>,
        registry: Arc<SubscriptionRegistry>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            table,
            registry,
            send_timeout,
        }
    }

    /// Push the current rate of every subscribed pair to its connection
    pub async fn broadcast_once(&self) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for conn in self.registry.snapshot() {
            report.connections += 1;

            for pair in &conn.pairs {
                let rate = match self.table.get_rate(pair.base, pair.destination) {
                    Ok(rate) => rate,
                    Err(e) => {
                        error!(connection = %conn.id, %pair, "Unable to get updated rate: {}", e);
                        report.skipped += 1;
                        continue;
                    }
                };

                let message = StreamMessage::Rate(RateQuote::new(*pair, rate));
                match tokio::time::timeout(self.send_timeout, conn.sender.send(message)).await {
                    Ok(Ok(())) => report.delivered += 1,
                    Ok(Err(_)) => {
                        warn!(connection = %conn.id, %pair, "Unable to send updated rate, connection closed");
                        report.dropped.push(conn.id);
                        break;
                    }
                    Err(_) => {
                        warn!(
                            connection = %conn.id,
                            %pair,
                            timeout = ?self.send_timeout,
                            "Unable to send updated rate, connection not keeping up"
                        );
                        report.dropped.push(conn.id);
                        break;
                    }
                }
            }
        }

        for id in &report.dropped {
            self.registry.unregister(*id);
        }

        report
    }

    /// Consume ticks until shutdown or until the producer goes away
    pub async fn run(&self, mut ticks: mpsc::Receiver<RateTick>, mut shutdown: oneshot::Receiver<()>) {
        info!("Starting rate broadcaster");

        loop {
            tokio::select! {
                tick = ticks.recv() => {
                    let Some(tick) = tick else {
                        info!("Tick channel closed, stopping broadcaster");
                        break;
                    };

                    info!(sequence = tick.sequence, "Got updated rates");
                    let report = self.broadcast_once().await;
                    debug!(
                        sequence = tick.sequence,
                        connections = report.connections,
                        delivered = report.delivered,
                        skipped = report.skipped,
                        dropped = report.dropped.len(),
                        "Broadcast pass complete"
                    );
                }
                _ = &mut shutdown => {
                    info!("Broadcaster shutdown requested");
                    break;
                }
            }
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        ticks: mpsc::Receiver<RateTick>,
        shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(ticks, shutdown).await })
    }
}
