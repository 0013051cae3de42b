//! Connection and subscription registry
//!
//! Keyed by `ConnectionId` rather than by transport objects. Each entry
//! holds the connection's outbound sender, which is the only path for
//! writing to that connection: the broadcaster and the connection's own
//! read loop both send through it, so writes are serialized per connection.
//!
//! Each entry also owns the sending half of a close signal. Removing the
//! entry resolves the connection's `ConnectionClosed`, which is how a read
//! loop learns that the broadcaster dropped it or that the server is
//! shutting down.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use currency_core::{ConnectionId, CurrencyPair, RateError, RateResult, StreamMessage};

/// Why a connection left the registry while its stream was still open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Removed after a failed or timed-out send
    Dropped,
    /// Closed by `close_all` during server shutdown
    Shutdown,
}

/// Resolves once the connection is removed from the registry
#[derive(Debug)]
pub struct ConnectionClosed(oneshot::Receiver<DisconnectReason>);

impl Future for ConnectionClosed {
    type Output = DisconnectReason;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A sender dropped without a reason means a plain unregister
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|reason| reason.unwrap_or(DisconnectReason::Dropped))
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: mpsc::Sender<StreamMessage>,
    pairs: Vec<CurrencyPair>,
    registered_at: Instant,
    closed: oneshot::Sender<DisconnectReason>,
}

/// Point-in-time copy of one registry entry
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub sender: mpsc::Sender<StreamMessage>,
    pub pairs: Vec<CurrencyPair>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    connections: DashMap<ConnectionId, ConnectionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection with an empty subscription set. The returned
    /// future resolves when the connection is removed again.
    pub fn register(
        &self,
        id: ConnectionId,
        sender: mpsc::Sender<StreamMessage>,
    ) -> RateResult<ConnectionClosed> {
        match self.connections.entry(id) {
            Entry::Occupied(_) => Err(RateError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                let (closed, closed_rx) = oneshot::channel();
                slot.insert(ConnectionEntry {
                    sender,
                    pairs: Vec::new(),
                    registered_at: Instant::now(),
                    closed,
                });
                debug!(connection = %id, "Connection registered");
                Ok(ConnectionClosed(closed_rx))
            }
        }
    }

    /// Remove a connection and its subscriptions. Idempotent.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some((_, entry)) => {
                debug!(
                    connection = %id,
                    subscriptions = entry.pairs.len(),
                    age = ?entry.registered_at.elapsed(),
                    "Connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Remove every connection, signalling `DisconnectReason::Shutdown`
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();

        let mut closed = 0;
        for id in ids {
            if let Some((_, entry)) = self.connections.remove(&id) {
                let _ = entry.closed.send(DisconnectReason::Shutdown);
                closed += 1;
            }
        }

        info!(connections = closed, "Closed all subscription connections");
        closed
    }

    pub fn add_subscription(&self, id: ConnectionId, pair: CurrencyPair) -> RateResult<()> {
        let mut entry = self
            .connections
            .get_mut(&id)
            .ok_or(RateError::UnknownConnection(id))?;

        if entry.pairs.contains(&pair) {
            return Err(RateError::AlreadySubscribed(pair));
        }
        entry.pairs.push(pair);
        Ok(())
    }

    pub fn subscriptions(&self, id: ConnectionId) -> Option<Vec<CurrencyPair>> {
        self.connections.get(&id).map(|entry| entry.pairs.clone())
    }

    pub fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<StreamMessage>> {
        self.connections.get(&id).map(|entry| entry.sender.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Stable copy of the registry, ordered by connection id. Later
    /// (un)registrations do not affect a snapshot already taken.
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshot: Vec<_> = self
            .connections
            .iter()
            .map(|entry| ConnectionSnapshot {
                id: *entry.key(),
                sender: entry.value().sender.clone(),
                pairs: entry.value().pairs.clone(),
            })
            .collect();
        snapshot.sort_by_key(|conn| conn.id);
        snapshot
    }

    /// Visit every connection of a snapshot
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(ConnectionId, &mpsc::Sender<StreamMessage>, &[CurrencyPair]),
    {
        for conn in self.snapshot() {
            visit(conn.id, &conn.sender, &conn.pairs);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.connections.iter().map(|entry| entry.pairs.len()).sum()
    }
}
