//! gRPC service implementation

use std::fmt::Display;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, instrument, warn};

use currency_core::{
    ConnectionId, CurrencyPair, RateError, RateResult, StreamMessage, SubscriptionError,
};
use currency_rates::{
    ConnectionClosed, DisconnectReason, RateEngine, RateTable, SubscriptionRegistry,
};

use crate::conversions::rate_error_to_status;
use crate::proto::currency_server::Currency;
use crate::proto::{RateRequest, RateResponse, StreamingRateResponse};

pub const DEFAULT_STREAM_BUFFER: usize = 64;

/// A decoded subscription request, or why it could not be decoded
pub type PairRequest = Result<CurrencyPair, RateError>;

/// Result of a single subscribe request on an open stream
#[derive(Debug, Clone, PartialEq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// Reported in-band; the stream stays open
    Rejected(SubscriptionError),
}

/// Why a subscription stream ended with an error
#[derive(Debug, Error)]
pub enum StreamFailure<E> {
    #[error("unable to read from client: {0}")]
    Transport(E),

    /// The broadcaster dropped the connection after a failed send
    #[error("subscription dropped: {0}")]
    Dropped(RateError),
}

/// A freshly registered subscription connection
#[derive(Debug)]
pub struct OpenConnection {
    pub id: ConnectionId,
    pub outbound: mpsc::Sender<StreamMessage>,
    pub updates: mpsc::Receiver<StreamMessage>,
    pub closed: ConnectionClosed,
}

/// gRPC service implementation
#[derive(Clone)]
pub struct CurrencyService {
    table: Arc<RateTable>,
    registry: Arc<SubscriptionRegistry>,
    stream_buffer: usize,
}

impl CurrencyService {
    pub fn new(table: Arc<RateTable>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            table,
            registry,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn from_engine(engine: &RateEngine) -> Self {
        Self::new(engine.table(), engine.registry())
    }

    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer.max(1);
        self
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Direct rate query. Unlike subscriptions, a pair with equal sides is
    /// rejected before any lookup.
    pub fn rate(&self, pair: CurrencyPair) -> RateResult<f64> {
        if pair.is_identity() {
            return Err(RateError::InvalidArgument {
                base: pair.base,
                destination: pair.destination,
            });
        }
        self.table.get_rate(pair.base, pair.destination)
    }

    /// Register a new connection and create its outbound channel
    pub fn open_connection(&self) -> RateResult<OpenConnection> {
        let id = ConnectionId::generate();
        let (outbound, updates) = mpsc::channel(self.stream_buffer);
        let closed = self.registry.register(id, outbound.clone())?;
        Ok(OpenConnection {
            id,
            outbound,
            updates,
            closed,
        })
    }

    /// End every open subscription stream, e.g. before a graceful shutdown
    pub fn close_connections(&self) -> usize {
        self.registry.close_all()
    }

    /// Add a pair to a connection. A duplicate is a recoverable rejection,
    /// any other registry error is returned as is.
    pub fn subscribe(&self, id: ConnectionId, pair: CurrencyPair) -> RateResult<SubscribeOutcome> {
        match self.registry.add_subscription(id, pair) {
            Ok(()) => Ok(SubscribeOutcome::Subscribed),
            Err(RateError::AlreadySubscribed(pair)) => Ok(SubscribeOutcome::Rejected(
                SubscriptionError::already_subscribed(pair),
            )),
            Err(e) => Err(e),
        }
    }

    /// Read loop for one subscription stream. Ends on end-of-stream, on a
    /// transport error, or once the registry drops the connection. Always
    /// unregisters the connection before returning.
    pub async fn handle_subscription<S, E>(
        &self,
        id: ConnectionId,
        outbound: mpsc::Sender<StreamMessage>,
        mut closed: ConnectionClosed,
        inbound: S,
    ) -> Result<(), StreamFailure<E>>
    where
        S: Stream<Item = Result<PairRequest, E>>,
        E: Display,
    {
        let mut inbound = std::pin::pin!(inbound);

        let result = loop {
            let next = tokio::select! {
                reason = &mut closed => break disconnected(id, reason),
                next = inbound.next() => next,
            };

            let request = match next {
                None => {
                    info!(connection = %id, "Client has closed connection");
                    break Ok(());
                }
                Some(Err(e)) => {
                    error!(connection = %id, "Unable to read from client: {}", e);
                    break Err(StreamFailure::Transport(e));
                }
                Some(Ok(request)) => request,
            };

            let rejection = match request {
                Ok(pair) => {
                    info!(connection = %id, base = %pair.base, dest = %pair.destination, "Handle client request");
                    match self.subscribe(id, pair) {
                        Ok(SubscribeOutcome::Subscribed) => None,
                        Ok(SubscribeOutcome::Rejected(err)) => {
                            warn!(connection = %id, %pair, "Subscription already active");
                            Some(err)
                        }
                        Err(e) => {
                            warn!(connection = %id, "Connection no longer registered: {}", e);
                            break Err(StreamFailure::Dropped(e));
                        }
                    }
                }
                Err(e) => {
                    warn!(connection = %id, "Invalid subscription request: {}", e);
                    Some(SubscriptionError::invalid_request(e.to_string()))
                }
            };

            if let Some(err) = rejection {
                tokio::select! {
                    reason = &mut closed => break disconnected(id, reason),
                    sent = outbound.send(StreamMessage::Error(err)) => {
                        if sent.is_err() {
                            debug!(connection = %id, "Outbound stream closed");
                            break Ok(());
                        }
                    }
                }
            }
        };

        self.registry.unregister(id);
        result
    }
}

fn disconnected<E>(id: ConnectionId, reason: DisconnectReason) -> Result<(), StreamFailure<E>> {
    match reason {
        DisconnectReason::Dropped => {
            warn!(connection = %id, "Connection dropped by broadcaster");
            Err(StreamFailure::Dropped(RateError::UnknownConnection(id)))
        }
        DisconnectReason::Shutdown => {
            info!(connection = %id, "Closing subscription stream for shutdown");
            Ok(())
        }
    }
}

#[tonic::async_trait]
impl Currency for CurrencyService {
    #[instrument(skip(self, request))]
    async fn get_rate(
        &self,
        request: Request<RateRequest>,
    ) -> Result<Response<RateResponse>, Status> {
        let req = request.into_inner();
        let (base, destination) = (req.base, req.destination);

        let pair = CurrencyPair::try_from(req).map_err(rate_error_to_status)?;
        info!(base = %pair.base, dest = %pair.destination, "Handle request for GetRate");

        let rate = self.rate(pair).map_err(|e| {
            warn!(%pair, "GetRate failed: {}", e);
            rate_error_to_status(e)
        })?;

        Ok(Response::new(RateResponse {
            base,
            destination,
            rate,
        }))
    }

    type SubscribeRatesStream =
        Pin<Box<dyn Stream<Item = Result<StreamingRateResponse, Status>> + Send>>;

    #[instrument(skip(self, request))]
    async fn subscribe_rates(
        &self,
        request: Request<Streaming<RateRequest>>,
    ) -> Result<Response<Self::SubscribeRatesStream>, Status> {
        let inbound = request
            .into_inner()
            .map(|item| item.map(CurrencyPair::try_from));

        let OpenConnection {
            id,
            outbound,
            updates,
            closed,
        } = self.open_connection().map_err(rate_error_to_status)?;
        info!(connection = %id, "Subscription stream opened");

        let (done_tx, done_rx) = oneshot::channel();
        let service = self.clone();

        tokio::spawn(async move {
            let result = service
                .handle_subscription(id, outbound, closed, inbound)
                .await
                .map_err(|failure| match failure {
                    StreamFailure::Transport(status) => status,
                    StreamFailure::Dropped(e) => Status::resource_exhausted(e.to_string()),
                });
            let _ = done_tx.send(result);
        });

        // Updates end once both the registry and the read loop released
        // their senders; a failed read loop then contributes its status.
        let updates = ReceiverStream::new(updates).map(|message| Ok(StreamingRateResponse::from(message)));
        let terminal = futures::stream::once(done_rx).filter_map(|done| {
            futures::future::ready(match done {
                Ok(Err(status)) => Some(Err(status)),
                _ => None,
            })
        });

        Ok(Response::new(Box::pin(updates.chain(terminal))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use currency_core::{CurrencyCode, StreamErrorCode};
    use currency_rates::{RateBroadcaster, RateSnapshot};
    use std::collections::HashMap;
    use std::time::Duration;

    fn service() -> CurrencyService {
        let rates = HashMap::from([(CurrencyCode::USD, 1.10), (CurrencyCode::GBP, 0.90)]);
        let table = RateTable::from_snapshot(RateSnapshot::new(CurrencyCode::EUR, rates)).unwrap();
        CurrencyService::new(Arc::new(table), Arc::new(SubscriptionRegistry::new()))
    }

    fn pair(base: CurrencyCode, destination: CurrencyCode) -> CurrencyPair {
        CurrencyPair::new(base, destination)
    }

    #[test]
    fn test_rate_query() {
        let service = service();

        let rate = service.rate(pair(CurrencyCode::GBP, CurrencyCode::USD)).unwrap();
        assert!((rate - 1.2222).abs() < 1e-4);
    }

    #[test]
    fn test_rate_query_rejects_identity_pair() {
        let service = service();

        for code in [CurrencyCode::EUR, CurrencyCode::USD, CurrencyCode::JPY] {
            assert_eq!(
                service.rate(pair(code, code)),
                Err(RateError::InvalidArgument {
                    base: code,
                    destination: code
                })
            );
        }
    }

    #[test]
    fn test_rate_query_unknown_currency() {
        let service = service();

        assert_eq!(
            service.rate(pair(CurrencyCode::EUR, CurrencyCode::JPY)),
            Err(RateError::UnknownCurrency(CurrencyCode::JPY))
        );
    }

    /// Drive the read loop through a channel so the registry can be
    /// inspected while the stream is open
    struct FakeConnection {
        id: ConnectionId,
        requests: mpsc::Sender<Result<PairRequest, String>>,
        outbound: mpsc::Receiver<StreamMessage>,
        handle: tokio::task::JoinHandle<Result<(), StreamFailure<String>>>,
    }

    fn connect(service: &CurrencyService) -> FakeConnection {
        let OpenConnection {
            id,
            outbound: tx,
            updates,
            closed,
        } = service.open_connection().unwrap();
        let (requests, requests_rx) = mpsc::channel(8);

        let svc = service.clone();
        let handle = tokio::spawn(async move {
            svc.handle_subscription(id, tx, closed, ReceiverStream::new(requests_rx))
                .await
        });

        FakeConnection {
            id,
            requests,
            outbound: updates,
            handle,
        }
    }

    async fn finished(
        handle: tokio::task::JoinHandle<Result<(), StreamFailure<String>>>,
    ) -> Result<(), StreamFailure<String>> {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("read loop should have ended")
            .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_duplicate_subscription_reported_in_band() {
        let service = service();
        let mut conn = connect(&service);
        let eur_usd = pair(CurrencyCode::EUR, CurrencyCode::USD);

        conn.requests.send(Ok(Ok(eur_usd))).await.unwrap();
        conn.requests.send(Ok(Ok(eur_usd))).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), conn.outbound.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            StreamMessage::Error(err) => {
                assert_eq!(err.code, StreamErrorCode::InvalidArgument);
                assert_eq!(err.pair, Some(eur_usd));
            }
            other => panic!("unexpected message {other:?}"),
        }

        settle().await;
        assert!(conn.outbound.try_recv().is_err());
        assert_eq!(service.registry().subscriptions(conn.id), Some(vec![eur_usd]));

        // Stream still open: a further request is accepted
        let gbp_usd = pair(CurrencyCode::GBP, CurrencyCode::USD);
        conn.requests.send(Ok(Ok(gbp_usd))).await.unwrap();
        settle().await;
        assert_eq!(
            service.registry().subscriptions(conn.id),
            Some(vec![eur_usd, gbp_usd])
        );

        drop(conn.requests);
        assert!(conn.handle.await.unwrap().is_ok());
        assert!(!service.registry().contains(conn.id));
    }

    #[tokio::test]
    async fn test_identity_pair_subscription_accepted() {
        let service = service();
        let conn = connect(&service);
        let eur_eur = pair(CurrencyCode::EUR, CurrencyCode::EUR);

        conn.requests.send(Ok(Ok(eur_eur))).await.unwrap();
        settle().await;

        assert_eq!(service.registry().subscriptions(conn.id), Some(vec![eur_eur]));
    }

    #[tokio::test]
    async fn test_invalid_request_reported_in_band() {
        let service = service();
        let mut conn = connect(&service);

        conn.requests
            .send(Ok(Err(RateError::InvalidCurrencyCode("enum value 99".to_string()))))
            .await
            .unwrap();

        match conn.outbound.recv().await.unwrap() {
            StreamMessage::Error(err) => {
                assert_eq!(err.code, StreamErrorCode::InvalidArgument);
                assert_eq!(err.pair, None);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(service.registry().subscriptions(conn.id), Some(vec![]));
    }

    #[tokio::test]
    async fn test_transport_error_unregisters() {
        let service = service();
        let conn = connect(&service);

        conn.requests
            .send(Ok(Ok(pair(CurrencyCode::EUR, CurrencyCode::GBP))))
            .await
            .unwrap();
        conn.requests.send(Err("connection reset".to_string())).await.unwrap();

        let result = conn.handle.await.unwrap();
        assert!(matches!(result, Err(StreamFailure::Transport(ref e)) if e == "connection reset"));
        assert!(!service.registry().contains(conn.id));
    }

    #[tokio::test]
    async fn test_dropped_connection_ends_idle_read_loop() {
        let service = service();
        let conn = connect(&service);
        settle().await;

        // As the broadcaster does after a failed send; the client sends nothing
        service.registry().unregister(conn.id);

        let result = finished(conn.handle).await;
        assert!(matches!(
            result,
            Err(StreamFailure::Dropped(RateError::UnknownConnection(id))) if id == conn.id
        ));
        drop(conn.requests);
    }

    #[tokio::test]
    async fn test_slow_subscriber_stream_ends_after_timeout() {
        let service = service().with_stream_buffer(1);
        let broadcaster = RateBroadcaster::new(
            Arc::clone(&service.table),
            Arc::clone(&service.registry),
            Duration::from_millis(50),
        );
        let mut conn = connect(&service);
        let eur_usd = pair(CurrencyCode::EUR, CurrencyCode::USD);

        conn.requests.send(Ok(Ok(eur_usd))).await.unwrap();
        settle().await;

        // Nobody drains the outbound buffer: the second push times out
        assert_eq!(broadcaster.broadcast_once().await.delivered, 1);
        assert_eq!(broadcaster.broadcast_once().await.dropped, vec![conn.id]);

        let result = finished(conn.handle).await;
        assert!(matches!(result, Err(StreamFailure::Dropped(_))));

        // Buffered update is still delivered, then the stream ends
        assert!(matches!(conn.outbound.recv().await, Some(StreamMessage::Rate(q)) if q.pair == eur_usd));
        assert!(conn.outbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_connections_ends_every_stream() {
        let service = service();
        let mut first = connect(&service);
        let mut second = connect(&service);
        first
            .requests
            .send(Ok(Ok(pair(CurrencyCode::EUR, CurrencyCode::USD))))
            .await
            .unwrap();
        settle().await;

        assert_eq!(service.close_connections(), 2);

        assert!(finished(first.handle).await.is_ok());
        assert!(finished(second.handle).await.is_ok());
        assert!(first.outbound.recv().await.is_none());
        assert!(second.outbound.recv().await.is_none());
        assert_eq!(service.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_with_iter() {
        let service = service();
        let conn = service.open_connection().unwrap();
        let requests = futures::stream::iter(vec![
            Ok::<_, String>(Ok(pair(CurrencyCode::EUR, CurrencyCode::USD))),
            Ok(Ok(pair(CurrencyCode::USD, CurrencyCode::EUR))),
        ]);

        service
            .handle_subscription(conn.id, conn.outbound, conn.closed, requests)
            .await
            .unwrap();
        assert_eq!(service.registry().connection_count(), 0);
    }
}
