//! Rate client for services that convert prices
//!
//! `get_rate` warms a local cache with one `GetRate` call per uncached
//! pair and then watches that pair on a subscription stream shared by the
//! whole client, so cached rates follow every pushed update.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Status;
use tracing::{debug, error, info, warn};

use currency_core::{CurrencyPair, StreamMessage};

use crate::conversions::rate_error_to_status;
use crate::proto::currency_client::CurrencyClient;
use crate::proto::{RateRequest, StreamingRateResponse};

const REQUEST_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct RateClient {
    inner: CurrencyClient<Channel>,
    cache: Arc<DashMap<CurrencyPair, f64>>,
    /// Request side of the stream refreshing `get_rate` results
    shared: Arc<Mutex<Option<mpsc::Sender<RateRequest>>>>,
}

impl RateClient {
    pub async fn connect(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let endpoint = endpoint.into();
        info!("Connecting to currency service at {}", endpoint);

        let inner = CurrencyClient::connect(endpoint).await?;
        Ok(Self::new(inner))
    }

    pub fn new(inner: CurrencyClient<Channel>) -> Self {
        Self {
            inner,
            cache: Arc::new(DashMap::new()),
            shared: Arc::new(Mutex::new(None)),
        }
    }

    /// Cached rate, or a single `GetRate` call whose result is cached and
    /// then kept up to date through the shared subscription stream
    pub async fn get_rate(&self, pair: CurrencyPair) -> Result<f64, Status> {
        if let Some(rate) = self.cached(pair) {
            return Ok(rate);
        }

        let request = RateRequest::try_from(pair).map_err(rate_error_to_status)?;
        let response = self.inner.clone().get_rate(request.clone()).await?.into_inner();
        self.cache.insert(pair, response.rate);

        if let Err(status) = self.watch_shared(request).await {
            warn!(%pair, "Unable to subscribe for rate updates: {}", status);
        }

        Ok(response.rate)
    }

    /// Send a request on the shared stream, reopening it if it has ended
    async fn watch_shared(&self, request: RateRequest) -> Result<(), Status> {
        let mut shared = self.shared.lock().await;

        let requests = match shared.as_ref() {
            Some(requests) if !requests.is_closed() => requests.clone(),
            _ => {
                let (requests, _handle) = self.open_stream(None).await?;
                *shared = Some(requests.clone());
                requests
            }
        };

        requests
            .send(request)
            .await
            .map_err(|_| Status::unavailable("rate subscription closed"))
    }

    pub fn cached(&self, pair: CurrencyPair) -> Option<f64> {
        self.cache.get(&pair).map(|rate| *rate)
    }

    /// Open a rate subscription stream. Pushed rates update the cache;
    /// every decoded message is also forwarded to `Subscription::next_event`.
    pub async fn subscribe(&self) -> Result<Subscription, Status> {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (requests, handle) = self.open_stream(Some(events_tx)).await?;

        Ok(Subscription {
            requests,
            events,
            handle,
        })
    }

    async fn open_stream(
        &self,
        events: Option<mpsc::Sender<StreamMessage>>,
    ) -> Result<(mpsc::Sender<RateRequest>, JoinHandle<()>), Status> {
        let (requests, requests_rx) = mpsc::channel(REQUEST_BUFFER);

        let mut inbound = self
            .inner
            .clone()
            .subscribe_rates(ReceiverStream::new(requests_rx))
            .await?
            .into_inner();

        let cache = Arc::clone(&self.cache);
        let handle = tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => handle_update(&cache, events.as_ref(), message),
                    Ok(None) => {
                        info!("Rate subscription closed by server");
                        break;
                    }
                    Err(status) => {
                        error!("Error while waiting for message: {}", status);
                        break;
                    }
                }
            }
        });

        Ok((requests, handle))
    }
}

fn handle_update(
    cache: &DashMap<CurrencyPair, f64>,
    events: Option<&mpsc::Sender<StreamMessage>>,
    message: StreamingRateResponse,
) {
    let message = match StreamMessage::try_from(message) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring undecodable rate update: {}", e);
            return;
        }
    };

    match &message {
        StreamMessage::Rate(quote) => {
            debug!(pair = %quote.pair, rate = quote.rate, "Received updated rate from server");
            cache.insert(quote.pair, quote.rate);
        }
        StreamMessage::Error(err) => {
            let details = err.pair.map(|p| p.to_string()).unwrap_or_default();
            error!(
                code = ?err.code,
                details = %details,
                "Received error from currency service rate subscription: {}",
                err.message
            );
        }
    }

    if let Some(events) = events {
        if events.try_send(message).is_err() {
            debug!("Subscription event buffer full, event not forwarded");
        }
    }
}

/// An open rate subscription stream
pub struct Subscription {
    requests: mpsc::Sender<RateRequest>,
    events: mpsc::Receiver<StreamMessage>,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Register interest in a pair on this stream
    pub async fn watch(&self, pair: CurrencyPair) -> anyhow::Result<()> {
        let request = RateRequest::try_from(pair)?;
        self.requests
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("rate subscription closed"))?;
        Ok(())
    }

    /// Next pushed rate or in-band error; `None` once the stream ended
    pub async fn next_event(&mut self) -> Option<StreamMessage> {
        self.events.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_finished()
    }

    /// Close the request side and wait for the server to end the stream
    pub async fn close(self) {
        drop(self.requests);
        let _ = self.handle.await;
    }
}
