//! gRPC server configuration and startup

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use currency_core::ServerConfig;

use crate::proto::currency_server::CurrencyServer;
use crate::service::CurrencyService;

/// Server configuration
#[derive(Debug, Clone)]
pub struct GrpcServerConfig {
    pub host: String,
    pub port: u16,
    pub concurrency_limit_per_connection: usize,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
}

impl Default for GrpcServerConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for GrpcServerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            concurrency_limit_per_connection: config.concurrency_limit_per_connection,
            keep_alive_interval: Duration::from_secs(config.keep_alive_interval_secs),
            keep_alive_timeout: Duration::from_secs(config.keep_alive_timeout_secs),
        }
    }
}

/// gRPC server wrapper
pub struct GrpcServer {
    config: GrpcServerConfig,
    service: CurrencyService,
}

impl GrpcServer {
    pub fn new(config: GrpcServerConfig, service: CurrencyService) -> Self {
        Self { config, service }
    }

    fn builder(&self) -> Server {
        Server::builder()
            .concurrency_limit_per_connection(self.config.concurrency_limit_per_connection)
            .tcp_keepalive(Some(self.config.keep_alive_interval))
            .http2_keepalive_interval(Some(self.config.keep_alive_interval))
            .http2_keepalive_timeout(Some(self.config.keep_alive_timeout))
    }

    /// Start with graceful shutdown
    pub async fn start_with_shutdown(
        &self,
        shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        let addr: SocketAddr = self.address().parse()?;

        info!("Starting gRPC server on {} (with graceful shutdown)", addr);

        let signal = async {
            shutdown.await.ok();
            info!("Shutdown signal received");
        };

        self.builder()
            .add_service(CurrencyServer::new(self.service.clone()))
            .serve_with_shutdown(addr, self.close_streams_on(signal))
            .await?;

        Ok(())
    }

    /// Serve on an already bound listener, e.g. an ephemeral port
    pub async fn serve_with_listener<F>(&self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting gRPC server on {}", listener.local_addr()?);

        self.builder()
            .add_service(CurrencyServer::new(self.service.clone()))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                self.close_streams_on(shutdown),
            )
            .await?;

        Ok(())
    }

    /// Subscription streams never end on their own, so the connection drain
    /// only completes once they are closed
    fn close_streams_on<F>(&self, signal: F) -> impl Future<Output = ()>
    where
        F: Future<Output = ()>,
    {
        let service = self.service.clone();
        async move {
            signal.await;
            let closed = service.close_connections();
            info!(streams = closed, "Closed open subscription streams");
        }
    }

    /// Get server address
    pub fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

/// Builder for server configuration
pub struct GrpcServerBuilder {
    config: GrpcServerConfig,
    service: CurrencyService,
}

impl GrpcServerBuilder {
    pub fn new(service: CurrencyService) -> Self {
        Self {
            config: GrpcServerConfig::default(),
            service,
        }
    }

    pub fn config(mut self, config: GrpcServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn build(self) -> GrpcServer {
        GrpcServer::new(self.config, self.service)
    }
}
