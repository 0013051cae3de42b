//! Currency service
//!
//! Main entry point for the gRPC server

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use currency_core::{LogFormat, ServiceConfig, SourceKind};
use currency_grpc_server::{CurrencyService, GrpcServerBuilder, GrpcServerConfig};
use currency_rates::{EcbRateSource, EngineConfig, RateEngine, RateSource, StaticRateSource};

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
    }
}

fn rate_source(config: &ServiceConfig) -> anyhow::Result<Box<dyn RateSource>> {
    let source: Box<dyn RateSource> = match config.rates.source {
        SourceKind::Ecb => Box::new(EcbRateSource::new(config.rates.ecb_url.clone())),
        SourceKind::Static => Box::new(StaticRateSource::from_config(
            config.rates.base_currency,
            &config.rates.static_rates,
        )?),
    };
    Ok(source)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received termination signal");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let config = ServiceConfig::load()?;
    init_logging(config.log_format);

    info!("Starting currency service v{}", env!("CARGO_PKG_VERSION"));

    let source = rate_source(&config)?;
    let mut engine = RateEngine::from_source(EngineConfig::from(&config.rates), source.as_ref()).await?;
    if engine.table().base() != config.rates.base_currency {
        warn!(
            configured = %config.rates.base_currency,
            loaded = %engine.table().base(),
            "Rate source base differs from configured base currency"
        );
    }

    engine.start()?;
    info!("Background services started");

    let service = CurrencyService::from_engine(&engine).with_stream_buffer(config.rates.stream_buffer);
    let server = GrpcServerBuilder::new(service)
        .config(GrpcServerConfig::from(&config.server))
        .build();

    // Setup shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(());
    });

    info!("gRPC server listening on {}", server.address());
    info!("Press Ctrl+C to shutdown");

    let served = server.start_with_shutdown(shutdown_rx).await;
    engine.stop().await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e);
    }

    info!("Server shutdown complete");
    Ok(())
}
