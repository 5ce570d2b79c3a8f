use std::sync::Arc;

use config::Config;
use connection::Connection;
use publish::{HttpTransport, ReqwestTransport};
use registry::ConnectivityRegistry;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod acks;
pub mod address;
pub mod config;
pub mod connection;
pub mod consume;
pub mod correlation;
pub mod credentials;
pub mod error;
pub mod external;
pub mod placeholder;
pub mod publish;
pub mod registry;
pub mod signal;
pub mod signing;
pub mod throttle;
pub mod validation;

/// Returns a builder for the connectivity daemon.
///
/// Loads configuration from the environment, opens the connections defined in
/// the optional definitions file and runs until interrupted, draining every
/// connection on the way out. A custom transport can be injected for tests.
#[bon::builder(finish_fn = start)]
pub async fn run(transport: Option<Arc<dyn HttpTransport>>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("OUTPOST_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("OUTPOST_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let transport = match transport {
        Some(transport) => transport,
        None => Arc::new(ReqwestTransport::new(config.request_timeout())?),
    };

    let registry = ConnectivityRegistry::new(config.clone(), transport);

    if let Some(path) = config.definitions_path() {
        let definitions: Vec<Connection> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        tracing::info!(path, count = definitions.len(), "opening connection definitions");
        for connection in definitions {
            registry.open(connection).await?;
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    registry.close_all().await;

    Ok(())
}
