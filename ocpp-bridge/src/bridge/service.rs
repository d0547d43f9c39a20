//! Bridge service
//!
//! Wires the charge point endpoint, the normalizer, the dispatcher and both
//! command intakes together, and runs them until shutdown.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use super::dispatcher::Dispatcher;
use super::intake::{command_router, CommandQueue};
use super::normalizer::Normalizer;
use crate::backend::{
    ChannelError, CommandSource, EventChannel, EventPublisher, HttpTransactionClient, RedisChannel,
    TransactionError, TransactionLookup,
};
use crate::config::{BridgeConfig, ConfigError};
use crate::ocpp::CentralSystem;

/// Errors that stop the bridge
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Transaction client error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The running bridge: charge point endpoint plus backend intakes
pub struct Bridge {
    config: BridgeConfig,
    central: Arc<CentralSystem>,
    normalizer: Arc<Normalizer>,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<EventPublisher>,
    commands: Arc<dyn CommandSource>,
}

impl Bridge {
    /// Connect to the production backends (Redis and the transaction API)
    pub async fn connect(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let channel = Arc::new(
            RedisChannel::connect(&config.redis_url, &config.events_key, &config.commands_key)
                .await?
                .with_poll_timeout(config.poll_timeout),
        );
        let transactions = Arc::new(HttpTransactionClient::new(&config.base_url, config.lookup_timeout)?);

        Ok(Self::with_backends(config, channel.clone(), channel, transactions))
    }

    /// Assemble the bridge over arbitrary backends
    pub fn with_backends(
        config: BridgeConfig,
        events: Arc<dyn EventChannel>,
        commands: Arc<dyn CommandSource>,
        transactions: Arc<dyn TransactionLookup>,
    ) -> Self {
        let central = Arc::new(CentralSystem::new(config.central_system()));
        let publisher = Arc::new(EventPublisher::new(events).with_timeout(config.publish_timeout));
        let normalizer = Arc::new(
            Normalizer::new(publisher.clone(), transactions)
                .with_heartbeat_interval(config.heartbeat_interval),
        );
        let dispatcher = Arc::new(Dispatcher::new(central.clone()));

        Self {
            config,
            central,
            normalizer,
            dispatcher,
            publisher,
            commands,
        }
    }

    /// HTTP command API
    pub fn router(&self) -> Router {
        command_router(self.dispatcher.clone())
    }

    /// Bind the configured addresses and run until Ctrl-C
    pub async fn run(self) -> Result<(), BridgeError> {
        let ws_listener = TcpListener::bind(self.config.listen_addr).await?;
        let http_listener = TcpListener::bind(self.config.command_addr).await?;

        self.serve(ws_listener, http_listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
    }

    /// Run on already bound listeners until `shutdown` resolves
    pub async fn serve(
        self,
        ws_listener: TcpListener,
        http_listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), BridgeError> {
        info!(
            "Starting OCPP bridge: devices={}, commands={}, backend={}",
            ws_listener.local_addr()?,
            http_listener.local_addr()?,
            self.config.base_url
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut central_task = tokio::spawn(
            self.central
                .clone()
                .serve(ws_listener, self.normalizer.clone()),
        );

        let router = self.router();
        let http_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, router).await {
                error!("Command API error: {}", e);
            }
        });

        let queue = CommandQueue::new(self.commands.clone(), self.dispatcher.clone());
        let queue_task = tokio::spawn(queue.run(shutdown_rx));

        let outcome = tokio::select! {
            result = &mut central_task => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(BridgeError::Io(e)),
                Err(e) => Err(BridgeError::Io(std::io::Error::other(e))),
            },
            _ = shutdown => Ok(()),
        };

        let _ = shutdown_tx.send(true);
        let _ = queue_task.await;
        http_task.abort();
        central_task.abort();

        info!(
            published = self.publisher.published(),
            failed = self.publisher.failed(),
            "OCPP bridge stopped"
        );
        outcome
    }
}
