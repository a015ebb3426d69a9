//! Bridge process: HTTP endpoint plus optional forwarding receiver

use axum::Router;
use courier_mesh::{
    InMemoryPubSub, MeshError, PubSub, Receiver, RedisPubSub, Subscriber, TransportError,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    bridge::{self, BridgeState},
    config::BridgeConfig,
    forward::ForwardingSubscriber,
    sender::{HttpSender, build_client},
};

/// Errors raised while starting or running the bridge
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pub/sub transport error: {0}")]
    Transport(#[from] MeshError),

    #[error("failed to set up forwarding: {0}")]
    Forwarding(#[from] TransportError),

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Open the pub/sub transport named by the configuration
///
/// Redis when `redis_url` is set, otherwise a process-local bus.
pub async fn connect_transport(config: &BridgeConfig) -> Result<Arc<dyn PubSub>, MeshError> {
    match &config.redis_url {
        Some(url) => {
            info!(url = %url, "Using Redis pub/sub transport");
            Ok(Arc::new(RedisPubSub::new(url.clone()).await?))
        }
        None => {
            info!("Using in-memory pub/sub transport");
            Ok(Arc::new(InMemoryPubSub::new()))
        }
    }
}

/// A configured bridge ready to serve
pub struct BridgeServer {
    config: BridgeConfig,
    state: BridgeState,
    transport: Arc<dyn PubSub>,
    forwarders: Vec<Arc<ForwardingSubscriber>>,
}

impl BridgeServer {
    /// Connect the configured transport and build the bridge
    pub async fn connect(config: BridgeConfig) -> Result<Self, ServerError> {
        let transport = connect_transport(&config).await?;
        Self::new(config, transport)
    }

    /// Build the bridge over an existing transport
    ///
    /// Forwarding targets share one HTTP client.
    pub fn new(config: BridgeConfig, transport: Arc<dyn PubSub>) -> Result<Self, ServerError> {
        let state = BridgeState::new(Arc::clone(&transport), config.channel.clone());

        let mut forwarders = Vec::with_capacity(config.forward_targets.len());
        if !config.forward_targets.is_empty() {
            let http = build_client(config.request_timeout())
                .map_err(|e| TransportError::new("forwarding client", e))?;
            for target in &config.forward_targets {
                let sender = HttpSender::with_http_client(target.endpoint.clone(), http.clone());
                forwarders.push(Arc::new(ForwardingSubscriber::new(
                    target.agent.clone(),
                    Arc::new(sender),
                )));
            }
        }

        Ok(Self {
            config,
            state,
            transport,
            forwarders,
        })
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The HTTP router for this bridge
    pub fn router(&self) -> Router {
        bridge::router(self.state.clone(), &self.config)
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.to_string(),
                source,
            })
    }

    /// Serve until `shutdown` completes
    ///
    /// With forwarding targets configured, a [`Receiver`] on the bridge's
    /// channel runs for the lifetime of the server and is stopped after the
    /// HTTP side has drained.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let receiver = self.start_forwarding().await?;

        info!(
            address = ?listener.local_addr().ok(),
            channel = %self.config.channel,
            forwarding = receiver.is_some(),
            "Courier bridge listening"
        );

        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(receiver) = receiver {
            receiver.stop().await;
        }
        info!("Courier bridge stopped");

        result.map_err(ServerError::Serve)
    }

    async fn start_forwarding(&self) -> Result<Option<Receiver>, ServerError> {
        if self.forwarders.is_empty() {
            return Ok(None);
        }

        let receiver = Receiver::new(Arc::clone(&self.transport), self.config.receiver_config());
        for forwarder in &self.forwarders {
            info!(agent = %forwarder.agent(), "Forwarding agent over HTTP");
            receiver
                .register_subscriber(Arc::clone(forwarder) as Arc<dyn Subscriber>)
                .await;
        }
        receiver.start().await?;
        Ok(Some(receiver))
    }
}
