//! Wires endpoint resolution, the connection and the router together.

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::auth::{EndpointResolver, ResolveError};
use crate::config::{ConnectionConfig, ServiceConfig};
use crate::connection::{ConnectionManager, Transport};
use crate::router::MessageRouter;
use crate::session::{ConversationSession, StoreResult, TurnStore};

/// Surfaced to the active conversation when no URL could be obtained
pub const RESOLVE_FAILED: &str = "failed to obtain websocket url";

pub struct ChatClient {
    config: ServiceConfig,
    resolver: Arc<dyn EndpointResolver>,
    connection: Arc<ConnectionManager>,
    router: MessageRouter,
    store: Arc<dyn TurnStore>,
    error_forwarder: JoinHandle<()>,
}

impl ChatClient {
    /// Must be called inside a tokio runtime
    pub fn new(
        config: ServiceConfig,
        resolver: Arc<dyn EndpointResolver>,
        transport: Arc<dyn Transport>,
        connection_config: ConnectionConfig,
        store: Arc<dyn TurnStore>,
    ) -> Self {
        let router = MessageRouter::new();
        let connection = Arc::new(ConnectionManager::new(
            transport,
            router.clone(),
            connection_config,
        ));

        // Connection errors reach whichever conversation is active
        let mut errors = connection.subscribe_errors();
        let forward_to = router.clone();
        let error_forwarder = tokio::spawn(async move {
            while errors.changed().await.is_ok() {
                let error = errors.borrow_and_update().clone();
                if let Some(message) = error {
                    forward_to.notify_error(&message).await;
                }
            }
        });

        Self {
            config,
            resolver,
            connection,
            router,
            store,
            error_forwarder,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Resolve a fresh signed URL and (re)connect to it. On failure the
    /// connection is left idle and the active conversation sees the error.
    pub async fn start(&self) -> Result<(), ResolveError> {
        match self
            .resolver
            .resolve(&self.config.host, &self.config.path)
            .await
        {
            Ok(url) => {
                tracing::info!("Resolved WebSocket endpoint for {}", self.config.host);
                self.connection.set_endpoint(Some(url)).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to get WebSocket URL: {}", e);
                self.connection.set_endpoint(None).await;
                self.router.notify_error(RESOLVE_FAILED).await;
                Err(e)
            }
        }
    }

    /// Open (or reopen) a conversation and make it the active receiver
    pub async fn open_session(&self, id: &str) -> StoreResult<Arc<ConversationSession>> {
        let session = ConversationSession::open(
            id,
            self.config.clone(),
            self.store.clone(),
            self.connection.clone(),
        )
        .await?;
        session.attach(&self.router);
        Ok(session)
    }

    /// Close the connection and stop forwarding errors
    pub async fn shutdown(&self) {
        self.connection.teardown().await;
        self.error_forwarder.abort();
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.error_forwarder.abort();
    }
}
