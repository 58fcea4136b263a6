//! Owns the single live connection to the chat service.
//!
//! Each connection instance runs as one driver task: open, pump frames until
//! the link closes, then back off (`base * 2^retries`) and reopen, up to
//! `max_retries` times. Explicit teardown cancels the driver, including a
//! pending backoff sleep, and closes the link without reconnecting.

mod transport;

pub use transport::{memory, FrameSink, FrameStream, Link, Transport, WebSocketTransport};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::router::MessageRouter;
use crate::types::ConnectionState;

/// Terminal error published once reconnect attempts are exhausted
pub const SERVER_UNREACHABLE: &str = "server unreachable";

/// Anything that can transmit an encoded envelope
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, payload: String) -> Result<(), ConnectionError>;
}

/// State observable by other components. Writes carry the generation of the
/// driver making them so a torn-down driver cannot clobber its successor.
struct Shared {
    generation: StdMutex<u64>,
    retries: AtomicU32,
    state: watch::Sender<ConnectionState>,
    error: watch::Sender<Option<String>>,
}

impl Shared {
    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new generation, retiring whichever driver held the old one
    fn advance(&self) -> u64 {
        let mut generation = self.generation();
        *generation += 1;
        *generation
    }

    fn is_current(&self, generation: u64) -> bool {
        *self.generation() == generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        let current = self.generation();
        if *current == generation {
            self.state.send_replace(state);
        }
    }

    fn set_error(&self, generation: u64, message: impl Into<String>) {
        let current = self.generation();
        if *current == generation {
            self.error.send_replace(Some(message.into()));
        }
    }

    fn opened(&self, generation: u64) {
        let current = self.generation();
        if *current == generation {
            self.retries.store(0, Ordering::SeqCst);
            self.error.send_replace(None);
            self.state.send_replace(ConnectionState::Connected);
        }
    }
}

/// A payload waiting for the driver, with the channel that hears how the
/// write went
type Outbound = (String, oneshot::Sender<Result<(), ConnectionError>>);

/// Handle on a running driver task
struct Driver {
    url: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    router: MessageRouter,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    endpoint: Mutex<Option<String>>,
    driver: Mutex<Option<Driver>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        router: MessageRouter,
        config: ConnectionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (error, _) = watch::channel(None);
        Self {
            transport,
            router,
            config,
            shared: Arc::new(Shared {
                generation: StdMutex::new(0),
                retries: AtomicU32::new(0),
                state,
                error,
            }),
            endpoint: Mutex::new(None),
            driver: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.error.borrow().clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.shared.error.subscribe()
    }

    pub async fn endpoint(&self) -> Option<String> {
        self.endpoint.lock().await.clone()
    }

    /// Replace the endpoint URL. A different URL tears down the current
    /// connection and opens a fresh one; `None` just tears down.
    pub async fn set_endpoint(&self, url: Option<String>) {
        {
            let mut endpoint = self.endpoint.lock().await;
            let unchanged = *endpoint == url;
            let alive = self
                .driver
                .lock()
                .await
                .as_ref()
                .is_some_and(|d| Some(&d.url) == url.as_ref() && !d.task.is_finished());
            if unchanged && alive {
                return;
            }
            *endpoint = url;
            if endpoint.is_none() {
                drop(endpoint);
                self.teardown().await;
                return;
            }
        }
        self.connect().await;
    }

    /// Open a connection to the current endpoint, replacing any existing one.
    /// No-op while the endpoint is unknown.
    pub async fn connect(&self) {
        let Some(url) = self.endpoint.lock().await.clone() else {
            tracing::debug!("No endpoint yet, not connecting");
            return;
        };

        let mut driver = self.driver.lock().await;
        let generation = self.shared.advance();
        if let Some(previous) = driver.take() {
            stop_driver(previous);
        }
        self.shared.retries.store(0, Ordering::SeqCst);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let task = DriverTask {
            generation,
            url: url.clone(),
            transport: self.transport.clone(),
            router: self.router.clone(),
            config: self.config.clone(),
            shared: self.shared.clone(),
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };

        *driver = Some(Driver {
            url,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
            task: tokio::spawn(task.run()),
        });
    }

    /// Close the connection without reconnecting and cancel pending retries
    pub async fn teardown(&self) {
        let previous = self.driver.lock().await.take();
        if let Some(previous) = previous {
            // Retire the generation first so the stopping driver stays silent
            self.shared.advance();
            let task = stop_driver(previous);
            let _ = task.await;
            self.shared.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Transmit `payload` if connected, resolving once the frame is written.
    /// A payload the driver drops because the link closed under it fails
    /// with `NotConnected`.
    pub async fn send_message(&self, payload: String) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Failed(_) => {
                tracing::error!("WebSocket is not connected (retries exhausted)");
                return Err(ConnectionError::ExhaustedRetries(self.config.max_retries));
            }
            _ => {
                tracing::error!("WebSocket is not connected");
                return Err(ConnectionError::NotConnected);
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let driver = self.driver.lock().await;
            let Some(driver) = driver.as_ref() else {
                return Err(ConnectionError::NotConnected);
            };
            tracing::debug!("Sending message to WebSocket: {}", payload);
            driver
                .outbound
                .send((payload, reply_tx))
                .map_err(|_| ConnectionError::NotConnected)?;
        }

        // A driver that stops first drops the reply sender
        reply_rx.await.unwrap_or(Err(ConnectionError::NotConnected))
    }
}

fn stop_driver(driver: Driver) -> JoinHandle<()> {
    let Driver {
        shutdown, task, ..
    } = driver;
    let _ = shutdown.send(());
    task
}

#[async_trait]
impl MessageSink for ConnectionManager {
    async fn send_message(&self, payload: String) -> Result<(), ConnectionError> {
        ConnectionManager::send_message(self, payload).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Dropping the shutdown sender stops the driver
        if let Some(driver) = self.driver.get_mut().take() {
            self.shared.advance();
            stop_driver(driver);
        }
    }
}

enum LinkEnd {
    Closed,
    Shutdown,
}

struct DriverTask {
    generation: u64,
    url: String,
    transport: Arc<dyn Transport>,
    router: MessageRouter,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: oneshot::Receiver<()>,
}

impl DriverTask {
    async fn run(mut self) {
        let generation = self.generation;

        loop {
            self.shared.set_state(generation, ConnectionState::Connecting);

            let opened = tokio::select! {
                _ = &mut self.shutdown => break,
                result = self.transport.open(&self.url) => result,
            };

            match opened {
                Ok(link) => {
                    self.shared.opened(generation);
                    tracing::info!("WebSocket connected");
                    if let LinkEnd::Shutdown = self.pump(link).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("WebSocket error: {}", e);
                    self.shared.set_error(generation, e.to_string());
                }
            }

            self.shared.set_state(generation, ConnectionState::Disconnected);
            tracing::info!("WebSocket disconnected");
            self.discard_pending();

            let attempt = self.shared.retries.load(Ordering::SeqCst);
            if attempt >= self.config.max_retries {
                tracing::warn!("Max retries reached. WebSocket will not reconnect.");
                self.shared.set_error(generation, SERVER_UNREACHABLE);
                self.shared.set_state(
                    generation,
                    ConnectionState::Failed(SERVER_UNREACHABLE.to_string()),
                );
                return;
            }

            let delay = self.config.backoff(attempt);
            tracing::info!("Attempting to reconnect WebSocket in {:?}...", delay);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            let stopped = loop {
                tokio::select! {
                    _ = &mut self.shutdown => break true,
                    _ = &mut sleep => break false,
                    Some(pending) = self.outbound.recv() => reject(pending),
                }
            };
            if stopped {
                break;
            }
            if self.shared.is_current(generation) {
                self.shared.retries.fetch_add(1, Ordering::SeqCst);
            }
        }

        self.shared.set_state(generation, ConnectionState::Disconnected);
        tracing::debug!("Connection driver for generation {} stopped", generation);
    }

    async fn pump(&mut self, link: Link) -> LinkEnd {
        let Link {
            mut sink,
            mut stream,
        } = link;

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    match tokio::time::timeout(Duration::from_secs(1), sink.close()).await {
                        Ok(Err(e)) => tracing::debug!("Error closing WebSocket: {}", e),
                        Err(_) => tracing::debug!("Timed out closing WebSocket"),
                        Ok(Ok(())) => {}
                    }
                    return LinkEnd::Shutdown;
                }
                Some((payload, reply)) = self.outbound.recv() => {
                    let result = match sink.send(payload).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            tracing::error!("WebSocket error: {}", e);
                            self.shared.set_error(self.generation, e.to_string());
                            Err(ConnectionError::SendFailed(e.to_string()))
                        }
                    };
                    let _ = reply.send(result);
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        self.router.deliver(&text).await;
                    }
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        self.shared.set_error(self.generation, e.to_string());
                    }
                    None => return LinkEnd::Closed,
                }
            }
        }
    }

    /// Payloads queued for a link that has since closed are not replayed
    fn discard_pending(&mut self) {
        while let Ok(pending) = self.outbound.try_recv() {
            reject(pending);
        }
    }
}

fn reject((payload, reply): Outbound) {
    tracing::warn!("Dropping unsent message after disconnect: {}", payload);
    let _ = reply.send(Err(ConnectionError::NotConnected));
}
