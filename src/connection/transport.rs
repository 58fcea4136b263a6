use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::error::TransportError;

/// Outgoing half of an open connection
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Incoming half of an open connection; the stream ends when the peer closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One open connection, split into its two directions
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens text-frame connections to a URL
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}

/// Websocket transport backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Open(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|text: String| {
                futures::future::ready(Ok::<_, TransportError>(Message::Text(text.into())))
            });

        // Only text frames reach the caller. A close frame ends the stream,
        // and so does the first receive error since tungstenite cannot
        // recover the socket after one.
        let stream = read
            .scan(false, |failed, item| {
                if *failed {
                    return futures::future::ready(None);
                }
                let next = match item {
                    Ok(Message::Text(text)) => Some(Some(Ok(text.to_string()))),
                    Ok(Message::Close(_)) => None,
                    Ok(_) => Some(None),
                    Err(e) => {
                        *failed = true;
                        Some(Some(Err(TransportError::Receive(e.to_string()))))
                    }
                };
                futures::future::ready(next)
            })
            .filter_map(futures::future::ready);

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

pub mod memory {
    //! In-process transport: every `open` hands the peer side of a channel
    //! pair to a [`MemoryServer`]. Opens can be scripted to fail.

    use super::*;
    use futures::channel::mpsc as fmpsc;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Script {
        /// Outcome of upcoming opens; `false` refuses. Empty means accept.
        outcomes: VecDeque<bool>,
        refuse_all: bool,
        attempts: Vec<(String, Instant)>,
    }

    #[derive(Clone)]
    pub struct MemoryTransport {
        script: Arc<Mutex<Script>>,
        peers: mpsc::UnboundedSender<MemoryPeer>,
    }

    /// Receives the server side of every connection accepted by the transport
    pub struct MemoryServer {
        peers: mpsc::UnboundedReceiver<MemoryPeer>,
    }

    /// Server side of one in-memory connection
    pub struct MemoryPeer {
        pub url: String,
        received: fmpsc::UnboundedReceiver<String>,
        outgoing: fmpsc::UnboundedSender<Result<String, TransportError>>,
    }

    impl MemoryTransport {
        pub fn new() -> (Self, MemoryServer) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Self {
                    script: Arc::new(Mutex::new(Script::default())),
                    peers: tx,
                },
                MemoryServer { peers: rx },
            )
        }

        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Refuse the next `count` opens
        pub fn fail_next(&self, count: usize) {
            let mut script = self.script();
            script.outcomes.extend(std::iter::repeat(false).take(count));
        }

        /// Refuse every open from now on
        pub fn refuse_all(&self) {
            self.script().refuse_all = true;
        }

        pub fn accept_all(&self) {
            let mut script = self.script();
            script.refuse_all = false;
            script.outcomes.clear();
        }

        /// Every open attempt so far, with the (tokio) time it happened
        pub fn attempts(&self) -> Vec<(String, Instant)> {
            self.script().attempts.clone()
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn open(&self, url: &str) -> Result<Link, TransportError> {
            let accept = {
                let mut script = self.script();
                script.attempts.push((url.to_string(), Instant::now()));
                let scripted = script.outcomes.pop_front().unwrap_or(true);
                scripted && !script.refuse_all
            };
            if !accept {
                return Err(TransportError::Open(format!("connection to {} refused", url)));
            }

            let (client_tx, server_rx) = fmpsc::unbounded::<String>();
            let (server_tx, client_rx) = fmpsc::unbounded::<Result<String, TransportError>>();

            let peer = MemoryPeer {
                url: url.to_string(),
                received: server_rx,
                outgoing: server_tx,
            };
            self.peers
                .send(peer)
                .map_err(|_| TransportError::Open("memory server is gone".to_string()))?;

            Ok(Link {
                sink: Box::pin(client_tx.sink_map_err(|e| TransportError::Send(e.to_string()))),
                stream: Box::pin(client_rx),
            })
        }
    }

    impl MemoryServer {
        /// Wait for the next accepted connection
        pub async fn accept(&mut self) -> Option<MemoryPeer> {
            self.peers.recv().await
        }
    }

    impl MemoryPeer {
        /// Push a text frame to the client; false once the client is gone
        pub fn push(&self, frame: impl Into<String>) -> bool {
            self.outgoing.unbounded_send(Ok(frame.into())).is_ok()
        }

        /// Surface a receive error on the client side
        pub fn push_error(&self, message: impl Into<String>) -> bool {
            self.outgoing
                .unbounded_send(Err(TransportError::Receive(message.into())))
                .is_ok()
        }

        /// Next frame the client sent, or `None` once it closed its side
        pub async fn next_sent(&mut self) -> Option<String> {
            self.received.next().await
        }

        /// Close from the server side
        pub fn close(self) {
            drop(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryTransport;
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_round_trip() {
        let (transport, mut server) = MemoryTransport::new();
        let mut link = transport.open("mem://chat").await.unwrap();
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.url, "mem://chat");

        link.sink.send("ping".to_string()).await.unwrap();
        assert_eq!(peer.next_sent().await.as_deref(), Some("ping"));

        assert!(peer.push("pong"));
        assert_eq!(link.stream.next().await, Some(Ok("pong".to_string())));

        peer.close();
        assert_eq!(link.stream.next().await, None);
    }

    #[tokio::test]
    async fn test_memory_transport_scripted_failures() {
        let (transport, _server) = MemoryTransport::new();
        transport.fail_next(1);

        assert!(matches!(
            transport.open("mem://chat").await,
            Err(TransportError::Open(_))
        ));
        assert!(transport.open("mem://chat").await.is_ok());
        assert_eq!(transport.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_client_close_ends_peer_stream() {
        let (transport, mut server) = MemoryTransport::new();
        let mut link = transport.open("mem://chat").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        link.sink.close().await.unwrap();
        assert_eq!(peer.next_sent().await, None);
    }
}
