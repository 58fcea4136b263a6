//! Single request/response exchange over a dedicated connection.

use futures::{SinkExt, StreamExt};
use std::time::Duration;

use crate::connection::{Link, Transport};
use crate::error::{ChatError, ChatResult, TransportError};
use crate::protocol::{InboundEnvelope, OutboundEnvelope};

/// Open a connection, send `envelope`, and return the full reply text once
/// the terminal frame arrives. The connection is closed afterwards.
pub async fn complete_once(
    transport: &dyn Transport,
    url: &str,
    envelope: &OutboundEnvelope,
    timeout: Duration,
) -> ChatResult<String> {
    tokio::time::timeout(timeout, exchange(transport, url, envelope))
        .await
        .map_err(|_| ChatError::Timeout(timeout))?
}

async fn exchange(
    transport: &dyn Transport,
    url: &str,
    envelope: &OutboundEnvelope,
) -> ChatResult<String> {
    let payload = serde_json::to_string(envelope)?;
    let Link {
        mut sink,
        mut stream,
    } = transport.open(url).await?;
    sink.send(payload).await?;

    let mut accumulated = String::new();
    while let Some(frame) = stream.next().await {
        let frame = frame?;
        let reply: InboundEnvelope =
            serde_json::from_str(&frame).map_err(|e| ChatError::MalformedFrame(e.to_string()))?;

        if !reply.is_success() {
            let _ = sink.close().await;
            return Err(ChatError::Protocol {
                code: reply.header.code,
                message: reply.header.message,
            });
        }

        if let Some(choices) = reply.choices() {
            for fragment in &choices.text {
                accumulated.push_str(&fragment.content);
            }
        }

        if reply.is_terminal() {
            let _ = sink.close().await;
            return Ok(accumulated);
        }
    }

    let reason = if accumulated.is_empty() {
        "connection closed without receiving data"
    } else {
        "connection closed before the response completed"
    };
    Err(TransportError::Receive(reason.to_string()).into())
}
