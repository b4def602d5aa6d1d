//! WebSocket session
//!
//! One persistent socket per client instance. Inbound binary frames are
//! decoded into envelopes and handed to the dispatcher; outbound
//! envelopes from the pipelines funnel through a bounded channel into
//! the single socket writer, which is this loop.

use anyhow::{Context, Result};
use burrow_shared::protocol::MAX_MESSAGE_SIZE;
use burrow_shared::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::dispatcher::EventDispatcher;

/// Outbound envelopes buffered ahead of the socket writer
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Cheap clonable handle the dispatcher and pipelines use to reach the
/// socket writer.
#[derive(Clone)]
pub struct SessionHandle {
    id: Arc<str>,
    tx: mpsc::Sender<Envelope>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>, tx: mpsc::Sender<Envelope>) -> Self {
        Self { id: id.into().into(), tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue an envelope for the socket. The bounded channel is the
    /// backpressure; failures are logged and never surfaced to callers.
    pub async fn send(&self, envelope: Envelope) {
        debug!(
            session = %self.id,
            event = ?envelope.event,
            request_id = envelope.request_id.as_deref().unwrap_or(""),
            "sending"
        );
        if let Err(err) = self.tx.send(envelope).await {
            error!(session = %self.id, error = %err, "failed to queue outbound envelope");
        }
    }
}

/// Run one tunnel session until the peer closes it or ctrl-c.
pub async fn run_session(server_url: &str, dispatcher: Arc<EventDispatcher>) -> Result<()> {
    info!("Connecting to tunnel server: {}", server_url);

    let (ws_stream, _) = connect_async(server_url)
        .await
        .context("Failed to connect to tunnel server")?;
    let (mut write, mut read) = ws_stream.split();

    let session_id = gen_session_id();
    let (tx, mut outbound) = mpsc::channel::<Envelope>(OUTBOUND_CHANNEL_CAPACITY);
    let session = SessionHandle::new(session_id.clone(), tx);
    info!(session = %session_id, "tunnel session established");

    loop {
        tokio::select! {
            envelope = outbound.recv() => {
                // The session keeps one sender alive, so this is always Some
                let Some(envelope) = envelope else { break };
                match serde_json::to_vec(&envelope) {
                    Ok(bytes) => {
                        if let Err(err) = write.send(Message::Binary(bytes)).await {
                            error!(session = %session_id, error = %err, "socket write failed");
                            break;
                        }
                    }
                    Err(err) => {
                        error!(session = %session_id, error = %err, "failed to encode envelope");
                    }
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > MAX_MESSAGE_SIZE {
                            warn!(session = %session_id, len = data.len(), "oversized frame dropped");
                            continue;
                        }
                        match serde_json::from_slice::<Envelope>(&data) {
                            Ok(envelope) => dispatcher.handle(&session, envelope),
                            Err(err) => warn!(session = %session_id, error = %err, "undecodable frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await.ok();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session = %session_id, "connection closed");
                        break;
                    }
                    Some(Err(err)) => {
                        error!(session = %session_id, error = %err, "WebSocket error");
                        return Err(err.into());
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                write.send(Message::Close(None)).await.ok();
                break;
            }
        }
    }

    Ok(())
}

fn gen_session_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("s{:x}", ts)
}
